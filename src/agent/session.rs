//! 推送会话
//!
//! 每个浏览器连接一个会话：订阅 agent 的 topic，把事件编码成 SSE 帧写出，并定时发心跳。
//! 对端断开、写失败、服务关闭都会走同一个 `teardown`，订阅只释放一次；心跳计时器只活在推送循环里。
//! 会话不做重连，由浏览器自行重连。

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::bus::{EventBus, EventReceiver, Subscription};
use crate::config::WorkspaceConfig;
use crate::protocol::Frame;

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 关闭信号（对端断开连接或服务关闭）
    Cancelled,
    /// 写失败（连接已断）
    WriteFailed,
    /// 总线侧已移除订阅
    Unsubscribed,
}

/// 推送会话
pub struct StreamSession {
    agent_id: String,
    subscription: Subscription,
    events: EventReceiver,
    heartbeat_period: Duration,
}

impl StreamSession {
    /// 打开会话：立即订阅，不发送任何历史事件
    pub fn open(bus: Arc<EventBus>, agent_id: &str, config: &WorkspaceConfig) -> Self {
        let (handle, events) = bus.subscribe_channel(agent_id, config.subscriber_buffer);

        Self {
            agent_id: agent_id.to_string(),
            subscription: Subscription::new(bus, handle),
            events,
            heartbeat_period: config.heartbeat_interval,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// 是否仍持有订阅
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_active()
    }

    /// 运行会话直到连接结束
    ///
    /// `shutdown` 被取消即结束；HTTP 层在响应体被丢弃（对端断开）时取消它。
    pub async fn run<W>(mut self, mut writer: W, shutdown: CancellationToken) -> SessionEnd
    where
        W: AsyncWrite + Unpin,
    {
        tracing::debug!("📥 Stream opened: agent={}", self.agent_id);

        let connected = Frame::Connected {
            agent_id: self.agent_id.clone(),
        };
        let end = if write_frame(&mut writer, &connected).await.is_err() {
            SessionEnd::WriteFailed
        } else {
            self.pump(&mut writer, &shutdown).await
        };

        self.teardown();
        let _ = writer.shutdown().await;

        tracing::debug!("📤 Stream closed: agent={}, reason={:?}", self.agent_id, end);
        end
    }

    async fn pump<W>(&mut self, writer: &mut W, shutdown: &CancellationToken) -> SessionEnd
    where
        W: AsyncWrite + Unpin,
    {
        let mut heartbeat = heartbeat_timer(self.heartbeat_period);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return SessionEnd::Cancelled,

                event = self.events.recv() => {
                    let Some(event) = event else {
                        return SessionEnd::Unsubscribed;
                    };
                    if write_frame(writer, &Frame::from(&event)).await.is_err() {
                        return SessionEnd::WriteFailed;
                    }
                }

                _ = heartbeat.tick() => {
                    if write_frame(writer, &Frame::Heartbeat).await.is_err() {
                        return SessionEnd::WriteFailed;
                    }
                }
            }
        }
    }

    /// 释放订阅（幂等）
    fn teardown(&mut self) {
        self.subscription.cancel();
        self.events.close();
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn heartbeat_timer(period: Duration) -> Interval {
    // 第一次心跳在一个周期之后
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// 写出一帧；编码失败的事件跳过，只有写失败才返回错误
async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = match frame.encode() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to encode frame: {}", e);
            return Ok(());
        }
    };
    writer.write_all(encoded.as_bytes()).await?;
    writer.flush().await
}
