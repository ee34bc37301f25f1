//! 工作区服务
//!
//! HTTP 服务：SSE 推送 + 文件读写，进程内唯一的事件总线与监听注册表在这里构造

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::bus::EventBus;
use super::handler::{router, Handler};
use super::watcher::WatcherRegistry;
use crate::config::WorkspaceConfig;

/// 工作区服务
pub struct WorkspaceServer {
    config: Arc<WorkspaceConfig>,
    bus: Arc<EventBus>,
    watchers: Arc<WatcherRegistry>,
    handler: Arc<Handler>,
    shutdown: CancellationToken,
}

impl WorkspaceServer {
    /// 创建服务
    pub fn new(config: WorkspaceConfig) -> Result<Self> {
        config.validate().context("配置无效")?;

        let config = Arc::new(config);
        let bus = EventBus::new();
        let watchers = WatcherRegistry::new(bus.clone(), &config);
        let shutdown = CancellationToken::new();
        let handler = Arc::new(Handler::new(
            config.clone(),
            bus.clone(),
            watchers.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            bus,
            watchers,
            handler,
            shutdown,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.watchers
    }

    /// 关闭信号；cancel 后服务退出，所有推送会话结束
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// HTTP 路由
    pub fn router(&self) -> Router {
        router(self.handler.clone())
    }

    /// 启动配置中的 agent 监听，失败只记录日志
    pub async fn start_configured_watches(&self) {
        for agent_id in &self.config.agents {
            let root = match self.config.workspace_root(agent_id) {
                Ok(root) => root,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping agent {}: {}", agent_id, e);
                    continue;
                }
            };
            if let Err(e) = self.watchers.start(&root, agent_id).await {
                tracing::warn!("⚠️ Failed to watch {} at {:?}: {}", agent_id, root, e);
            }
        }
    }

    /// 运行服务直到收到中断信号或关闭信号
    pub async fn run(&self) -> Result<()> {
        self.start_configured_watches().await;

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.bind_addr))?;
        tracing::info!("🚀 Workspace server listening: {}", listener.local_addr()?);
        tracing::info!("📂 Workspace base: {:?}", self.config.base_dir);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("收到中断信号，准备退出...");
                    }
                    _ = shutdown.cancelled() => {}
                }
                // 结束所有推送会话，否则优雅关闭会一直等待长连接
                shutdown.cancel();
            })
            .await
            .context("HTTP 服务异常退出")?;

        self.cleanup();
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        self.watchers.stop_all();
        tracing::info!("🧹 Workspace server cleanup complete");
    }
}
