//! 事件总线
//!
//! 按 topic（agent id）维护订阅表，把 Watcher 产生的事件扇出给所有订阅者。
//! 发送是非阻塞的 fire-and-forget：慢订阅者丢消息，已关闭的订阅者被移除，都不影响其他订阅者。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::ChangeEvent;

/// 订阅 ID
pub type SubscriptionId = u64;

/// 事件发送通道
pub type EventSender = mpsc::Sender<ChangeEvent>;

/// 事件接收通道
pub type EventReceiver = mpsc::Receiver<ChangeEvent>;

/// 订阅句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: String,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// 事件总线
///
/// 进程内只构造一个，以 `Arc<EventBus>` 传给 Watcher 和 StreamSession；测试可各自构造。
pub struct EventBus {
    /// topic → (订阅 ID → 发送通道)
    topics: RwLock<HashMap<String, HashMap<SubscriptionId, EventSender>>>,
    /// 下一个订阅 ID
    next_id: AtomicU64,
}

impl EventBus {
    /// 创建新的总线
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册订阅者
    pub fn subscribe(&self, topic: &str, sender: EventSender) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(id, sender);

        tracing::debug!("📡 Subscribed: topic={}, id={}", topic, id);
        SubscriptionHandle {
            topic: topic.to_string(),
            id,
        }
    }

    /// 创建有界通道并订阅
    pub fn subscribe_channel(&self, topic: &str, buffer: usize) -> (SubscriptionHandle, EventReceiver) {
        let (tx, rx) = mpsc::channel(buffer);
        (self.subscribe(topic, tx), rx)
    }

    /// 取消订阅，返回本次调用是否真正移除了订阅
    ///
    /// 可重复调用；与 publish 并发调用也安全。
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.remove(&handle.topic, &[handle.id]) > 0;
        if removed {
            tracing::debug!("📡 Unsubscribed: topic={}, id={}", handle.topic, handle.id);
        }
        removed
    }

    /// 发布事件给 topic 下所有订阅者（非阻塞），返回成功投递数
    pub fn publish(&self, topic: &str, event: ChangeEvent) -> usize {
        // 只在锁内 clone 发送端，发送在锁外进行
        let targets: Vec<(SubscriptionId, EventSender)> = {
            let topics = self.topics.read();
            match topics.get(topic) {
                Some(subs) => subs.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => Vec::new(),
            }
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: topic={}", topic);
            return 0;
        }

        tracing::debug!(
            "📡 Publishing: topic={}, path={:?}, kind={:?}, subscribers={}",
            topic,
            event.relative_path,
            event.kind,
            targets.len()
        );

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("📡 Channel full, dropping event: topic={}, id={}", topic, id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("📡 Channel closed, removing subscriber: topic={}, id={}", topic, id);
                    closed.push(id);
                }
            }
        }

        if !closed.is_empty() {
            self.remove(topic, &closed);
        }

        delivered
    }

    /// 某个 topic 的订阅数
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// 所有 topic 的订阅数
    pub fn topic_counts(&self) -> HashMap<String, usize> {
        self.topics
            .read()
            .iter()
            .map(|(topic, subs)| (topic.clone(), subs.len()))
            .collect()
    }

    /// 总订阅数
    pub fn subscription_count(&self) -> usize {
        self.topics.read().values().map(|s| s.len()).sum()
    }

    /// 移除订阅，topic 变空时一并删除
    fn remove(&self, topic: &str, ids: &[SubscriptionId]) -> usize {
        let mut topics = self.topics.write();
        let Some(subs) = topics.get_mut(topic) else {
            return 0;
        };
        let removed = ids.iter().filter(|id| subs.remove(id).is_some()).count();
        if subs.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

/// 订阅守卫：`cancel` 或 drop 时取消订阅，且只取消一次
pub struct Subscription {
    bus: Arc<EventBus>,
    handle: Option<SubscriptionHandle>,
}

impl Subscription {
    pub fn new(bus: Arc<EventBus>, handle: SubscriptionHandle) -> Self {
        Self {
            bus,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.handle.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// 幂等
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.bus.unsubscribe(&handle);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeKind;

    fn event(path: &str) -> ChangeEvent {
        ChangeEvent::new("demo", path, ChangeKind::Modified, Some("h".to_string()))
    }

    #[test]
    fn test_publish_is_topic_scoped() {
        let bus = EventBus::new();
        let (_h1, mut rx1) = bus.subscribe_channel("demo", 10);
        let (_h2, mut rx2) = bus.subscribe_channel("other", 10);

        assert_eq!(bus.publish("demo", event("NOTES.md")), 1);

        assert_eq!(rx1.try_recv().unwrap().relative_path, std::path::PathBuf::from("NOTES.md"));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_fanout_isolation_when_one_sink_fails() {
        let bus = EventBus::new();
        let (_h1, rx1) = bus.subscribe_channel("demo", 10);
        let (_h2, mut rx2) = bus.subscribe_channel("demo", 10);

        // 订阅者 1 的连接已经断开
        drop(rx1);

        assert_eq!(bus.publish("demo", event("NOTES.md")), 1);
        assert!(rx2.try_recv().is_ok());

        // 失败的订阅者被移除
        assert_eq!(bus.subscriber_count("demo"), 1);
    }

    #[test]
    fn test_full_channel_drops_without_unsubscribing() {
        let bus = EventBus::new();
        let (_h1, mut rx1) = bus.subscribe_channel("demo", 1);
        let (_h2, mut rx2) = bus.subscribe_channel("demo", 10);

        bus.publish("demo", event("a.md"));
        bus.publish("demo", event("b.md"));

        assert_eq!(rx1.try_recv().unwrap().relative_path, std::path::PathBuf::from("a.md"));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().relative_path, std::path::PathBuf::from("a.md"));
        assert_eq!(rx2.try_recv().unwrap().relative_path, std::path::PathBuf::from("b.md"));
        assert_eq!(bus.subscriber_count("demo"), 2);
    }

    #[test]
    fn test_per_subscriber_order() {
        let bus = EventBus::new();
        let (_h, mut rx) = bus.subscribe_channel("demo", 10);

        for name in ["1.md", "2.md", "3.md"] {
            bus.publish("demo", event(name));
        }

        let order: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.relative_path)
            .collect();
        assert_eq!(
            order,
            vec![
                std::path::PathBuf::from("1.md"),
                std::path::PathBuf::from("2.md"),
                std::path::PathBuf::from("3.md")
            ]
        );
    }

    #[test]
    fn test_unsubscribe_is_exactly_once() {
        let bus = EventBus::new();
        let (handle, mut rx) = bus.subscribe_channel("demo", 10);

        assert!(bus.unsubscribe(&handle));
        assert!(!bus.unsubscribe(&handle));
        assert_eq!(bus.subscription_count(), 0);
        assert!(bus.topic_counts().is_empty());

        assert_eq!(bus.publish("demo", event("NOTES.md")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_no_replay_for_late_subscriber() {
        let bus = EventBus::new();
        bus.publish("demo", event("early.md"));

        let (_h, mut rx) = bus.subscribe_channel("demo", 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscription_guard_cancels_on_drop() {
        let bus = EventBus::new();
        let (handle, _rx) = bus.subscribe_channel("demo", 10);

        let mut guard = Subscription::new(bus.clone(), handle);
        assert!(guard.is_active());
        guard.cancel();
        guard.cancel();
        assert!(!guard.is_active());
        assert_eq!(bus.subscriber_count("demo"), 0);

        let (handle, _rx) = bus.subscribe_channel("demo", 10);
        {
            let _guard = Subscription::new(bus.clone(), handle);
            assert_eq!(bus.subscriber_count("demo"), 1);
        }
        assert_eq!(bus.subscriber_count("demo"), 0);
    }

    #[test]
    fn test_concurrent_subscribe_publish_unsubscribe() {
        let bus = EventBus::new();
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let (handle, mut rx) = bus.subscribe_channel("demo", 4);
                        bus.publish("demo", event(&format!("{i}.md")));
                        while rx.try_recv().is_ok() {}
                        bus.unsubscribe(&handle);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(bus.subscription_count(), 0);
    }
}
