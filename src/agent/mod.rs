//! Agent 模块 - 文件监听 + 事件总线 + 实时推送
//!
//! 负责：
//! - 监听 agent 工作区文件变化（Watcher）
//! - 按 agent 扇出变更事件（EventBus）
//! - 为每个浏览器连接维持推送流（StreamSession）
//! - HTTP 接口：推送订阅、文件读写（`server` feature）

pub mod bus;
pub mod session;
pub mod watcher;

#[cfg(feature = "server")]
mod handler;
#[cfg(feature = "server")]
mod server;

pub use bus::{EventBus, EventReceiver, EventSender, Subscription, SubscriptionHandle, SubscriptionId};
pub use session::{SessionEnd, StreamSession};
pub use watcher::WatcherRegistry;

#[cfg(feature = "server")]
pub use handler::{router, Handler, SERVER_VERSION};
#[cfg(feature = "server")]
pub use server::WorkspaceServer;
