//! agent-workspace-sync - agent 工作区实时同步
//!
//! 让浏览器查看、编辑正被 agent 进程同时修改的工作区文件。
//!
//! # 核心功能
//!
//! - **文件监听**: 递归监听工作区，防抖后产生归一化的变更事件
//! - **事件总线**: 按 agent 扇出事件，订阅者之间互不影响
//! - **实时推送**: 每个连接一个 SSE 会话，带心跳，断开即清理
//! - **冲突检测**: 基于内容指纹的 compare-and-swap 写入，冲突交给人处理
//!
//! # Feature Flags
//!
//! - `server`: HTTP 层（axum），默认开启
//!
//! # 架构
//!
//! Watcher → EventBus → StreamSession 是一条单向事件链；写入走 FileStore + ConflictResolver，
//! 写入结果再由 Watcher 观察到并推送给其他查看者。服务端不缓存文件内容，每次读取都从磁盘计算指纹。

pub mod agent;
pub mod config;
pub mod conflict;
pub mod error;
pub mod hashing;
pub mod protocol;
pub mod store;

// Re-exports
pub use agent::{EventBus, SessionEnd, StreamSession, Subscription, SubscriptionHandle, WatcherRegistry};
pub use config::{WorkspaceConfig, WorkspaceFilter};
pub use conflict::{ConflictRecord, ConflictResolver, Resolution, WriteOutcome};
pub use error::{Error, Result};
pub use hashing::content_hash;
pub use protocol::{ChangeEvent, ChangeKind, FileChangePush, Frame};
pub use store::{FileEntry, FileStore, WorkspaceFile};

#[cfg(feature = "server")]
pub use agent::WorkspaceServer;
