//! 推送协议与接口载荷定义
//!
//! 推送通道：`text/event-stream`，每帧 `data: <json>\n\n`，心跳为注释行。

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 变更类型
///
/// 线上名称沿用浏览器端约定：`add` / `change` / `unlink`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "add")]
    Added,
    #[serde(rename = "change")]
    Modified,
    #[serde(rename = "unlink")]
    Removed,
}

/// 归一化的文件变更事件（内部使用，只在传递中存在）
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// 所属 agent（也是总线 topic）
    pub agent_id: String,
    /// 相对工作区根的路径
    pub relative_path: PathBuf,
    pub kind: ChangeKind,
    /// 当前内容指纹；`Removed` 时为 `None`
    pub content_hash: Option<String>,
    /// 事件发出时间（不是磁盘写入时间）
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// 创建事件，`Removed` 事件会丢弃传入的指纹
    pub fn new(
        agent_id: impl Into<String>,
        relative_path: impl Into<PathBuf>,
        kind: ChangeKind,
        content_hash: Option<String>,
    ) -> Self {
        let content_hash = match kind {
            ChangeKind::Removed => None,
            _ => content_hash,
        };
        Self {
            agent_id: agent_id.into(),
            relative_path: relative_path.into(),
            kind,
            content_hash,
            observed_at: Utc::now(),
        }
    }

    /// 转换为推送载荷
    pub fn to_push(&self) -> FileChangePush {
        FileChangePush {
            file_path: slash_path(&self.relative_path),
            event_type: self.kind,
            content_hash: self.content_hash.clone().unwrap_or_default(),
            timestamp: self.observed_at.timestamp_millis(),
        }
    }
}

/// 文件变更推送（Server → 浏览器）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangePush {
    pub file_path: String,
    pub event_type: ChangeKind,
    /// 删除事件为空串
    pub content_hash: String,
    /// 毫秒级 Unix 时间戳
    pub timestamp: i64,
}

/// 控制帧
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlPush {
    Connected {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
}

/// 推送帧
#[derive(Debug, Clone)]
pub enum Frame {
    /// 连接建立
    Connected { agent_id: String },
    /// 文件变更
    Change(FileChangePush),
    /// 保活（客户端只用于判断连接存活）
    Heartbeat,
}

impl Frame {
    /// 编码为 SSE 帧
    pub fn encode(&self) -> Result<String> {
        let frame = match self {
            Frame::Connected { agent_id } => {
                let push = ControlPush::Connected {
                    agent_id: agent_id.clone(),
                };
                format!("data: {}\n\n", serde_json::to_string(&push)?)
            }
            Frame::Change(push) => format!("data: {}\n\n", serde_json::to_string(push)?),
            Frame::Heartbeat => ": heartbeat\n\n".to_string(),
        };
        Ok(frame)
    }
}

impl From<&ChangeEvent> for Frame {
    fn from(event: &ChangeEvent) -> Self {
        Frame::Change(event.to_push())
    }
}

/// 相对路径转为 `/` 分隔的字符串（与平台无关）
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// 文件读取查询参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileQuery {
    /// 缺省时返回文件列表
    pub path: Option<String>,
}

/// 文件内容响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContentResponse {
    pub content: String,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
}

/// 写入请求（Client → Server）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub file_path: String,
    pub content: String,
    /// 客户端开始编辑时拿到的指纹
    pub expected_hash: String,
}

/// 写入成功响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteAccepted {
    pub content_hash: String,
}

/// 写入冲突响应（409）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub your_content: String,
    pub current_content: String,
    pub current_hash: String,
}

/// 通用错误响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
