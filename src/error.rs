//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 路径越界（`..`、绝对路径、符号链接逃逸）
    ///
    /// 消息刻意不包含原始路径，避免给探测者提供信息。
    #[error("路径被拒绝")]
    PathRejected,

    /// 文件不存在
    #[error("文件不存在")]
    NotFound,

    /// 非法的 agent id
    #[error("非法的 agent id")]
    InvalidAgentId,

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 文件监听错误
    #[error("文件监听错误: {0}")]
    Watch(#[from] notify::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否属于瞬时 IO 类错误（监听建立失败、读写失败）
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Watch(_))
    }

    /// 把 `io::ErrorKind::NotFound` 归一为 [`Error::NotFound`]
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Io(err)
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
