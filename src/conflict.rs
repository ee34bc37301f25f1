//! 乐观并发写入
//!
//! 先比较指纹再写入（compare-and-swap）。指纹不一致时返回冲突，双方内容原样交给调用方，
//! 由人决定保留哪一份；这里不做任何自动合并。
//!
//! 读-比较-写三步之间没有互斥：两个写入者可能都通过了对同一旧指纹的检查。agent 和人的写入
//! 节奏都很慢，这个窄窗口是可接受的已知限制。

use std::path::Path;

use crate::error::Result;
use crate::hashing::content_hash;
use crate::protocol::ConflictResponse;
use crate::store::FileStore;

/// 冲突记录（只在单次请求内存在）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// 调用方提交的内容
    pub submitted_content: String,
    /// 磁盘上的当前内容
    pub current_content: String,
    /// 当前内容的指纹
    pub current_hash: String,
}

/// 冲突后的处理方式（由客户端发起）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 保留我的：以当前指纹为期望值重新提交原内容
    Retry { content: String, expected_hash: String },
    /// 保留对方的：丢弃本地修改，以当前内容为新基线
    Adopt { content: String, content_hash: String },
}

impl ConflictRecord {
    /// "Keep mine"
    pub fn keep_mine(self) -> Resolution {
        Resolution::Retry {
            content: self.submitted_content,
            expected_hash: self.current_hash,
        }
    }

    /// "Keep theirs"
    pub fn keep_theirs(self) -> Resolution {
        Resolution::Adopt {
            content: self.current_content,
            content_hash: self.current_hash,
        }
    }

    pub fn to_response(&self) -> ConflictResponse {
        ConflictResponse {
            your_content: self.submitted_content.clone(),
            current_content: self.current_content.clone(),
            current_hash: self.current_hash.clone(),
        }
    }
}

/// 写入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 已写入
    Accepted { content_hash: String },
    /// 指纹不一致，未写入
    Conflict(ConflictRecord),
}

/// compare-and-swap 写入器
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    store: FileStore,
}

impl ConflictResolver {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// 尝试写入
    ///
    /// 文件不存在时返回 `NotFound`，路径越界返回 `PathRejected`，两种情况都不会写入。
    /// 冲突时磁盘内容不是 UTF-8 则返回 `Io`（`InvalidData`），不把有损转换后的文本交给调用方。
    pub fn attempt_write(
        &self,
        relative: impl AsRef<Path>,
        new_content: &str,
        expected_hash: &str,
    ) -> Result<WriteOutcome> {
        let relative = relative.as_ref();
        let current = self.store.read(relative)?;

        if current.content_hash != expected_hash {
            tracing::info!(
                "⚔️ Write conflict: {:?} (expected={}, current={})",
                relative,
                short_hash(expected_hash),
                short_hash(&current.content_hash)
            );
            return Ok(WriteOutcome::Conflict(ConflictRecord {
                submitted_content: new_content.to_string(),
                current_content: current.text()?,
                current_hash: current.content_hash,
            }));
        }

        let written_hash = self.store.write(relative, new_content.as_bytes())?;
        debug_assert_eq!(written_hash, content_hash(new_content));

        tracing::debug!("✅ Write accepted: {:?} → {}", relative, short_hash(&written_hash));
        Ok(WriteOutcome::Accepted {
            content_hash: written_hash,
        })
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
