//! 内容指纹
//!
//! SHA-256 十六进制串，是读写并发控制的唯一令牌。

use sha2::{Digest, Sha256};

/// 计算内容指纹
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    hex::encode(hasher.finalize())
}
