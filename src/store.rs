//! 工作区文件存储
//!
//! 限定在单个工作区根目录内的读写，每次读取都从磁盘重新计算指纹，不做缓存。

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::WorkspaceFilter;
use crate::error::{Error, Result};
use crate::hashing::content_hash;
use crate::protocol::slash_path;

/// 某一时刻读取到的文件（内容与指纹成对出现）
#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    pub path: PathBuf,
    pub content: Vec<u8>,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
}

impl WorkspaceFile {
    /// 文本内容
    ///
    /// 非 UTF-8 文件返回 `InvalidData`，避免返回的文本与指纹对应的字节不一致。
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.content.clone())
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

/// 文件列表条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// `/` 分隔的相对路径
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub content_hash: String,
}

/// 单个工作区根目录的文件存储
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    filter: WorkspaceFilter,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, filter: WorkspaceFilter) -> Self {
        Self {
            root: root.into(),
            filter,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filter(&self) -> &WorkspaceFilter {
        &self.filter
    }

    /// 把调用方给出的相对路径解析为根目录内的绝对路径
    ///
    /// 含 `..`、绝对路径、盘符前缀，或经符号链接落到根目录外的路径一律拒绝。
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::PathRejected);
                }
            }
        }

        let candidate = self.root.join(relative);
        self.confine(&candidate)?;
        Ok(candidate)
    }

    /// 最深的已存在祖先经 canonicalize 后必须仍在根目录内
    fn confine(&self, candidate: &Path) -> Result<()> {
        // 根目录不存在时由后续读写报告 NotFound
        let Ok(root) = self.root.canonicalize() else {
            return Ok(());
        };

        let mut probe = candidate;
        loop {
            match probe.canonicalize() {
                Ok(real) if real.starts_with(&root) => return Ok(()),
                Ok(_) => return Err(Error::PathRejected),
                Err(_) => match probe.parent() {
                    Some(parent) => probe = parent,
                    None => return Err(Error::PathRejected),
                },
            }
        }
    }

    /// 递归列出允许范围内的文件相对路径（不读取内容）
    pub fn list_paths(&self) -> Result<Vec<PathBuf>> {
        self.list_paths_under("")
    }

    /// 只列出某个子目录下的文件，返回的路径仍相对根目录
    ///
    /// 子目录本身被过滤或已不存在时返回空列表。
    pub fn list_paths_under(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(Error::NotFound);
        }

        let dir = dir.as_ref();
        let start = self.resolve(dir)?;
        if !self.filter.accepts_dir(dir) || !start.is_dir() {
            return Ok(Vec::new());
        }

        let root = self.root.clone();
        let filter = self.filter.clone();
        let walker = WalkDir::new(&start)
            .min_depth(1)
            .into_iter()
            .filter_entry(move |entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                filter.accepts_dir(relative)
            });

        let mut paths = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if self.filter.accepts_file(relative) {
                paths.push(relative.to_path_buf());
            }
        }

        Ok(paths)
    }

    /// 递归列出允许范围内的文件及其指纹（顺序无意义）
    pub fn list(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for relative in self.list_paths()? {
            // 遍历期间文件可能被 agent 删除，跳过即可
            match read_file(&self.root.join(&relative)) {
                Ok(file) => entries.push(FileEntry {
                    path: slash_path(&relative),
                    size: file.content.len() as u64,
                    last_modified: file.last_modified,
                    content_hash: file.content_hash,
                }),
                Err(e) => {
                    tracing::debug!("Skipping {:?} during listing: {}", relative, e);
                }
            }
        }
        Ok(entries)
    }

    /// 读取文件内容与当前指纹
    pub fn read(&self, relative: impl AsRef<Path>) -> Result<WorkspaceFile> {
        let relative = relative.as_ref();
        let absolute = self.resolve(relative)?;
        let mut file = read_file(&absolute)?;
        file.path = relative.to_path_buf();
        Ok(file)
    }

    /// 原子写入（同目录临时文件 + rename），返回新内容的指纹
    pub fn write(&self, relative: impl AsRef<Path>, content: &[u8]) -> Result<String> {
        let target = self.resolve(relative)?;
        let (Some(parent), Some(file_name)) = (target.parent(), target.file_name()) else {
            return Err(Error::PathRejected);
        };
        if target == self.root {
            return Err(Error::PathRejected);
        }
        if !self.root.is_dir() {
            return Err(Error::NotFound);
        }

        fs::create_dir_all(parent)?;

        // 隐藏文件名，监听器不会为它产生事件
        let tmp_path = parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));

        let written = (|| -> io::Result<()> {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(content)?;
            tmp.sync_all()?;
            // rename 会换掉 inode，沿用原文件的权限位
            if let Ok(existing) = fs::metadata(&target) {
                fs::set_permissions(&tmp_path, existing.permissions())?;
            }
            fs::rename(&tmp_path, &target)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::Io(e));
        }

        tracing::debug!("📝 Wrote {} bytes: {:?}", content.len(), target.file_name());
        Ok(content_hash(content))
    }
}

/// 读取普通文件（目录或不存在都视为 NotFound）
fn read_file(path: &Path) -> Result<WorkspaceFile> {
    let metadata = fs::metadata(path).map_err(Error::from_io)?;
    if !metadata.is_file() {
        return Err(Error::NotFound);
    }

    let content = fs::read(path).map_err(Error::from_io)?;
    let last_modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(WorkspaceFile {
        path: path.to_path_buf(),
        content_hash: content_hash(&content),
        content,
        last_modified,
    })
}
