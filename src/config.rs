//! 工作区配置

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// 默认工作区根目录
pub const DEFAULT_BASE_DIR: &str = "/data/workspaces";

/// 默认监听地址
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// 默认允许的文件扩展名
pub const DEFAULT_EXTENSIONS: &[&str] = &["md", "yaml", "yml", "json", "txt"];

/// 默认忽略的依赖/缓存目录（隐藏目录始终忽略）
pub const DEFAULT_IGNORED_DIRS: &[&str] = &["node_modules", "__pycache__"];

/// 工作区服务配置
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// 所有 agent 工作区的父目录，每个 agent 的根为 `<base_dir>/<agent_id>`
    pub base_dir: PathBuf,
    /// 启动时即开始监听的 agent
    pub agents: Vec<String>,
    /// HTTP 监听地址
    pub bind_addr: String,
    /// 允许监听/列出的扩展名（不含点，小写）
    pub extensions: Vec<String>,
    /// 忽略的目录名
    pub ignored_dirs: Vec<String>,
    /// 最大递归深度（根目录下的目录层数）
    pub max_depth: usize,
    /// 写入稳定窗口：路径在此时间内无新事件才视为写完
    pub stability_window: Duration,
    /// 稳定性采样间隔
    pub poll_interval: Duration,
    /// SSE 心跳间隔
    pub heartbeat_interval: Duration,
    /// 每个订阅的通道容量
    pub subscriber_buffer: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            agents: vec!["openclaw".to_string()],
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|d| d.to_string()).collect(),
            max_depth: 3,
            stability_window: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            subscriber_buffer: 100,
        }
    }
}

impl WorkspaceConfig {
    /// 指定根目录的配置，其余取默认值
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// 从环境变量创建配置
    ///
    /// - `WORKSPACE_BASE_PATH`: 工作区父目录
    /// - `WORKSPACE_AGENTS`: 启动时监听的 agent，逗号分隔
    /// - `WORKSPACE_BIND_ADDR`: HTTP 监听地址
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(base) = std::env::var("WORKSPACE_BASE_PATH") {
            if !base.trim().is_empty() {
                config.base_dir = PathBuf::from(base);
            }
        }

        if let Ok(agents) = std::env::var("WORKSPACE_AGENTS") {
            config.agents = agents
                .split(',')
                .map(|a| a.trim())
                .filter(|a| !a.is_empty())
                .map(|a| a.to_string())
                .collect();
        }

        if let Ok(addr) = std::env::var("WORKSPACE_BIND_ADDR") {
            if !addr.trim().is_empty() {
                config.bind_addr = addr.trim().to_string();
            }
        }

        config
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.extensions.is_empty() {
            return Err(Error::Config("extension allow-list is empty".to_string()));
        }
        if self.poll_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(Error::Config("intervals must be non-zero".to_string()));
        }
        if self.subscriber_buffer == 0 {
            return Err(Error::Config("subscriber_buffer must be non-zero".to_string()));
        }
        for agent_id in &self.agents {
            validate_agent_id(agent_id)?;
        }
        Ok(())
    }

    /// agent 的工作区根目录
    pub fn workspace_root(&self, agent_id: &str) -> Result<PathBuf> {
        validate_agent_id(agent_id)?;
        Ok(self.base_dir.join(agent_id))
    }

    /// 由配置构建文件过滤器
    pub fn filter(&self) -> WorkspaceFilter {
        WorkspaceFilter::new(&self.extensions, &self.ignored_dirs, self.max_depth)
    }
}

/// agent id 只能是单个普通路径段，且不能是隐藏名
fn validate_agent_id(agent_id: &str) -> Result<()> {
    let mut components = Path::new(agent_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None)
            if !name.to_string_lossy().starts_with('.') && !agent_id.contains('\\') =>
        {
            Ok(())
        }
        _ => Err(Error::InvalidAgentId),
    }
}

/// 工作区文件过滤规则（Watcher 与 FileStore 共用）
#[derive(Debug, Clone)]
pub struct WorkspaceFilter {
    extensions: HashSet<String>,
    ignored_dirs: HashSet<String>,
    max_depth: usize,
}

impl WorkspaceFilter {
    pub fn new<E: AsRef<str>, D: AsRef<str>>(extensions: &[E], ignored_dirs: &[D], max_depth: usize) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            ignored_dirs: ignored_dirs.iter().map(|d| d.as_ref().to_string()).collect(),
            max_depth,
        }
    }

    /// 单个路径段是否应忽略
    pub fn is_ignored_name(&self, name: &str) -> bool {
        name.starts_with('.') || self.ignored_dirs.contains(name)
    }

    /// 根目录下的相对目录是否应进入遍历
    pub fn accepts_dir(&self, relative: &Path) -> bool {
        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    if self.is_ignored_name(&name.to_string_lossy()) {
                        return false;
                    }
                    depth += 1;
                }
                Component::CurDir => {}
                _ => return false,
            }
        }
        depth <= self.max_depth
    }

    /// 相对路径指向的文件是否在允许范围内
    pub fn accepts_file(&self, relative: &Path) -> bool {
        let ext_allowed = relative
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false);
        if !ext_allowed {
            return false;
        }

        let Some(file_name) = relative.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if file_name.starts_with('.') {
            return false;
        }

        match relative.parent() {
            Some(parent) => self.accepts_dir(parent),
            None => true,
        }
    }
}
