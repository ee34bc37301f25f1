//! 文件监听器
//!
//! 每个 agent 一个递归监听，防抖交给 `notify-debouncer-full`：路径在稳定窗口内没有新事件才会交出来。
//! 交出来的事件再归一为 [`ChangeEvent`] 发布到总线：读取文件计算指纹，按已知文件表判断新增、修改还是删除。
//!
//! 目录级事件（整个目录被创建、删除、移入移出）只带目录路径，需要展开成目录下每个文件的事件。

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bus::EventBus;
use crate::config::{WorkspaceConfig, WorkspaceFilter};
use crate::error::{Error, Result};
use crate::hashing::content_hash;
use crate::protocol::{ChangeEvent, ChangeKind};
use crate::store::FileStore;

/// 单个监听的后台任务句柄，drop 时终止任务并释放原生监听
struct WatchHandle {
    root: PathBuf,
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 监听注册表：agent id → 监听
pub struct WatcherRegistry {
    bus: Arc<EventBus>,
    filter: WorkspaceFilter,
    stability_window: Duration,
    poll_interval: Duration,
    watches: Mutex<HashMap<String, WatchHandle>>,
}

impl WatcherRegistry {
    pub fn new(bus: Arc<EventBus>, config: &WorkspaceConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            filter: config.filter(),
            stability_window: config.stability_window,
            poll_interval: config.poll_interval,
            watches: Mutex::new(HashMap::new()),
        })
    }

    /// 开始监听 agent 的工作区
    ///
    /// 同一 agent 重复调用不做任何事，返回 `Ok(false)`。目录不存在或监听建立失败直接返回错误。
    pub async fn start(&self, root: &Path, agent_id: &str) -> Result<bool> {
        if self.is_watching(agent_id) {
            return Ok(false);
        }

        let metadata = tokio::fs::metadata(root).await.map_err(Error::from_io)?;
        if !metadata.is_dir() {
            return Err(Error::NotFound);
        }
        let root = tokio::fs::canonicalize(root).await?;

        // 已有文件不产生事件，只作为新增/修改判断的基线
        let store = FileStore::new(root.clone(), self.filter.clone());
        let seed = store.clone();
        let known = tokio::task::spawn_blocking(move || fingerprint_all(&seed))
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking failed: {}", e))??;

        let (tx, rx) = mpsc::channel::<DebounceEventResult>(100);
        let mut debouncer = new_debouncer(
            self.stability_window,
            Some(self.poll_interval),
            move |result: DebounceEventResult| {
                // 通道关闭说明监听已停止
                let _ = tx.blocking_send(result);
            },
        )?;
        debouncer.watch(&root, RecursiveMode::Recursive)?;

        let watch = WatchLoop {
            agent_id: agent_id.to_string(),
            root: root.clone(),
            store,
            bus: self.bus.clone(),
            known,
        };
        let known_count = watch.known.len();

        let mut watches = self.watches.lock();
        if watches.contains_key(agent_id) {
            // 并发的另一个 start 已经先完成
            return Ok(false);
        }
        let task = tokio::spawn(watch.run(debouncer, rx));
        watches.insert(agent_id.to_string(), WatchHandle { root: root.clone(), task });

        tracing::info!(
            "👁️ Watching workspace: agent={}, root={:?}, files={}",
            agent_id,
            root,
            known_count
        );
        Ok(true)
    }

    /// 停止监听；未在监听时什么也不做
    pub fn stop(&self, agent_id: &str) -> bool {
        let removed = self.watches.lock().remove(agent_id);
        match removed {
            Some(handle) => {
                tracing::info!("🛑 Stopped watching: agent={}, root={:?}", agent_id, handle.root);
                true
            }
            None => false,
        }
    }

    /// 停止所有监听
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.watches.lock().drain().collect();
        for (agent_id, _handle) in drained {
            tracing::debug!("🛑 Stopped watching: agent={}", agent_id);
        }
    }

    pub fn is_watching(&self, agent_id: &str) -> bool {
        self.watches.lock().contains_key(agent_id)
    }

    /// 正在监听的 agent（排序）
    pub fn watched_agents(&self) -> Vec<String> {
        let mut agents: Vec<_> = self.watches.lock().keys().cloned().collect();
        agents.sort();
        agents
    }
}

/// 读取所有允许范围内的文件指纹；遍历期间消失的文件跳过
fn fingerprint_all(store: &FileStore) -> Result<HashMap<PathBuf, String>> {
    let mut known = HashMap::new();
    for relative in store.list_paths()? {
        if let Ok(content) = std::fs::read(store.root().join(&relative)) {
            known.insert(relative, content_hash(&content));
        }
    }
    Ok(known)
}

/// 单个工作区的事件循环状态
struct WatchLoop {
    agent_id: String,
    root: PathBuf,
    store: FileStore,
    bus: Arc<EventBus>,
    /// 当前存在的文件（相对路径）→ 最近一次报告的指纹
    known: HashMap<PathBuf, String>,
}

impl WatchLoop {
    /// `debouncer` 只需保持存活，drop 即停止原生监听
    async fn run<D: Send + 'static>(mut self, debouncer: D, mut rx: mpsc::Receiver<DebounceEventResult>) {
        let _debouncer = debouncer;

        while let Some(result) = rx.recv().await {
            match result {
                Ok(events) => self.process(events.into_iter().map(|debounced| debounced.event)).await,
                Err(errors) => {
                    for e in errors {
                        tracing::warn!("⚠️ Watch error: agent={}, {}", self.agent_id, e);
                    }
                }
            }
        }

        tracing::debug!("Watch loop ended: agent={}", self.agent_id);
    }

    /// 处理一批已稳定的事件：先收集受影响的文件，再逐个发布
    async fn process(&mut self, events: impl IntoIterator<Item = Event>) {
        let mut affected = BTreeSet::new();

        for event in events {
            if matches!(event.kind, EventKind::Access(_)) {
                continue;
            }
            let structural = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
            );

            for path in &event.paths {
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                if relative.as_os_str().is_empty() {
                    continue;
                }
                if self.store.filter().accepts_file(relative) {
                    affected.insert(relative.to_path_buf());
                }
                if structural {
                    self.expand_dir(relative, &mut affected).await;
                }
            }
        }

        for relative in affected {
            self.settle(relative).await;
        }
    }

    /// 目录被创建/移入时列出其中的文件；目录已不在时取出其下所有已知文件
    async fn expand_dir(&self, relative: &Path, affected: &mut BTreeSet<PathBuf>) {
        match tokio::fs::metadata(self.root.join(relative)).await {
            Ok(metadata) if metadata.is_dir() => {
                let store = self.store.clone();
                let dir = relative.to_path_buf();
                match tokio::task::spawn_blocking(move || store.list_paths_under(&dir)).await {
                    Ok(Ok(paths)) => affected.extend(paths),
                    Ok(Err(e)) => tracing::debug!("Skipping directory {:?}: {}", relative, e),
                    Err(e) => tracing::warn!("⚠️ spawn_blocking failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(_) => {
                affected.extend(
                    self.known
                        .keys()
                        .filter(|known| known.starts_with(relative) && known.as_path() != relative)
                        .cloned(),
                );
            }
        }
    }

    /// 路径已稳定：读取文件并发布事件
    async fn settle(&mut self, relative: PathBuf) {
        let absolute = self.root.join(&relative);

        let event = match tokio::fs::read(&absolute).await {
            Ok(content) => {
                let hash = content_hash(&content);
                let kind = match self.known.insert(relative.clone(), hash.clone()) {
                    None => ChangeKind::Added,
                    // 内容未变（例如目录事件展开到已报告过的文件）
                    Some(previous) if previous == hash => return,
                    Some(_) => ChangeKind::Modified,
                };
                ChangeEvent::new(&self.agent_id, relative, kind, Some(hash))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.known.remove(&relative).is_none() {
                    // 读取前已消失，没有可报告的稳定状态
                    tracing::debug!("Dropping event for vanished file {:?}", relative);
                    return;
                }
                ChangeEvent::new(&self.agent_id, relative, ChangeKind::Removed, None)
            }
            Err(e) => {
                // 目录或无法读取
                tracing::debug!("Dropping event for {:?}: {}", relative, e);
                return;
            }
        };

        tracing::debug!(
            "📝 File change: agent={}, path={:?}, kind={:?}",
            self.agent_id,
            event.relative_path,
            event.kind
        );
        self.bus.publish(&self.agent_id, event);
    }
}
