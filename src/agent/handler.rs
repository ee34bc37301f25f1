//! 请求处理器
//!
//! 处理浏览器端的推送订阅与文件读写请求

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::bus::EventBus;
use super::session::StreamSession;
use super::watcher::WatcherRegistry;
use crate::config::WorkspaceConfig;
use crate::conflict::{ConflictResolver, WriteOutcome};
use crate::error::{Error, Result};
use crate::protocol::{ErrorResponse, FileContentResponse, FileQuery, WriteAccepted, WriteRequest};
use crate::store::{FileEntry, FileStore};

/// 服务版本号（跟随 crate 版本）
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 推送连接的内存管道容量
const STREAM_PIPE_BUFFER: usize = 16 * 1024;

/// 请求处理器
pub struct Handler {
    config: Arc<WorkspaceConfig>,
    /// 事件总线
    bus: Arc<EventBus>,
    /// 文件监听器
    watchers: Arc<WatcherRegistry>,
    /// 服务关闭信号，关闭时所有推送会话一起结束
    shutdown: CancellationToken,
}

impl Handler {
    /// 创建处理器
    pub fn new(
        config: Arc<WorkspaceConfig>,
        bus: Arc<EventBus>,
        watchers: Arc<WatcherRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            bus,
            watchers,
            shutdown,
        }
    }

    fn store(&self, agent_id: &str) -> Result<FileStore> {
        let root = self.config.workspace_root(agent_id)?;
        Ok(FileStore::new(root, self.config.filter()))
    }

    /// 打开推送流：按需启动监听，订阅后返回 SSE 响应体
    pub async fn open_stream(&self, agent_id: &str) -> Result<Body> {
        let root = self.config.workspace_root(agent_id)?;
        self.watchers.start(&root, agent_id).await?;

        let session = StreamSession::open(self.bus.clone(), agent_id, &self.config);
        let (reader, writer) = tokio::io::duplex(STREAM_PIPE_BUFFER);
        let connection = self.shutdown.child_token();
        tokio::spawn(session.run(writer, connection.clone()));

        // 客户端断开时 hyper 丢弃响应体，guard 随之 drop 并取消会话
        let guard = connection.drop_guard();
        let stream = ReaderStream::new(reader).map(move |chunk| {
            let _connection = &guard;
            chunk
        });
        Ok(Body::from_stream(stream))
    }

    /// 列出工作区文件
    pub async fn list_files(&self, agent_id: &str) -> Result<Vec<FileEntry>> {
        let store = self.store(agent_id)?;
        blocking(move || store.list()).await
    }

    /// 读取单个文件
    pub async fn read_file(&self, agent_id: &str, path: String) -> Result<FileContentResponse> {
        let store = self.store(agent_id)?;
        let file = blocking(move || store.read(&path)).await?;
        Ok(FileContentResponse {
            content: file.text()?,
            content_hash: file.content_hash,
            last_modified: file.last_modified,
        })
    }

    /// compare-and-swap 写入
    pub async fn write_file(&self, agent_id: &str, request: WriteRequest) -> Result<WriteOutcome> {
        let resolver = ConflictResolver::new(self.store(agent_id)?);
        tracing::debug!("✏️ Write request: agent={}", agent_id);
        blocking(move || {
            resolver.attempt_write(&request.file_path, &request.content, &request.expected_hash)
        })
        .await
    }

    /// 服务状态
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": SERVER_VERSION,
            "watching": self.watchers.watched_agents(),
            "subscribers": self.bus.topic_counts(),
            "connections": self.bus.subscription_count(),
        })
    }
}

/// 在阻塞线程池执行文件操作
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking failed: {}", e))?
}

/// 构建路由
pub fn router(handler: Arc<Handler>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/workspace/:agent_id/events", get(events))
        .route("/api/workspace/:agent_id/files", get(get_files).post(post_file))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn status(State(handler): State<Arc<Handler>>) -> impl IntoResponse {
    Json(handler.status())
}

async fn events(
    State(handler): State<Arc<Handler>>,
    AxumPath(agent_id): AxumPath<String>,
) -> Result<Response> {
    let body = handler.open_stream(&agent_id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn get_files(
    State(handler): State<Arc<Handler>>,
    AxumPath(agent_id): AxumPath<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response> {
    match query.path {
        Some(path) => {
            let file = handler.read_file(&agent_id, path).await?;
            Ok(Json(file).into_response())
        }
        None => {
            let files = handler.list_files(&agent_id).await?;
            Ok(Json(serde_json::json!({
                "agentId": agent_id,
                "files": files,
            }))
            .into_response())
        }
    }
}

async fn post_file(
    State(handler): State<Arc<Handler>>,
    AxumPath(agent_id): AxumPath<String>,
    Json(request): Json<WriteRequest>,
) -> Result<Response> {
    match handler.write_file(&agent_id, request).await? {
        WriteOutcome::Accepted { content_hash } => {
            Ok(Json(WriteAccepted { content_hash }).into_response())
        }
        WriteOutcome::Conflict(conflict) => {
            Ok((StatusCode::CONFLICT, Json(conflict.to_response())).into_response())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::PathRejected | Error::InvalidAgentId => (StatusCode::BAD_REQUEST, "Invalid path"),
            Error::NotFound => (StatusCode::NOT_FOUND, "File not found"),
            other => {
                tracing::error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: message.to_string(),
            }),
        )
            .into_response()
    }
}
