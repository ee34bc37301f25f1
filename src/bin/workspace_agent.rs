//! workspace-agent - agent 工作区实时同步服务
//!
//! 负责：
//! - 监听 agent 工作区文件变化
//! - 通过 SSE 推送变更
//! - 提供带冲突检测的文件读写接口

use agent_workspace_sync::{WorkspaceConfig, WorkspaceServer};
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("agent_workspace_sync=debug".parse()?))
        .init();

    tracing::info!("🚀 workspace-agent v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = WorkspaceConfig::from_env();

    // 创建并运行服务
    let server = WorkspaceServer::new(config)?;
    server.run().await?;

    tracing::info!("👋 workspace-agent exiting");
    Ok(())
}
