#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use poem_mcpserver::McpServer;
use ssh_session_mcp::mcp::{McpSessionCommands, SessionManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // stdout carries the MCP protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let manager = SessionManager::from_env();
    let reaper = manager.start_reaper();

    let served =
        poem_mcpserver::stdio::stdio(McpServer::new().tools(McpSessionCommands::new(manager.clone())))
            .await;

    manager.shutdown().await;
    let _ = reaper.await;
    served?;
    Ok(())
}
