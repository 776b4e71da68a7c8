//! MCP server for the file fleet over stdio.
//!
//! Reads newline-delimited JSON-RPC 2.0 from stdin and writes responses to
//! stdout. Logs go to stderr. The session token comes from `FLEET_TOKEN`, or
//! is obtained at startup by logging in with `FLEET_PASSWORD` (and optional
//! `FLEET_USERNAME`); every `tools/call` validates it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use file_fleet::api::AppState;
use file_fleet::config::Config;
use file_fleet::mcp::types::{JsonRpcResponse, INTERNAL_ERROR};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn session_token(state: &AppState) -> anyhow::Result<String> {
    if let Ok(token) = std::env::var("FLEET_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    let password = std::env::var("FLEET_PASSWORD")
        .context("FLEET_TOKEN or FLEET_PASSWORD must be set")?;
    let username = std::env::var("FLEET_USERNAME").ok();
    let session = state
        .auth
        .authenticate(username.as_deref(), &password)
        .context("login with FLEET_PASSWORD failed")?;
    Ok(session.token)
}

fn encode(response: &JsonRpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": {"code": INTERNAL_ERROR, "message": e.to_string()},
        })
        .to_string()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_fleet=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    let state = Arc::new(AppState::from_config(config).await?);
    let token = session_token(&state)?;
    let sweeper = state.queue.spawn_retention_sweeper(RETENTION_SWEEP_INTERVAL);

    tracing::info!(
        "fleet-mcp ready on stdio (workspace: {})",
        state.config.workspace.display()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = state.server.handle_message(&line, Some(&token)).await {
            stdout.write_all(encode(&response).as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    sweeper.abort();
    tracing::info!("stdin closed, shutting down");
    Ok(())
}
