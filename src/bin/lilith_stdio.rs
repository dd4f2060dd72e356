//! JSON-RPC server for the bridge over stdio.
//!
//! Reads one JSON-RPC 2.0 message per line on stdin and writes one response
//! per line on stdout. Logs go to stderr so they never interleave with
//! responses.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use lilith_bridge::api::{JsonRpcResponse, RpcGateway};
use lilith_bridge::config::Config;
use lilith_bridge::coordinator::Bridge;

/// Messages answered by the transport itself rather than the gateway.
fn handle_session(raw: &str) -> Option<Option<JsonRpcResponse>> {
    let value: Value = serde_json::from_str(raw).ok()?;
    match value.get("method").and_then(Value::as_str)? {
        "initialize" => Some(Some(JsonRpcResponse::success(
            value.get("id").cloned().unwrap_or(Value::Null),
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {
                    "name": "lilith-stdio",
                    "version": env!("CARGO_PKG_VERSION")
                },
                "capabilities": {}
            }),
        ))),
        "notifications/initialized" | "initialized" => Some(None),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lilith_bridge=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    let bridge = Arc::new(Bridge::from_config(&config).await?);
    let gateway = RpcGateway::new(bridge, "stdio");
    tracing::info!("Serving JSON-RPC on stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!("Received: {}", line);

        let response = match handle_session(&line) {
            Some(local) => local,
            None => gateway.handle_str(&line).await,
        };

        let Some(response) = response else {
            tracing::debug!("Notification received, no response sent");
            continue;
        };
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}
