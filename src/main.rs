//! lilith-bridge - HTTP Server Entry Point
//!
//! Probes the host, then serves JSON-RPC on `POST /rpc`.

use std::sync::Arc;

use lilith_bridge::{api, config::Config, coordinator::Bridge};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lilith_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: display={} union_policy={}",
        config.display, config.union_policy
    );

    let bridge = Arc::new(Bridge::from_config(&config).await?);
    let caps = bridge.capabilities();
    for (class, usable) in &caps.usable {
        if usable.is_empty() {
            tracing::warn!(class = %class, "No usable backend; calls will return Unavailable");
        }
    }

    info!("Starting server on {}:{}", config.host, config.port);
    api::serve(config, bridge).await?;

    Ok(())
}
