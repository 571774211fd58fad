//! termchat-proxy binary.
//!
//! Standalone server binary. For library usage, see [`termchat_proxy`].

use termchat_proxy::{run_server, ServerConfig};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("termchat_proxy=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load .env if present, then capture configuration once.
    if dotenvy::dotenv().is_err() {
        warn!("no .env file found, using environment variables only");
    }

    let config = ServerConfig::from_env()?;
    run_server(config).await
}
