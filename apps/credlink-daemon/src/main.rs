//! credlink daemon entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting credlink daemon");

    let daemon_config = config::DaemonConfig::load()?;
    tracing::info!(
        port = daemon_config.port,
        concurrency = ?daemon_config.concurrency,
        "configuration loaded"
    );

    app::run(daemon_config).await
}
