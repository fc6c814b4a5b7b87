//! Wires the store, sidecar bridge, registry and server together.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use credlink_pairing::{FileSessionStore, SessionRegistry};
use credlink_provider_bridge::{BridgeConfig, BridgeProviderFactory};
use credlink_server::{PairingHandler, PairingServer, ServerConfig};

use crate::config::DaemonConfig;

/// Runs the daemon until Ctrl-C, then winds every lineage down.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let store_dir = config.store_dir()?;
    tracing::info!(path = %store_dir.display(), "staging credentials");
    let store = Arc::new(FileSessionStore::new(store_dir));

    let factory = Arc::new(BridgeProviderFactory::new(BridgeConfig::new(
        config.bridge_url.clone(),
    )));
    let registry = Arc::new(SessionRegistry::new(
        factory,
        store,
        config.to_pairing_config(),
    ));

    let server_config = ServerConfig {
        bind_address: config.bind_address,
        port: config.port,
    };
    let listener = TcpListener::bind((server_config.bind_address, server_config.port))
        .await
        .with_context(|| {
            format!(
                "binding {}:{}",
                server_config.bind_address, server_config.port
            )
        })?;

    let handler = Arc::new(PairingHandler::new(Arc::clone(&registry)));
    let server = PairingServer::new(server_config, handler);
    let runner = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { runner.serve(listener).await });

    tracing::info!(bridge = %config.bridge_url, "credlink daemon ready");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            tracing::info!("interrupt received, shutting down");
        }
        result = &mut server_task => {
            registry.shutdown().await;
            return result.context("server task panicked")?.context("server stopped");
        }
    }

    // Lineages first so their terminal statuses still reach observers.
    registry.shutdown().await;
    server.shutdown();
    server_task
        .await
        .context("server task panicked")?
        .context("server failed")?;
    Ok(())
}
