//! vizbox-server entry point.
//!
//! Loads configuration from the environment, provisions sandboxes as local
//! generator processes, runs the reaper and serves the HTTP API until Ctrl-C.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vizbox_runtime::LocalProvider;
use vizbox_server::{http, VizboxConfig, VizboxServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("vizbox_server=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting vizbox server");

    let config = VizboxConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only so health and stats stay up without credentials
    config.validate_warn();

    let provider = Arc::new(LocalProvider::new(config.provider_config()));
    let server = VizboxServer::new(&config, provider)?;

    server.start_reaper().await;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_server = server.clone();
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(http_server, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());

    server.shutdown_reaper().await;

    let destroyed = server.orchestrator().destroy_all().await;
    tracing::info!(destroyed, "All sandboxes cleaned up");

    let _ = http_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
