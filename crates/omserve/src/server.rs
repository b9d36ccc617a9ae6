use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use omserve_service::config::Config;
use omserve_service::metric;
use omserve_service::service::FileService;

use crate::endpoints;

/// Starts the file service and the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("omserve-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    web_pool.block_on(serve(config))?;
    tracing::info!("System shutdown complete");

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let service = FileService::create(&config).context("failed to create file service")?;

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind))?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, endpoints::create_app(Arc::new(service)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
