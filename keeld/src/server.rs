// SPDX-License-Identifier: GPL-2.0-only
use crate::api::{self, AppState};
use keel_lib::config::Config;
use keel_lib::runtime::metadata::{self, MetadataState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Serve the HTTP API until shutdown is requested.
pub async fn run(
    config: &Config,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = api::router(state);

    let listener = TcpListener::bind(&config.api.listen).await?;
    info!(listen = %config.api.listen, "HTTP API ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for(shutdown))
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

/// Serve the guest metadata endpoint. Peer addresses are needed for the
/// node range check.
pub async fn run_metadata(
    config: &Config,
    state: Arc<MetadataState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.metadata.listen, config.metadata.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(listen = %addr, "metadata endpoint ready");

    axum::serve(
        listener,
        metadata::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for(shutdown))
    .await?;
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}
