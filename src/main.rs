//! OCPP 1.6J central system: WebSocket endpoint for charge points plus an
//! operator HTTP API, both driven from the same charge-point registry.

use std::sync::Arc;

use tracing::info;

use ocpp_csms::config::Config;
use ocpp_csms::core::{OperatorFacade, Registry};
use ocpp_csms::server::{http, shutdown, websocket, ShutdownSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(ws = %config.ws_address(), http = %config.http_address(), "starting OCPP central system");

    let registry = Registry::new(config.clone());
    let facade = Arc::new(OperatorFacade::new(Arc::clone(&registry)));

    let shutdown_signal = ShutdownSignal::new();

    let signal_task = tokio::spawn(shutdown::listen_for_shutdown(shutdown_signal.clone()));

    let ws_task = tokio::spawn(websocket::run(Arc::clone(&registry), shutdown_signal.clone()));

    let http_listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!(address = %config.http_address(), "operator HTTP API listening");
    let http_shutdown = shutdown_signal.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, http::router(facade))
            .with_graceful_shutdown(async move { http_shutdown.notified().await })
            .await
    });

    let _ = signal_task.await;
    let _ = ws_task.await;
    let _ = http_task.await;

    info!("shutdown complete");
    Ok(())
}
