// src/core/metrics_server.rs

//! A small HTTP server exposing Prometheus metrics on /metrics and the
//! operator liveness dashboard as JSON on /status.
//!
//! The main loop publishes status snapshots through a watch channel; the
//! HTTP side never touches control-plane state directly.

use crate::core::metrics::gather_metrics;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
async fn metrics_handler() -> impl IntoResponse {
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Handles HTTP requests to the /status endpoint.
async fn status_handler(status_rx: watch::Receiver<serde_json::Value>) -> impl IntoResponse {
    let snapshot = status_rx.borrow().clone();
    (StatusCode::OK, Json(snapshot))
}

/// Runs the metrics/status HTTP server until shutdown.
pub async fn run_metrics_server(
    port: u16,
    status_rx: watch::Receiver<serde_json::Value>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(move || status_handler(status_rx.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(
        "Metrics server listening on http://{}/metrics (status on /status)",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
    {
        error!("Metrics server error: {}", e);
    }
}
