// src/node/metrics_server.rs

//! A small HTTP server exposing Prometheus metrics on /metrics and the
//! per-subsystem stats snapshots as JSON on /stats.

use crate::core::metrics::gather_metrics;
use crate::node::ValidatorNode;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

async fn stats_handler(node: Arc<ValidatorNode>) -> impl IntoResponse {
    Json(node.stats_snapshot())
}

/// Runs the metrics endpoint until shutdown.
pub async fn run_metrics_server(
    node: Arc<ValidatorNode>,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let stats_node = node.clone();
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(move || stats_handler(stats_node.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Metrics server listening on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server on {}: {}", addr, e);
            return;
        }
    };

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_rx.recv() => {
            info!("Metrics server shutting down.");
        }
    }
}
