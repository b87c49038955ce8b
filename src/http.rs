//! HTTP server for the Prometheus metrics endpoint.
//!
//! Serves `/metrics` for scraping and `/healthz` for liveness probes.

use axum::{Router, routing::get};
use std::net::SocketAddr;

use crate::state::BrokerHandle;

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// Liveness: the broker actor still answers.
async fn health_handler(broker: BrokerHandle) -> (http::StatusCode, String) {
    match broker.snapshot().await {
        Ok(snapshot) => (
            http::StatusCode::OK,
            format!(
                "ok instance={} sessions={} waiting={} pairings={}\n",
                snapshot.instance, snapshot.sessions, snapshot.waiting, snapshot.pairings
            ),
        ),
        Err(e) => (http::StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")),
    }
}

/// Run the HTTP server for Prometheus metrics.
///
/// Binds to `0.0.0.0:port`. This is a long-running task that should be
/// spawned in the background.
pub async fn run_http_server(port: u16, broker: BrokerHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(move || health_handler(broker.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Prometheus HTTP server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("HTTP server error: {}", e);
    }
}
