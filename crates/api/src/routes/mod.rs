//! API routes.

pub mod health;
pub mod metrics;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::health_handler))
        .route("/health/live", get(health::live_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the router on `addr` until the task is dropped.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health endpoint listening on http://{}", addr);
    axum::serve(listener, router(state)).await
}
