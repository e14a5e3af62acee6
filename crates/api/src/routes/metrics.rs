//! Metrics endpoint.

use axum::{extract::State, Json};
use telemetry::MetricsSnapshot;

use crate::state::AppState;

/// GET /metrics - JSON snapshot of job timers and error meters.
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
