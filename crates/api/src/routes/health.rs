//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};

use crate::response::HealthResponse;
use crate::state::AppState;

/// GET /healthz - 503 once no job succeeded within the max age.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.health.report(state.max_age);
    let code = if report.status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(report.into()))
}

/// GET /health/live - Liveness probe (process is up).
pub async fn live_handler() -> StatusCode {
    StatusCode::OK
}
