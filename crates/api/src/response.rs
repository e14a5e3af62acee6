//! Response bodies.

use serde::{Deserialize, Serialize};
use telemetry::{ComponentHealthReport, HealthReport, HealthStatus};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    /// Last successful delivery, epoch milliseconds.
    pub last_delivery_ms: Option<i64>,
    pub age_ms: u64,
    pub beats: u64,
    pub components: Vec<ComponentHealthReport>,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        Self {
            status: report.status,
            last_delivery_ms: report.liveness.last_delivery_ms,
            age_ms: report.liveness.age_ms,
            beats: report.liveness.beats,
            components: report.components,
        }
    }
}
