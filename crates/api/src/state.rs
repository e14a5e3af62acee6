//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;
use telemetry::{HealthRegistry, MetricsRegistry};

/// Default heartbeat age after which the processor reports unhealthy.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    /// A heartbeat older than this fails `/healthz`.
    pub max_age: Duration,
}

impl AppState {
    pub fn new(health: Arc<HealthRegistry>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            health,
            metrics,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}
