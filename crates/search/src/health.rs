//! Search backend health checks.

use crate::backend::SearchBackend;
use tracing::{debug, error};

/// Check search backend connection health.
pub async fn check_connection(backend: &dyn SearchBackend) -> bool {
    match backend.ping().await {
        Ok(()) => {
            debug!("Search backend connection healthy");
            true
        }
        Err(e) => {
            error!("Search backend health check failed: {}", e);
            false
        }
    }
}
