//! Process shutdown.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Exit status the processor always terminates with.
pub const EXIT_CODE: i32 = 137;

/// A connection pool that can be closed.
#[async_trait]
pub trait DrainablePool: Send + Sync {
    /// Closes the pool, waiting for checked-out connections to return.
    async fn drain(&self);
}

#[async_trait]
impl DrainablePool for sqlx::PgPool {
    async fn drain(&self) {
        self.close().await;
    }
}

/// Drains shared resources exactly once and yields the exit status.
pub struct ShutdownCoordinator {
    pool: Arc<dyn DrainablePool>,
    drain_timeout: Duration,
    drained: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(pool: Arc<dyn DrainablePool>, drain_timeout: Duration) -> Self {
        Self {
            pool,
            drain_timeout,
            drained: AtomicBool::new(false),
        }
    }

    /// Runs the shutdown sequence and returns the exit status. Later calls
    /// skip the drain.
    pub async fn shutdown(&self) -> i32 {
        let started = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        info!(at = %started, "Shutting down");

        if self.drained.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already ran, pool not drained again");
        } else {
            match tokio::time::timeout(self.drain_timeout, self.pool.drain()).await {
                Ok(()) => info!("Database pool drained"),
                Err(_) => error!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Timed out draining database pool"
                ),
            }
        }

        info!(exit_code = EXIT_CODE, "Shutdown complete");
        EXIT_CODE
    }
}

/// Resolves on SIGTERM or Ctrl+C.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
