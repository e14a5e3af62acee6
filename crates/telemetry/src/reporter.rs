//! Error reporting.

use processor_core::{JobError, JobMeta};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Receives every worker failure, retryable or not.
pub trait ErrorReporter: Send + Sync {
    fn notify(&self, error: &JobError, job: &JobMeta, elapsed: Duration);
}

/// Release stage reporting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// Reporting token; reports are only logged when it is absent.
    #[serde(default)]
    pub token: Option<String>,
    /// Release stage of this deployment (production, staging, dev).
    #[serde(default)]
    pub stage: Option<String>,
    /// Stages whose failures are worth notifying about.
    #[serde(default = "default_notify_stages")]
    pub notify_stages: Vec<String>,
}

fn default_notify_stages() -> Vec<String> {
    vec!["production".to_string(), "staging".to_string()]
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            token: None,
            stage: None,
            notify_stages: default_notify_stages(),
        }
    }
}

/// Reports failures as structured error logs.
#[derive(Debug, Clone)]
pub struct LogReporter {
    stage: String,
    notify: bool,
}

impl LogReporter {
    pub fn new(config: &ReporterConfig) -> Self {
        let stage = config.stage.clone().unwrap_or_else(|| "dev".to_string());
        let notify = config.token.is_some() && config.notify_stages.contains(&stage);

        if config.token.is_none() {
            error!("Error reporting token not set, error reports will only be logged");
        } else if !notify {
            info!(stage = %stage, "Release stage not in notify stages, error reports will only be logged");
        }

        Self { stage, notify }
    }

    /// Whether reports for this stage are meant for notification.
    pub fn notifies(&self) -> bool {
        self.notify
    }
}

impl ErrorReporter for LogReporter {
    fn notify(&self, err: &JobError, job: &JobMeta, elapsed: Duration) {
        error!(
            stage = %self.stage,
            notify = self.notify,
            topic = %job.topic,
            channel = %job.channel,
            job_id = %job.id,
            attempts = job.attempts,
            kind = %err.kind,
            retryable = err.retryable,
            elapsed_ms = %format!("{:.3}", elapsed.as_secs_f64() * 1000.0),
            "Job failure report: {}",
            err.detail
        );
    }
}
