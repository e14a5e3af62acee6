//! Stand-in for roles served by other services.

use async_trait::async_trait;
use processor_core::{Job, JobError, Worker};
use tracing::debug;

/// Logs each delivery and acknowledges it.
#[derive(Debug, Clone)]
pub struct LoggingWorker {
    name: String,
}

impl LoggingWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Worker for LoggingWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, job: &Job) -> Result<(), JobError> {
        debug!(
            worker = %self.name,
            job = %job.meta(),
            bytes = job.body().len(),
            "Delivery acknowledged without processing"
        );
        Ok(())
    }
}
