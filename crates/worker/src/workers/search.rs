//! Search indexing and index maintenance workers.

use async_trait::async_trait;
use processor_core::{Job, JobError, JobErrorKind, Worker};
use search::{IndexRotator, RepairOutcome, RotationOutcome, SearchBackend};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A normalized audit event as published on `normalized_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Indexes normalized events through the write alias.
pub struct SaveToSearchWorker {
    backend: Arc<dyn SearchBackend>,
    alias: String,
}

impl SaveToSearchWorker {
    pub fn new(backend: Arc<dyn SearchBackend>, alias: impl Into<String>) -> Self {
        Self {
            backend,
            alias: alias.into(),
        }
    }
}

#[async_trait]
impl Worker for SaveToSearchWorker {
    fn name(&self) -> &str {
        "save_to_elasticsearch"
    }

    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let event: NormalizedEvent = job.json()?;
        let document = serde_json::to_value(&event)?;

        self.backend
            .index_document(&self.alias, &event.id, &document)
            .await
            .map_err(|e| JobError::from_error(JobErrorKind::Search, &e))?;

        debug!(alias = %self.alias, event_id = %event.id, "Indexed event");
        Ok(())
    }
}

/// Rotates the index behind every managed alias.
pub struct RotateIndicesWorker {
    rotator: Arc<IndexRotator>,
    aliases: Vec<String>,
}

impl RotateIndicesWorker {
    pub fn new(rotator: Arc<IndexRotator>, aliases: Vec<String>) -> Self {
        Self { rotator, aliases }
    }
}

#[async_trait]
impl Worker for RotateIndicesWorker {
    fn name(&self) -> &str {
        "rotate_elasticsearch_indices"
    }

    async fn run(&self, _job: &Job) -> Result<(), JobError> {
        let mut failures = Vec::new();

        for alias in &self.aliases {
            match self.rotator.rotate(alias).await {
                Ok(RotationOutcome::Skipped { active }) => {
                    debug!(alias = %alias, active = %active, "Rotation not due");
                }
                Ok(RotationOutcome::Rotated { current, .. }) => {
                    info!(alias = %alias, index = %current, "Rotation complete");
                }
                Err(e) => {
                    error!(alias = %alias, error = %e, "Rotation failed");
                    failures.push(format!("{}: {}", alias, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(JobError::terminal(JobErrorKind::Rotation, failures.join("; ")))
        }
    }
}

/// Converges every managed alias onto a verified index.
pub struct RepairAliasesWorker {
    rotator: Arc<IndexRotator>,
    aliases: Vec<String>,
}

impl RepairAliasesWorker {
    pub fn new(rotator: Arc<IndexRotator>, aliases: Vec<String>) -> Self {
        Self { rotator, aliases }
    }
}

#[async_trait]
impl Worker for RepairAliasesWorker {
    fn name(&self) -> &str {
        "repair_elasticsearch_index_aliases"
    }

    async fn run(&self, _job: &Job) -> Result<(), JobError> {
        let mut failures = Vec::new();

        for alias in &self.aliases {
            match self.rotator.repair(alias).await {
                Ok(RepairOutcome::Healthy { .. }) | Ok(RepairOutcome::NoCandidate) => {}
                Ok(outcome) => info!(alias = %alias, outcome = ?outcome, "Alias repaired"),
                Err(e) => {
                    error!(alias = %alias, error = %e, "Alias repair failed");
                    failures.push(format!("{}: {}", alias, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(JobError::terminal(JobErrorKind::Rotation, failures.join("; ")))
        }
    }
}
