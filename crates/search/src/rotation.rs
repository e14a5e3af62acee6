//! Index rotation state machine.
//!
//! An index moves Building -> Verifying -> Active -> Superseded. The state is
//! persisted with the index so the repair pass, possibly running in another
//! process after a crash, can tell a verified index from a half-built one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use processor_core::{Error, JobError, JobErrorKind, Result};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{CopyMode, SearchBackend};
use crate::config::SearchConfig;
use crate::index::{index_name, IndexMeta, IndexStatus, SearchIndex};

/// Rotation or repair failure.
#[derive(Debug, Error)]
pub enum RotationError {
    /// The new index holds fewer documents than the index it would replace.
    #[error("index {index} holds {actual} documents, expected at least {expected}")]
    CountMismatch {
        index: String,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Backend(#[from] Error),
}

impl From<RotationError> for JobError {
    fn from(err: RotationError) -> Self {
        match &err {
            RotationError::CountMismatch { .. } => {
                JobError::terminal(JobErrorKind::Rotation, err.to_string())
            }
            RotationError::Backend(e) => JobError::from_error(JobErrorKind::Rotation, e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The active index is younger than the rotation interval.
    Skipped { active: String },
    Rotated {
        previous: Vec<String>,
        current: String,
        document_count: u64,
        pruned: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The alias resolves to exactly one active index.
    Healthy { index: String },
    /// A rotation swapped the alias but did not record the new index as active.
    Completed { index: String },
    Repointed { from: Vec<String>, to: String },
    /// No verified index is eligible; the alias was left untouched.
    NoCandidate,
}

/// Fills a freshly created index with documents.
#[async_trait]
pub trait IndexSource: Send + Sync {
    /// Writes documents for `alias` into `dest`; returns how many were written.
    async fn populate(&self, backend: &dyn SearchBackend, alias: &str, dest: &str) -> Result<u64>;
}

/// Copies every document currently behind the alias.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReindexFromAlias;

#[async_trait]
impl IndexSource for ReindexFromAlias {
    async fn populate(&self, backend: &dyn SearchBackend, alias: &str, dest: &str) -> Result<u64> {
        let mut written = 0;
        for target in backend.alias_targets(alias).await? {
            written += backend
                .copy_documents(&target, dest, CopyMode::Overwrite)
                .await?;
        }
        Ok(written)
    }
}

/// Rotates and repairs the indices behind aliases.
pub struct IndexRotator {
    backend: Arc<dyn SearchBackend>,
    source: Arc<dyn IndexSource>,
    interval: chrono::Duration,
    retain_superseded: usize,
    /// Serializes the read-then-swap sequences of rotate and repair.
    cycle: tokio::sync::Mutex<()>,
    /// Newest index each alias was seen pointing at.
    high_water: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl IndexRotator {
    pub fn new(backend: Arc<dyn SearchBackend>, config: &SearchConfig) -> Self {
        Self {
            backend,
            source: Arc::new(ReindexFromAlias),
            interval: chrono::Duration::seconds(config.rotation_interval_secs as i64),
            retain_superseded: config.retain_superseded,
            cycle: tokio::sync::Mutex::new(()),
            high_water: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn IndexSource>) -> Self {
        self.source = source;
        self
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    pub fn high_water(&self, alias: &str) -> Option<DateTime<Utc>> {
        self.high_water.lock().get(alias).copied()
    }

    fn observe(&self, alias: &str, created_at: DateTime<Utc>) {
        let mut marks = self.high_water.lock();
        let mark = marks.entry(alias.to_string()).or_insert(created_at);
        if created_at > *mark {
            *mark = created_at;
        }
    }

    pub async fn rotate(&self, alias: &str) -> std::result::Result<RotationOutcome, RotationError> {
        self.rotate_at(alias, Utc::now()).await
    }

    /// Replaces the active index of `alias` when it is older than the
    /// rotation interval.
    pub async fn rotate_at(
        &self,
        alias: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<RotationOutcome, RotationError> {
        let indices = self.backend.list_indices(alias).await?;
        let targets = self.backend.alias_targets(alias).await?;

        let active = indices
            .iter()
            .filter(|i| i.status() == IndexStatus::Active && targets.contains(&i.name))
            .max_by(|a, b| a.name.cmp(&b.name));
        if let Some(active) = active {
            if now - active.created_at() < self.interval {
                debug!(alias = alias, active = %active.name, "Active index is current");
                return Ok(RotationOutcome::Skipped {
                    active: active.name.clone(),
                });
            }
        }

        let name = index_name(alias, now);
        let meta = IndexMeta::building(now);
        self.backend.create_index(&name, &meta).await?;
        info!(alias = alias, index = %name, "Building index");

        let populated = self.source.populate(self.backend.as_ref(), alias, &name).await?;
        let meta = meta.with_status(IndexStatus::Verifying);
        self.backend.update_meta(&name, &meta).await?;

        let previous = {
            let _cycle = self.cycle.lock().await;
            self.verify_and_swap(alias, &name, meta).await?
        };

        for old in &previous {
            match self
                .backend
                .copy_documents(old, &name, CopyMode::CreateOnly)
                .await
            {
                Ok(0) => {}
                Ok(copied) => debug!(from = %old, to = %name, copied, "Caught up late writes"),
                Err(e) => warn!(from = %old, to = %name, error = %e, "Catch-up copy failed"),
            }
        }

        let document_count = self.backend.count(&name).await.unwrap_or(populated);

        let pruned = match self.prune(alias, now).await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!(alias = alias, error = %e, "Pruning old indices failed");
                Vec::new()
            }
        };

        info!(
            alias = alias,
            index = %name,
            previous = ?previous,
            document_count,
            pruned = pruned.len(),
            "Rotated index"
        );

        Ok(RotationOutcome::Rotated {
            previous,
            current: name,
            document_count,
            pruned,
        })
    }

    /// Counts the new index against the one it replaces and moves the alias.
    /// Returns the indices the alias pointed at before the swap.
    async fn verify_and_swap(
        &self,
        alias: &str,
        name: &str,
        meta: IndexMeta,
    ) -> std::result::Result<Vec<String>, RotationError> {
        let indices = self.backend.list_indices(alias).await?;
        let targets = self.backend.alias_targets(alias).await?;

        let baseline = indices
            .iter()
            .filter(|i| i.name != name && targets.contains(&i.name))
            .map(SearchIndex::committed_count)
            .max()
            .unwrap_or(0);

        let count = self.backend.count(name).await?;
        if count < baseline {
            warn!(
                alias = alias,
                index = name,
                count,
                baseline,
                "New index is short of documents, keeping current alias"
            );
            return Err(RotationError::CountMismatch {
                index: name.to_string(),
                expected: baseline,
                actual: count,
            });
        }

        let meta = meta.with_verified_count(count);
        self.backend.update_meta(name, &meta).await?;
        self.backend.swap_alias(alias, &targets, name).await?;
        self.observe(alias, meta.created_at);

        self.supersede_others(&indices, &targets, name).await?;
        self.backend
            .update_meta(name, &meta.with_status(IndexStatus::Active))
            .await?;

        Ok(targets.into_iter().filter(|t| t != name).collect())
    }

    /// Marks every index that served or could serve the alias, other than
    /// `keep`, as superseded.
    async fn supersede_others(
        &self,
        indices: &[SearchIndex],
        targets: &[String],
        keep: &str,
    ) -> Result<()> {
        for index in indices {
            if index.name == keep || index.status() == IndexStatus::Superseded {
                continue;
            }
            if targets.contains(&index.name) || index.is_eligible() {
                let meta = index.meta.clone().with_status(IndexStatus::Superseded);
                self.backend.update_meta(&index.name, &meta).await?;
                debug!(index = %index.name, "Superseded index");
            }
        }
        Ok(())
    }

    /// Deletes superseded indices past the retention count and abandoned
    /// unverified ones. Alias targets are never deleted.
    async fn prune(&self, alias: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let indices = self.backend.list_indices(alias).await?;
        let targets = self.backend.alias_targets(alias).await?;

        let mut superseded: Vec<&SearchIndex> = indices
            .iter()
            .filter(|i| i.status() == IndexStatus::Superseded)
            .collect();
        superseded.sort_by(|a, b| b.name.cmp(&a.name));

        let abandoned = indices.iter().filter(|i| {
            matches!(i.status(), IndexStatus::Building | IndexStatus::Verifying)
                && !i.is_eligible()
                && now - i.created_at() > self.interval
        });

        let mut pruned = Vec::new();
        for index in superseded
            .into_iter()
            .skip(self.retain_superseded)
            .chain(abandoned)
        {
            if targets.contains(&index.name) {
                continue;
            }
            self.backend.delete_index(&index.name).await?;
            info!(index = %index.name, status = %index.status(), "Deleted index");
            pruned.push(index.name.clone());
        }
        Ok(pruned)
    }

    /// Converges an alias left inconsistent by an interrupted rotation.
    pub async fn repair(&self, alias: &str) -> std::result::Result<RepairOutcome, RotationError> {
        let _cycle = self.cycle.lock().await;

        let indices = self.backend.list_indices(alias).await?;
        let targets = self.backend.alias_targets(alias).await?;
        let existing: Vec<&SearchIndex> = indices
            .iter()
            .filter(|i| targets.contains(&i.name))
            .collect();

        if let ([target], [index]) = (targets.as_slice(), existing.as_slice()) {
            if index.status() == IndexStatus::Active {
                self.observe(alias, index.created_at());
                return Ok(RepairOutcome::Healthy {
                    index: target.clone(),
                });
            }

            if index.is_eligible() {
                self.activate(alias, &indices, &targets, index).await?;
                info!(alias = alias, index = %target, "Completed interrupted rotation");
                return Ok(RepairOutcome::Completed {
                    index: target.clone(),
                });
            }
        }

        // Current targets bound the candidate whatever their status.
        let floor = existing
            .iter()
            .map(|i| i.created_at())
            .chain(self.high_water(alias))
            .max();
        let count_floor = existing
            .iter()
            .map(|i| i.committed_count())
            .max()
            .unwrap_or(0);

        let candidate = indices
            .iter()
            .filter(|i| i.is_eligible())
            .filter(|i| floor.map_or(true, |floor| i.created_at() >= floor))
            .filter(|i| i.committed_count() >= count_floor)
            .max_by(|a, b| a.name.cmp(&b.name));

        let Some(candidate) = candidate else {
            warn!(
                alias = alias,
                targets = ?targets,
                floor = ?floor,
                count_floor,
                "No verified index to point alias at"
            );
            return Ok(RepairOutcome::NoCandidate);
        };

        self.backend
            .swap_alias(alias, &targets, &candidate.name)
            .await?;
        self.activate(alias, &indices, &targets, candidate).await?;

        info!(
            alias = alias,
            from = ?targets,
            to = %candidate.name,
            "Repointed alias"
        );

        Ok(RepairOutcome::Repointed {
            from: targets,
            to: candidate.name.clone(),
        })
    }

    async fn activate(
        &self,
        alias: &str,
        indices: &[SearchIndex],
        targets: &[String],
        index: &SearchIndex,
    ) -> Result<()> {
        self.observe(alias, index.created_at());
        self.supersede_others(indices, targets, &index.name).await?;
        if index.status() != IndexStatus::Active {
            let meta = index.meta.clone().with_status(IndexStatus::Active);
            self.backend.update_meta(&index.name, &meta).await?;
        }
        Ok(())
    }

    /// Startup pass: repairs the alias and, when no index can serve it,
    /// builds the first one.
    pub async fn ensure(&self, alias: &str) -> std::result::Result<RepairOutcome, RotationError> {
        match self.repair(alias).await? {
            RepairOutcome::NoCandidate => match self.rotate(alias).await? {
                RotationOutcome::Rotated {
                    previous, current, ..
                } => Ok(RepairOutcome::Repointed {
                    from: previous,
                    to: current,
                }),
                RotationOutcome::Skipped { active } => Ok(RepairOutcome::Healthy { index: active }),
            },
            outcome => Ok(outcome),
        }
    }
}
