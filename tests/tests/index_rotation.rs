//! End-to-end tests for index rotation and alias repair.
//!
//! The rotation and repair workers are driven the way production drives them:
//! a tick on their clock topic, dispatched through the registry bindings.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use integration_tests::setup::{eventually, TestContext};
use queue::clock;
use search::{
    index_name, FailPoint, IndexMeta, IndexRotator, IndexStatus, MemoryBackend, SearchBackend,
    SearchConfig,
};
use std::sync::Arc;
use std::time::Duration;
use worker::{
    build_bindings, Dispatcher, FeatureFlags, LoggingWorker, RepairAliasesWorker,
    RotateIndicesWorker, WorkerCatalog, WorkerRole,
};

const ALIAS: &str = "audit-events";
const WAIT: Duration = Duration::from_secs(30);

struct RotationContext {
    ctx: TestContext,
    backend: MemoryBackend,
    _dispatcher: Arc<Dispatcher>,
}

impl RotationContext {
    async fn new(backend: MemoryBackend) -> Self {
        let ctx = TestContext::new();
        let rotator = Arc::new(IndexRotator::new(
            Arc::new(backend.clone()),
            &SearchConfig::default(),
        ));
        let aliases = vec![ALIAS.to_string()];

        let catalog = WorkerCatalog::from_fn(|role| Arc::new(LoggingWorker::new(role.as_str())))
            .with(
                WorkerRole::RotateElasticsearchIndices,
                Arc::new(RotateIndicesWorker::new(rotator.clone(), aliases.clone())),
            )
            .with(
                WorkerRole::RepairElasticsearchIndexAliases,
                Arc::new(RepairAliasesWorker::new(rotator, aliases)),
            );
        let dispatcher = ctx
            .start(build_bindings(FeatureFlags::default(), &catalog))
            .await;

        Self {
            ctx,
            backend,
            _dispatcher: dispatcher,
        }
    }

    fn finished(&self, topic: &str, channel: &str) -> u64 {
        self.ctx
            .queue
            .channel_stats(topic, channel)
            .map_or(0, |s| s.finished)
    }

    /// Publishes one rotation tick and waits for its job to resolve.
    async fn rotate(&self) {
        let before = self.finished(clock::ELEVEN_MINUTES_TO_MIDNIGHT, "rotate_elasticsearch_indices");
        self.ctx.tick(clock::ELEVEN_MINUTES_TO_MIDNIGHT).await;
        eventually(WAIT, || {
            self.finished(clock::ELEVEN_MINUTES_TO_MIDNIGHT, "rotate_elasticsearch_indices") > before
        })
        .await;
    }

    /// Publishes one repair tick and waits for its job to resolve.
    async fn repair(&self) {
        let before = self.finished(clock::EVERY_MINUTE, "repair_elasticsearch_index_aliases");
        self.ctx.tick(clock::EVERY_MINUTE).await;
        eventually(WAIT, || {
            self.finished(clock::EVERY_MINUTE, "repair_elasticsearch_index_aliases") > before
        })
        .await;
    }

    async fn targets(&self) -> Vec<String> {
        self.backend.alias_targets(ALIAS).await.unwrap()
    }

    fn status(&self, index: &str) -> Option<IndexStatus> {
        self.backend.index_meta(index).map(|m| m.status)
    }
}

/// Active index created at `created` holding `documents` documents.
fn seed_active(backend: &MemoryBackend, created: DateTime<Utc>, documents: u64) -> String {
    let name = index_name(ALIAS, created);
    backend.insert_index(
        &name,
        IndexMeta::building(created)
            .with_status(IndexStatus::Active)
            .with_verified_count(documents),
        documents,
    );
    name
}

fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(days)
}

/// A rotation tick replaces a stale index with a verified copy in one swap.
#[tokio::test]
async fn test_rotation_tick_swaps_to_verified_copy() {
    let backend = MemoryBackend::new();
    let old = seed_active(&backend, days_ago(2), 25);
    backend.set_alias(ALIAS, &[&old]);
    let rc = RotationContext::new(backend).await;

    rc.rotate().await;

    let targets = rc.targets().await;
    assert_eq!(targets.len(), 1);
    let current = &targets[0];
    assert_ne!(current, &old);
    assert_eq!(rc.status(current), Some(IndexStatus::Active));
    assert_eq!(rc.status(&old), Some(IndexStatus::Superseded));
    assert_eq!(rc.backend.document_count(current), Some(25));
    assert_eq!(rc.backend.alias_history(ALIAS), vec![vec![current.clone()]]);
    assert_eq!(rc.ctx.reporter.count(), 0);
}

/// A second tick inside the rotation interval leaves the alias alone.
#[tokio::test]
async fn test_second_rotation_tick_is_skipped() {
    let backend = MemoryBackend::new();
    let old = seed_active(&backend, days_ago(2), 3);
    backend.set_alias(ALIAS, &[&old]);
    let rc = RotationContext::new(backend).await;

    rc.rotate().await;
    let after_first = rc.targets().await;
    rc.rotate().await;

    assert_eq!(rc.targets().await, after_first);
    assert_eq!(rc.backend.alias_history(ALIAS).len(), 1);
}

/// A rotation interrupted after the swap is finished by the next repair tick.
#[tokio::test]
async fn test_repair_tick_completes_interrupted_rotation() {
    let backend = MemoryBackend::new();
    let old = seed_active(&backend, days_ago(2), 4);
    backend.set_alias(ALIAS, &[&old]);
    let rc = RotationContext::new(backend).await;

    // Verifying and verified-count writes pass, superseding the old index fails.
    rc.backend.fail_with(FailPoint::UpdateMeta, 2, 503);
    rc.rotate().await;

    let reports = rc.ctx.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].0.retryable);
    let targets = rc.targets().await;
    let current = targets[0].clone();
    assert_eq!(rc.status(&current), Some(IndexStatus::Verifying));

    rc.repair().await;

    assert_eq!(rc.targets().await, vec![current.clone()]);
    assert_eq!(rc.status(&current), Some(IndexStatus::Active));
    assert_eq!(rc.status(&old), Some(IndexStatus::Superseded));
}

/// An alias left pointing at a deleted index is moved to the newest verified
/// index.
#[tokio::test]
async fn test_repair_tick_repoints_dangling_alias() {
    let backend = MemoryBackend::new();
    let older = seed_active(&backend, days_ago(3), 2);
    let newer = seed_active(&backend, days_ago(1), 2);
    backend.set_alias(ALIAS, &["audit-events-deleted"]);
    let rc = RotationContext::new(backend).await;

    rc.repair().await;

    assert_eq!(rc.targets().await, vec![newer.clone()]);
    assert_eq!(rc.status(&older), Some(IndexStatus::Superseded));
    assert_eq!(rc.status(&newer), Some(IndexStatus::Active));
}

/// Rotation and repair ticks racing each other never point the alias at an
/// index that has not passed verification.
#[tokio::test]
async fn test_alias_only_points_at_verified_indices() {
    let backend = MemoryBackend::new();
    let old = seed_active(&backend, days_ago(2), 50);
    backend.set_alias(ALIAS, &[&old]);
    let rc = RotationContext::new(backend).await;

    rc.ctx.tick(clock::ELEVEN_MINUTES_TO_MIDNIGHT).await;
    for _ in 0..5 {
        rc.ctx.tick(clock::EVERY_MINUTE).await;
    }
    eventually(WAIT, || {
        rc.finished(clock::ELEVEN_MINUTES_TO_MIDNIGHT, "rotate_elasticsearch_indices") == 1
            && rc.finished(clock::EVERY_MINUTE, "repair_elasticsearch_index_aliases") == 5
    })
    .await;

    for targets in rc.backend.alias_history(ALIAS) {
        for target in targets {
            let meta = rc.backend.index_meta(&target).expect("swapped to a missing index");
            assert!(meta.verified_count.is_some(), "{} was never verified", target);
        }
    }
    let targets = rc.targets().await;
    assert_eq!(targets.len(), 1);
    assert_eq!(rc.status(&targets[0]), Some(IndexStatus::Active));
    assert_eq!(rc.backend.document_count(&targets[0]), Some(50));
}
