//! End-to-end tests for job dispatch.
//!
//! These tests run the real registry, dispatcher and workers on top of the
//! in-process queue:
//! Publish → MemoryQueue → BindingHandler → Worker → finish / requeue
//!
//! Most run under a paused clock so the 15 second requeue delay and channel
//! timeouts elapse instantly.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use integration_tests::fixtures::{binding, normalized_event};
use integration_tests::logs::CapturedLogs;
use integration_tests::mocks::{ScriptedWorker, Step};
use integration_tests::setup::{eventually, TestContext};
use processor_core::{Job, JobError, JobErrorKind, Worker};
use queue::{topic, ChannelStatsSnapshot};
use search::{index_name, FailPoint, IndexMeta, IndexStatus, MemoryBackend};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Level;
use worker::{
    build_bindings, FeatureFlags, LoggingWorker, SaveToSearchWorker, WorkerCatalog, WorkerRole,
};

const WAIT: Duration = Duration::from_secs(120);

fn stats(ctx: &TestContext, topic: &str, channel: &str) -> ChannelStatsSnapshot {
    ctx.queue
        .channel_stats(topic, channel)
        .expect("channel should be registered")
}

fn logging_catalog() -> WorkerCatalog {
    WorkerCatalog::from_fn(|role| Arc::new(LoggingWorker::new(role.as_str())))
}

/// Backend with one active index behind `audit-events`.
fn search_backend() -> (MemoryBackend, String) {
    let backend = MemoryBackend::new();
    let created = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let index = index_name("audit-events", created);
    backend.insert_index(
        &index,
        IndexMeta::building(created)
            .with_status(IndexStatus::Active)
            .with_verified_count(0),
        0,
    );
    backend.set_alias("audit-events", &[&index]);
    (backend, index)
}

struct PanickingWorker;

#[async_trait]
impl Worker for PanickingWorker {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn run(&self, _job: &Job) -> Result<(), JobError> {
        panic!("bad payload");
    }
}

/// A transient search failure is retried once, 15 seconds later, and the
/// event lands in the index.
#[tokio::test(start_paused = true)]
async fn test_save_to_search_retries_transient_failure() {
    let ctx = TestContext::new();
    let (backend, index) = search_backend();
    let catalog = logging_catalog().with(
        WorkerRole::SaveToElasticsearch,
        Arc::new(SaveToSearchWorker::new(Arc::new(backend.clone()), "audit-events")),
    );
    let _dispatcher = ctx
        .start(build_bindings(FeatureFlags::default(), &catalog))
        .await;

    backend.fail_next(FailPoint::IndexDocument);
    let event = normalized_event("user.login");
    let id = event["id"].as_str().unwrap().to_string();
    let published = Instant::now();
    ctx.publish(topic::NORMALIZED_EVENTS, &event).await;

    eventually(WAIT, || backend.document(&index, &id).is_some()).await;
    let elapsed = published.elapsed();

    assert!(elapsed >= Duration::from_secs(15), "retried after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(16), "retried after {:?}", elapsed);
    assert_eq!(backend.document(&index, &id), Some(event));

    eventually(WAIT, || {
        stats(&ctx, topic::NORMALIZED_EVENTS, "save_to_elasticsearch").finished == 1
    })
    .await;
    let snapshot = stats(&ctx, topic::NORMALIZED_EVENTS, "save_to_elasticsearch");
    assert_eq!(snapshot.delivered, 2);
    assert_eq!(snapshot.requeued, 1);

    let reports = ctx.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].0.retryable);
    assert_eq!(reports[0].0.kind, JobErrorKind::Search);
    assert_eq!(reports[0].1.attempts, 1);

    let scope = "normalized_events__save_to_elasticsearch".to_string();
    let outcomes: Vec<bool> = ctx
        .metrics
        .jobs()
        .into_iter()
        .filter(|(s, _)| *s == scope)
        .map(|(_, ok)| ok)
        .collect();
    assert_eq!(outcomes, vec![false, true]);
}

/// A failure object whose `retry` is the string "true" is terminal.
#[tokio::test(start_paused = true)]
async fn test_string_retry_flag_is_not_retried() {
    let ctx = TestContext::new();
    let worker = ScriptedWorker::new(
        "save_to_elasticsearch",
        [Step::Fail(JobError::from_failure_value(
            &serde_json::json!({ "retry": "true" }),
        ))],
    );
    let _dispatcher = ctx
        .start(vec![binding(
            topic::NORMALIZED_EVENTS,
            "save_to_elasticsearch",
            worker.clone(),
            3,
            Duration::from_secs(30),
            5,
        )])
        .await;

    ctx.publish(topic::NORMALIZED_EVENTS, &normalized_event("user.login"))
        .await;
    eventually(WAIT, || {
        stats(&ctx, topic::NORMALIZED_EVENTS, "save_to_elasticsearch").finished == 1
    })
    .await;

    // Well past the requeue delay
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(worker.calls(), 1);
    let snapshot = stats(&ctx, topic::NORMALIZED_EVENTS, "save_to_elasticsearch");
    assert_eq!(snapshot.requeued, 0);
    assert_eq!(snapshot.delivered, 1);
    assert_eq!(ctx.reporter.count(), 1);
    assert_eq!(ctx.metrics.errors(), vec!["save_to_elasticsearch".to_string()]);
    assert_eq!(ctx.heartbeat.beats(), 0);
}

/// A retryable failure is delivered again at least 15 seconds later with the
/// attempt counter advanced.
#[tokio::test(start_paused = true)]
async fn test_requeue_spacing_and_attempts() {
    let ctx = TestContext::new();
    let worker = ScriptedWorker::new(
        "normalize",
        [Step::Fail(JobError::retryable(JobErrorKind::Upstream, "geo lookup timed out"))],
    );
    let _dispatcher = ctx
        .start(vec![binding(
            topic::RAW_EVENTS,
            "normalize",
            worker.clone(),
            3,
            Duration::from_secs(30),
            5,
        )])
        .await;

    ctx.publish(topic::RAW_EVENTS, &normalized_event("user.login"))
        .await;
    eventually(WAIT, || worker.calls() == 2).await;

    let invocations = worker.invocations();
    assert_eq!(invocations[0].attempts, 1);
    assert_eq!(invocations[1].attempts, 2);
    assert!(invocations[1].at - invocations[0].at >= Duration::from_secs(15));

    eventually(WAIT, || ctx.heartbeat.beats() == 1).await;
}

/// The transport discards a message once its attempts exceed the channel's
/// `max_attempts`, without running the worker again.
#[tokio::test(start_paused = true)]
async fn test_transport_discards_after_max_attempts() {
    let ctx = TestContext::new();
    let failure = || Step::Fail(JobError::retryable(JobErrorKind::Storage, "connection reset"));
    let worker = ScriptedWorker::new("save_active_actor", [failure(), failure(), failure()]);
    let _dispatcher = ctx
        .start(vec![binding(
            topic::NORMALIZED_EVENTS,
            "save_active_actor",
            worker.clone(),
            2,
            Duration::from_secs(10),
            5,
        )])
        .await;

    ctx.publish(topic::NORMALIZED_EVENTS, &normalized_event("user.login"))
        .await;
    eventually(WAIT, || {
        stats(&ctx, topic::NORMALIZED_EVENTS, "save_active_actor").discarded == 1
    })
    .await;

    assert_eq!(worker.calls(), 2);
    assert_eq!(ctx.reporter.count(), 2);
    let snapshot = stats(&ctx, topic::NORMALIZED_EVENTS, "save_active_actor");
    assert_eq!(snapshot.requeued, 2);
    assert_eq!(snapshot.finished, 0);
}

/// A job taking longer than the slow threshold logs exactly one warning.
#[tokio::test(start_paused = true)]
async fn test_slow_job_logs_one_warning() {
    let (logs, _guard) = CapturedLogs::install();
    let ctx = TestContext::new();
    let worker = ScriptedWorker::sleeping("analyze_day", Duration::from_millis(300), 1);
    let _dispatcher = ctx
        .start(vec![binding(
            topic::ENVIRONMENT_DAY,
            "analyze_day",
            worker,
            1,
            Duration::from_secs(10),
            5,
        )])
        .await;

    ctx.publish(topic::ENVIRONMENT_DAY, &serde_json::json!({ "environment_id": "env_1" }))
        .await;
    eventually(WAIT, || ctx.heartbeat.beats() == 1).await;

    let warnings = logs.matching(Level::WARN, "Slow job");
    assert_eq!(warnings.len(), 1);
    let elapsed_ms: u64 = warnings[0].field("elapsed_ms").unwrap().parse().unwrap();
    assert!(elapsed_ms >= 300);
    assert_eq!(warnings[0].field("channel"), Some("analyze_day"));
    assert_eq!(warnings[0].field("topic"), Some("environment_day"));
}

/// Fast jobs log no warnings at all.
#[tokio::test(start_paused = true)]
async fn test_fast_job_logs_no_warning() {
    let (logs, _guard) = CapturedLogs::install();
    let ctx = TestContext::new();
    let worker = ScriptedWorker::new("analyze_day", []);
    let _dispatcher = ctx
        .start(vec![binding(
            topic::ENVIRONMENT_DAY,
            "analyze_day",
            worker,
            1,
            Duration::from_secs(10),
            5,
        )])
        .await;

    ctx.publish(topic::ENVIRONMENT_DAY, &serde_json::json!({ "environment_id": "env_1" }))
        .await;
    eventually(WAIT, || ctx.heartbeat.beats() == 1).await;

    assert_eq!(logs.count(Level::WARN), 0);
}

/// Failures are logged with the retry decision.
#[tokio::test(start_paused = true)]
async fn test_failure_logs_retry_decision() {
    let (logs, _guard) = CapturedLogs::install();
    let ctx = TestContext::new();
    let worker = ScriptedWorker::new(
        "send",
        [
            Step::Fail(JobError::retryable(JobErrorKind::Upstream, "smtp 421")),
            Step::Fail(JobError::terminal(JobErrorKind::Decode, "missing recipient")),
        ],
    );
    let _dispatcher = ctx
        .start(vec![binding(topic::EMAILS, "send", worker, 10, Duration::from_secs(60), 10)])
        .await;

    ctx.publish(topic::EMAILS, &serde_json::json!({ "to": "ops@example.com" }))
        .await;
    eventually(WAIT, || stats(&ctx, topic::EMAILS, "send").finished == 1).await;

    assert_eq!(logs.matching(Level::ERROR, "Job failed").len(), 2);
    assert_eq!(logs.matching(Level::INFO, "Job will be retried").len(), 1);
    assert_eq!(logs.matching(Level::ERROR, "Job will NOT be retried").len(), 1);
}

/// With `max_in_flight = 1` the worker never runs twice at once, even when a
/// slow delivery times out and the transport redelivers it.
#[tokio::test(start_paused = true)]
async fn test_max_in_flight_holds_under_timeout_redelivery() {
    let ctx = TestContext::new();
    let worker = ScriptedWorker::new("clear_ingest_backlog", [Step::Sleep(Duration::from_secs(3))]);
    let _dispatcher = ctx
        .start(vec![binding(
            "backlog_probe",
            "clear_ingest_backlog",
            worker.clone(),
            10,
            Duration::from_secs(1),
            1,
        )])
        .await;

    ctx.tick("backlog_probe").await;
    eventually(WAIT, || stats(&ctx, "backlog_probe", "clear_ingest_backlog").finished == 1).await;

    let snapshot = stats(&ctx, "backlog_probe", "clear_ingest_backlog");
    assert!(snapshot.timed_out >= 1);
    assert!(worker.calls() >= 2);
    assert_eq!(worker.peak_concurrency(), 1);
}

/// Many messages on a bounded channel never exceed its in-flight limit.
#[tokio::test(start_paused = true)]
async fn test_max_in_flight_caps_concurrency() {
    let ctx = TestContext::new();
    let worker = ScriptedWorker::sleeping("stream_event", Duration::from_millis(100), 20);
    let _dispatcher = ctx
        .start(vec![binding(
            topic::NORMALIZED_EVENTS,
            "stream_event",
            worker.clone(),
            1,
            Duration::from_secs(10),
            5,
        )])
        .await;

    for event in integration_tests::fixtures::normalized_events(20) {
        ctx.publish(topic::NORMALIZED_EVENTS, &event).await;
    }
    eventually(WAIT, || stats(&ctx, topic::NORMALIZED_EVENTS, "stream_event").finished == 20).await;

    assert_eq!(worker.calls(), 20);
    assert_eq!(worker.peak_concurrency(), 5);
}

/// Every channel of `normalized_events` gets its own copy of each event.
#[tokio::test]
async fn test_normalized_events_fan_out_to_every_channel() {
    let ctx = TestContext::new();
    let mut workers: HashMap<WorkerRole, Arc<ScriptedWorker>> = HashMap::new();
    for role in WorkerRole::ALL {
        workers.insert(role, ScriptedWorker::new(role.as_str(), []));
    }
    let catalog = WorkerCatalog::from_fn(|role| workers[&role].clone());
    let dispatcher = ctx
        .start(build_bindings(FeatureFlags::default(), &catalog))
        .await;
    assert_eq!(dispatcher.consumers().len(), 17);

    ctx.publish(topic::NORMALIZED_EVENTS, &normalized_event("document.viewed"))
        .await;

    let subscribed = [
        WorkerRole::SaveToElasticsearch,
        WorkerRole::StreamEvent,
        WorkerRole::SaveActiveActor,
        WorkerRole::SaveActiveGroup,
    ];
    eventually(WAIT, || subscribed.iter().all(|role| workers[role].calls() == 1)).await;

    for role in WorkerRole::ALL {
        let expected = usize::from(subscribed.contains(&role));
        assert_eq!(workers[&role].calls(), expected, "{}", role);
    }
    assert_eq!(ctx.heartbeat.beats(), 4);
}

/// With the alternate search toggle, events go to `index_events` instead.
#[tokio::test]
async fn test_alternate_search_routes_to_index_events() {
    let ctx = TestContext::new();
    let index_events = ScriptedWorker::new("index_events", []);
    let catalog = logging_catalog().with(WorkerRole::IndexEvents, index_events.clone());
    let flags = FeatureFlags::from_lookup(|name| name == "PG_SEARCH");
    let _dispatcher = ctx.start(build_bindings(flags, &catalog)).await;

    assert!(ctx
        .queue
        .channel_stats(topic::NORMALIZED_EVENTS, "save_to_elasticsearch")
        .is_none());

    ctx.publish(topic::NORMALIZED_EVENTS, &normalized_event("user.login"))
        .await;
    eventually(WAIT, || index_events.calls() == 1).await;
}

/// Messages published before any consumer registers are delivered once one
/// does.
#[tokio::test]
async fn test_messages_published_before_registration_are_delivered() {
    let ctx = TestContext::new();
    let worker = ScriptedWorker::new("normalize", []);

    ctx.publish(topic::RAW_EVENTS, &normalized_event("user.login"))
        .await;
    ctx.publish(topic::RAW_EVENTS, &normalized_event("user.logout"))
        .await;
    assert_eq!(ctx.queue.pending(topic::RAW_EVENTS), 2);

    let _dispatcher = ctx
        .start(vec![binding(
            topic::RAW_EVENTS,
            "normalize",
            worker.clone(),
            1,
            Duration::from_secs(30),
            5,
        )])
        .await;

    eventually(WAIT, || worker.calls() == 2).await;
    assert_eq!(ctx.queue.pending(topic::RAW_EVENTS), 0);
}

/// A panicking worker is reported as a terminal failure and the channel
/// keeps serving later messages.
#[tokio::test]
async fn test_worker_panic_is_terminal() {
    let ctx = TestContext::new();
    let _dispatcher = ctx
        .start(vec![binding(
            topic::USER_REPORTING_TASK,
            "save_user_reporting_event",
            Arc::new(PanickingWorker),
            3,
            Duration::from_secs(10),
            5,
        )])
        .await;

    ctx.publish(topic::USER_REPORTING_TASK, &serde_json::json!({ "id": "r1" }))
        .await;
    ctx.publish(topic::USER_REPORTING_TASK, &serde_json::json!({ "id": "r2" }))
        .await;
    eventually(WAIT, || {
        stats(&ctx, topic::USER_REPORTING_TASK, "save_user_reporting_event").finished == 2
    })
    .await;

    let reports = ctx.reporter.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|(err, _)| err.kind == JobErrorKind::Panicked && !err.retryable));
    assert_eq!(
        stats(&ctx, topic::USER_REPORTING_TASK, "save_user_reporting_event").requeued,
        0
    );
}
