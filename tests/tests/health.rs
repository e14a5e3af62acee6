//! Tests for the health and metrics endpoints.
//!
//! These tests verify the endpoints reflect what the dispatcher records: the
//! liveness heartbeat after acknowledged jobs, and per-scope job timers.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::fixtures::{binding, normalized_event};
use integration_tests::mocks::{ScriptedWorker, Step};
use integration_tests::setup::{eventually, TestContext};
use processor_core::{JobError, JobErrorKind};
use queue::topic;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Test /healthz returns the report structure
#[tokio::test]
async fn test_healthz_structure() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/healthz").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert!(body.get("status").is_some(), "Response should have 'status' field");
    assert!(body.get("age_ms").is_some(), "Response should have 'age_ms' field");
    assert!(body.get("beats").is_some(), "Response should have 'beats' field");
    assert!(
        body.get("components").map_or(false, |c| c.is_array()),
        "Response should have a 'components' array"
    );
}

/// Components that never reported only degrade the processor
#[tokio::test]
async fn test_unreported_components_degrade() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/healthz").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "degraded");

    ctx.health.postgres.set_healthy();
    ctx.health.search.set_healthy();

    let body: serde_json::Value = server.get("/healthz").await.json();
    assert_eq!(body["status"], "healthy");
}

/// Test the heartbeat advances once the dispatcher acknowledges a job
#[tokio::test]
async fn test_heartbeat_advances_after_dispatched_job() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let body: serde_json::Value = server.get("/healthz").await.json();
    assert!(body["last_delivery_ms"].is_null());
    assert_eq!(body["beats"], 0);

    let worker = ScriptedWorker::new("normalize", []);
    let _dispatcher = ctx
        .start(vec![binding(
            topic::RAW_EVENTS,
            "normalize",
            worker,
            1,
            Duration::from_secs(30),
            5,
        )])
        .await;
    ctx.publish(topic::RAW_EVENTS, &normalized_event("user.login"))
        .await;
    eventually(WAIT, || ctx.health.heartbeat.beats() == 1).await;

    let body: serde_json::Value = server.get("/healthz").await.json();
    assert_eq!(body["beats"], 1);
    assert!(body["last_delivery_ms"].as_i64().is_some());
}

/// Failed jobs do not refresh the heartbeat
#[tokio::test]
async fn test_failed_job_does_not_beat() {
    let ctx = TestContext::new();
    let worker = ScriptedWorker::new(
        "normalize",
        [Step::Fail(JobError::terminal(JobErrorKind::Decode, "not json"))],
    );
    let _dispatcher = ctx
        .start(vec![binding(
            topic::RAW_EVENTS,
            "normalize",
            worker,
            1,
            Duration::from_secs(30),
            5,
        )])
        .await;

    ctx.publish(topic::RAW_EVENTS, &normalized_event("user.login"))
        .await;
    eventually(WAIT, || ctx.reporter.count() == 1).await;

    assert_eq!(ctx.health.heartbeat.beats(), 0);
}

/// A heartbeat older than the allowed age fails the probe
#[tokio::test]
async fn test_stale_heartbeat_is_unavailable() {
    let ctx = TestContext::new();
    let state = api::AppState::new(ctx.health.clone(), ctx.registry.clone())
        .with_max_age(Duration::from_millis(1));
    let server = TestServer::new(api::router(state)).expect("Failed to create test server");

    tokio::time::sleep(Duration::from_millis(20)).await;

    let response = server.get("/healthz").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "unhealthy");
}

/// Test /health/live always returns 200 while the process runs
#[tokio::test]
async fn test_live_endpoint() {
    let ctx = TestContext::new();
    let state = api::AppState::new(ctx.health.clone(), ctx.registry.clone())
        .with_max_age(Duration::ZERO);
    let server = TestServer::new(api::router(state)).expect("Failed to create test server");

    let response = server.get("/health/live").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

/// Test /metrics exposes timers and error meters recorded by the dispatcher
#[tokio::test]
async fn test_metrics_reflect_dispatched_jobs() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");
    let worker = ScriptedWorker::new(
        "send",
        [Step::Fail(JobError::terminal(JobErrorKind::Upstream, "mailbox full"))],
    );
    let _dispatcher = ctx
        .start(vec![binding(topic::EMAILS, "send", worker, 10, Duration::from_secs(60), 10)])
        .await;

    ctx.publish(topic::EMAILS, &serde_json::json!({ "to": "a@example.com" }))
        .await;
    ctx.publish(topic::EMAILS, &serde_json::json!({ "to": "b@example.com" }))
        .await;
    eventually(WAIT, || ctx.health.heartbeat.beats() == 1 && ctx.reporter.count() == 1).await;

    let response = server.get("/metrics").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    let timer = &body["timers"]["processor.emails__send"];
    assert_eq!(timer["count"], 2);
    assert_eq!(timer["successes"], 1);
    assert_eq!(timer["errors"], 1);
    assert_eq!(body["meters"]["processor.send.errors"], 1);
    assert_eq!(body["meters"]["processor.waitForJobs.errors"], 1);
}
