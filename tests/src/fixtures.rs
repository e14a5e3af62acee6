//! Test fixtures and event generators.

use bytes::Bytes;
use chrono::Utc;
use processor_core::Worker;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use worker::ConsumerBinding;

/// Generate a normalized audit event with a unique ID.
pub fn normalized_event(action: &str) -> serde_json::Value {
    serde_json::json!({
        "id": Uuid::new_v4().to_string(),
        "environment_id": "env_test",
        "action": action,
        "actor": { "id": "user_1", "name": "Test User" },
        "group": { "id": "org_1" },
        "occurred_at": Utc::now().to_rfc3339(),
    })
}

/// Generate N normalized events.
pub fn normalized_events(n: usize) -> Vec<serde_json::Value> {
    (0..n).map(|_| normalized_event("user.login")).collect()
}

/// Serialize an event into a queue message body.
pub fn message(event: &serde_json::Value) -> Bytes {
    Bytes::from(serde_json::to_vec(event).unwrap())
}

/// Binding with explicit limits, for topics outside the deployment tables.
pub fn binding(
    topic: &str,
    channel: &str,
    worker: Arc<dyn Worker>,
    max_attempts: u32,
    timeout: Duration,
    max_in_flight: usize,
) -> ConsumerBinding {
    ConsumerBinding::new(topic, channel, worker, max_attempts, timeout, max_in_flight)
        .expect("valid binding")
}
