//! Liveness heartbeat and component health.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use crate::metrics::Counter;

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Refreshed after every successfully acknowledged job.
pub trait Heartbeat: Send + Sync {
    fn beat(&self);
}

/// Timestamp of the last successful delivery, in epoch milliseconds.
///
/// Every beat moves the timestamp strictly forward, even when two beats land
/// in the same millisecond.
#[derive(Debug)]
pub struct LivenessHeartbeat {
    started_at_ms: i64,
    /// 0 until the first beat.
    last_ms: AtomicI64,
    beats: Counter,
}

impl LivenessHeartbeat {
    pub fn new() -> Self {
        Self {
            started_at_ms: Utc::now().timestamp_millis(),
            last_ms: AtomicI64::new(0),
            beats: Counter::new(),
        }
    }

    pub fn last_beat_ms(&self) -> Option<i64> {
        match self.last_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        self.last_beat_ms()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    pub fn beats(&self) -> u64 {
        self.beats.get()
    }

    /// Time since the last beat, or since startup when there was none yet.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let reference = self.last_beat_ms().unwrap_or(self.started_at_ms);
        let age_ms = now.timestamp_millis().saturating_sub(reference).max(0);
        Duration::from_millis(age_ms as u64)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    pub fn report(&self, now: DateTime<Utc>, max_age: Duration) -> LivenessReport {
        let age = self.age(now);
        LivenessReport {
            status: if age > max_age {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            },
            last_delivery_ms: self.last_beat_ms(),
            age_ms: age.as_millis() as u64,
            beats: self.beats(),
        }
    }
}

impl Default for LivenessHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat for LivenessHeartbeat {
    fn beat(&self) {
        let now = Utc::now().timestamp_millis();
        // fetch_update only fails when the closure returns None.
        let _ = self
            .last_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            });
        self.beats.inc();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessReport {
    pub status: HealthStatus,
    pub last_delivery_ms: Option<i64>,
    pub age_ms: u64,
    pub beats: u64,
}

/// Component health state.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    healthy: AtomicBool,
    message: parking_lot::RwLock<Option<String>>,
}

impl ComponentHealth {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(false),
            message: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        *self.message.write() = None;
    }

    pub fn set_unhealthy(&self, msg: impl Into<String>) {
        self.healthy.store(false, Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message(&self) -> Option<String> {
        self.message.read().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthReport {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Aggregated health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub liveness: LivenessReport,
    pub components: Vec<ComponentHealthReport>,
}

/// Health of the processor: the delivery heartbeat plus its backing services.
#[derive(Debug)]
pub struct HealthRegistry {
    pub heartbeat: LivenessHeartbeat,
    pub postgres: ComponentHealth,
    pub search: ComponentHealth,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            heartbeat: LivenessHeartbeat::new(),
            postgres: ComponentHealth::new("postgres"),
            search: ComponentHealth::new("search"),
        }
    }

    /// Generate a health report.
    ///
    /// A stale heartbeat makes the processor unhealthy; an unhealthy
    /// component only degrades it.
    pub fn report(&self, max_age: Duration) -> HealthReport {
        let liveness = self.heartbeat.report(Utc::now(), max_age);
        let components: Vec<ComponentHealthReport> = [&self.postgres, &self.search]
            .iter()
            .map(|c| ComponentHealthReport {
                name: c.name().to_string(),
                healthy: c.is_healthy(),
                message: c.message(),
            })
            .collect();

        let status = if !liveness.status.is_healthy() {
            HealthStatus::Unhealthy
        } else if components.iter().all(|c| c.healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            liveness,
            components,
        }
    }
}

impl Heartbeat for HealthRegistry {
    fn beat(&self) {
        self.heartbeat.beat();
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
