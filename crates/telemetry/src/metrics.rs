//! Job metrics.
//!
//! One timer (latency histogram plus success/error counters) per
//! `topic__channel` scope, and an error meter per channel.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name of the meter marked for every failed job, whatever its channel.
pub const JOB_ERRORS_METER: &str = "processor.waitForJobs.errors";

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(ms, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Value exceeds all buckets, add to last
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Timer for one `topic__channel` scope.
#[derive(Debug, Default)]
pub struct JobTimer {
    pub latency_ms: Histogram,
    pub successes: Counter,
    pub errors: Counter,
}

/// Where the dispatcher records job outcomes.
pub trait MetricsSink: Send + Sync {
    /// Records one completed worker invocation under `scope`.
    fn record_job(&self, scope: &str, elapsed: Duration, ok: bool);

    /// Marks the error meter for `channel`.
    fn mark_error(&self, channel: &str);
}

/// In-memory metrics registry, scraped through its snapshot.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    timers: RwLock<BTreeMap<String, Arc<JobTimer>>>,
    channel_errors: RwLock<BTreeMap<String, Arc<Counter>>>,
    job_errors: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the timer for a scope, creating it on first use.
    pub fn timer(&self, scope: &str) -> Arc<JobTimer> {
        if let Some(timer) = self.timers.read().get(scope) {
            return timer.clone();
        }

        self.timers
            .write()
            .entry(scope.to_string())
            .or_default()
            .clone()
    }

    /// Returns the error meter for a channel, creating it on first use.
    pub fn channel_errors(&self, channel: &str) -> Arc<Counter> {
        if let Some(counter) = self.channel_errors.read().get(channel) {
            return counter.clone();
        }

        self.channel_errors
            .write()
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    /// Failed jobs across all channels.
    pub fn job_errors(&self) -> u64 {
        self.job_errors.get()
    }

    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let timers = self
            .timers
            .read()
            .iter()
            .map(|(scope, timer)| {
                (
                    format!("processor.{}", scope),
                    TimerSnapshot {
                        count: timer.latency_ms.count(),
                        successes: timer.successes.get(),
                        errors: timer.errors.get(),
                        mean_ms: timer.latency_ms.mean(),
                        max_ms: timer.latency_ms.max(),
                    },
                )
            })
            .collect();

        let mut meters: BTreeMap<String, u64> = self
            .channel_errors
            .read()
            .iter()
            .map(|(channel, counter)| (format!("processor.{}.errors", channel), counter.get()))
            .collect();
        meters.insert(JOB_ERRORS_METER.to_string(), self.job_errors.get());

        MetricsSnapshot {
            timestamp: Utc::now(),
            timers,
            meters,
        }
    }
}

impl MetricsSink for MetricsRegistry {
    fn record_job(&self, scope: &str, elapsed: Duration, ok: bool) {
        let timer = self.timer(scope);
        timer.latency_ms.observe(elapsed.as_millis() as u64);
        if ok {
            timer.successes.inc();
        } else {
            timer.errors.inc();
        }
    }

    fn mark_error(&self, channel: &str) {
        self.job_errors.inc();
        self.channel_errors(channel).inc();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub successes: u64,
    pub errors: u64,
    pub mean_ms: f64,
    pub max_ms: u64,
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub timers: BTreeMap<String, TimerSnapshot>,
    pub meters: BTreeMap<String, u64>,
}
