//! Delivered jobs.
//!
//! A `Job` wraps a single delivery of a queue message. The transport keeps the
//! receiving half of a oneshot channel and learns from it whether the job was
//! finished or requeued. Whichever resolution arrives first wins; every later
//! call is a no-op that returns `false`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{JobError, JobErrorKind};

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Permanently handled; the message is not delivered again.
    Finished,
    /// Returned to the channel, to be delivered again after `delay`.
    Requeued { delay: Duration },
}

/// Receiving half held by the transport for one delivery.
pub type ResolutionReceiver = oneshot::Receiver<Resolution>;

/// Identity and delivery bookkeeping of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMeta {
    /// Identity of this delivery instance (not of the payload).
    pub id: Uuid,
    pub topic: String,
    pub channel: String,
    /// 1-based delivery attempt.
    pub attempts: u32,
    pub max_attempts: u32,
    /// When the message was first published.
    pub timestamp: DateTime<Utc>,
}

impl JobMeta {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            channel: channel.into(),
            attempts: 1,
            max_attempts: 1,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl fmt::Display for JobMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} attempt {} of {}",
            self.topic, self.channel, self.id, self.attempts, self.max_attempts
        )
    }
}

/// One delivery of a queue message.
pub struct Job {
    meta: JobMeta,
    body: Bytes,
    resolver: Mutex<Option<oneshot::Sender<Resolution>>>,
}

impl Job {
    /// Creates a job and the receiver the transport waits on.
    pub fn new(meta: JobMeta, body: impl Into<Bytes>) -> (Self, ResolutionReceiver) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            meta,
            body: body.into(),
            resolver: Mutex::new(Some(tx)),
        };
        (job, rx)
    }

    pub fn meta(&self) -> &JobMeta {
        &self.meta
    }

    pub fn id(&self) -> Uuid {
        self.meta.id
    }

    pub fn topic(&self) -> &str {
        &self.meta.topic
    }

    pub fn channel(&self) -> &str {
        &self.meta.channel
    }

    pub fn attempts(&self) -> u32 {
        self.meta.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.meta.max_attempts
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decodes the body as JSON. A malformed body is a terminal failure.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            JobError::terminal(
                JobErrorKind::Decode,
                format!("invalid payload on {}/{}: {}", self.meta.topic, self.meta.channel, e),
            )
        })
    }

    /// Acknowledges the job. Returns `true` only for the call that resolved it.
    pub fn finish(&self) -> bool {
        self.resolve(Resolution::Finished)
    }

    /// Returns the job to its channel after `delay`.
    /// Returns `true` only for the call that resolved it.
    pub fn requeue(&self, delay: Duration) -> bool {
        self.resolve(Resolution::Requeued { delay })
    }

    /// Whether finish or requeue has already been called, or the transport
    /// has given up on this delivery.
    pub fn is_resolved(&self) -> bool {
        self.resolver
            .lock()
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }

    fn resolve(&self, resolution: Resolution) -> bool {
        match self.resolver.lock().take() {
            // A closed receiver means the delivery already expired.
            Some(tx) => tx.send(resolution).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("meta", &self.meta)
            .field("body_len", &self.body.len())
            .finish()
    }
}
