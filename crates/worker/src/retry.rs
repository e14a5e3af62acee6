//! Retry decision for failed jobs.

use processor_core::{JobError, JobErrorKind};
use std::time::Duration;

/// What happens to a job after its worker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to its channel after the delay.
    Requeue(Duration),
    /// Acknowledge and drop the job.
    Drop,
}

/// Whether a failed job should be delivered again.
///
/// A worker panic is never retried; every other failure is retried exactly
/// when the worker flagged it retryable.
pub fn should_retry(err: &JobError) -> bool {
    match err.kind {
        JobErrorKind::Panicked => false,
        JobErrorKind::Decode
        | JobErrorKind::Storage
        | JobErrorKind::Search
        | JobErrorKind::Upstream
        | JobErrorKind::Rotation
        | JobErrorKind::Internal => err.retryable,
    }
}

pub fn decide(err: &JobError, delay: Duration) -> RetryDecision {
    if should_retry(err) {
        RetryDecision::Requeue(delay)
    } else {
        RetryDecision::Drop
    }
}
