//! Error types for the audit processor.
//!
//! Two families:
//! - `Error`: infrastructure failures (queue, search backend, storage, config)
//! - `JobError`: a worker's failure, classified as retryable or terminal

use serde_json::Value;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("queue error: {0}")]
    Queue(String),

    #[error("search backend error: {0}")]
    Search(String),

    /// Search backend answered with a non-success status.
    #[error("search backend returned {status}: {message}")]
    SearchStatus { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn search(msg: impl Into<String>) -> Self {
        Self::Search(msg.into())
    }

    pub fn search_status(status: u16, msg: impl Into<String>) -> Self {
        Self::SearchStatus {
            status,
            message: msg.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation later can reasonably succeed.
    ///
    /// Transport errors and 429/5xx responses are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Queue(_) | Self::Search(_) | Self::Storage(_) => true,
            Self::SearchStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Config(_) | Self::Serialization(_) | Self::Internal(_) => false,
        }
    }
}

/// Broad category of a worker failure, used for logs and error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorKind {
    /// Payload could not be decoded.
    Decode,
    /// Relational storage failed.
    Storage,
    /// Search backend failed.
    Search,
    /// A downstream service failed.
    Upstream,
    /// An index rotation or repair cycle failed.
    Rotation,
    /// Worker panicked.
    Panicked,
    Internal,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Storage => "storage",
            Self::Search => "search",
            Self::Upstream => "upstream",
            Self::Rotation => "rotation",
            Self::Panicked => "panicked",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker failure.
///
/// `retryable` is the only signal the dispatcher looks at when deciding
/// between requeue and drop.
#[derive(Debug, Clone, Error)]
#[error("{kind} failure: {detail}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub retryable: bool,
    pub detail: String,
}

impl JobError {
    /// A transient failure; the job should be delivered again later.
    pub fn retryable(kind: JobErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: true,
            detail: detail.into(),
        }
    }

    /// A permanent failure; the job is dropped after being reported.
    pub fn terminal(kind: JobErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: false,
            detail: detail.into(),
        }
    }

    /// Wraps an infrastructure error, retryable when the error is transient.
    pub fn from_error(kind: JobErrorKind, err: &Error) -> Self {
        Self {
            kind,
            retryable: err.is_transient(),
            detail: err.to_string(),
        }
    }

    /// Builds a failure from an untyped failure object such as `{"retry": true}`.
    ///
    /// Only a JSON boolean `retry` field is honoured. A missing field, a
    /// string, a number or a non-object value all produce a terminal error.
    pub fn from_failure_value(value: &Value) -> Self {
        let retryable = matches!(value.get("retry"), Some(Value::Bool(true)));
        let detail = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string());

        Self {
            kind: JobErrorKind::Internal,
            retryable,
            detail,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::terminal(JobErrorKind::Decode, err.to_string())
    }
}
