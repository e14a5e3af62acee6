//! Internal telemetry for the audit processor.
//!
//! Metrics, the liveness heartbeat and error reporting are injected into the
//! dispatcher as trait objects so the dispatch path never depends on a
//! concrete backend.

pub mod health;
pub mod metrics;
pub mod reporter;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use reporter::*;
pub use tracing_setup::*;
