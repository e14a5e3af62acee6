//! Core types for the audit event processor.
//!
//! - `Job`: one delivery of a queue message, resolved by finish or requeue
//! - `JobError`: typed worker failure carrying the retry signal
//! - `Worker`: the contract every topic/channel worker implements

pub mod error;
pub mod job;
pub mod worker;

pub use error::{Error, JobError, JobErrorKind, Result};
pub use job::*;
pub use worker::*;
