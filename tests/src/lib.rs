//! Shared helpers for the audit processor integration tests.

pub mod fixtures;
