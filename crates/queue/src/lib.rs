//! Topic/channel queue transport for the audit processor.

pub mod client;
pub mod config;
pub mod memory;
pub mod topics;

pub use client::*;
pub use config::*;
pub use memory::*;
pub use topics::*;
