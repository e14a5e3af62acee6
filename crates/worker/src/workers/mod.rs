//! Worker implementations.

pub mod logging;
pub mod search;

pub use logging::LoggingWorker;
pub use search::{RepairAliasesWorker, RotateIndicesWorker, SaveToSearchWorker};
