//! Job dispatch backbone of the audit processor.
//!
//! - Registry: which worker consumes which topic/channel
//! - Dispatcher: runs workers and resolves every delivered job
//! - Retry: requeue or drop a failed job
//! - Shutdown: drains shared resources and picks the exit status
//! - Scheduler: publishes the wall-clock topics
//! - Workers: search indexing, index rotation and repair

pub mod dispatcher;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod workers;

pub use dispatcher::*;
pub use registry::*;
pub use retry::*;
pub use scheduler::*;
pub use shutdown::*;
pub use workers::*;
