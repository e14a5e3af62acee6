//! The worker contract.

use async_trait::async_trait;

use crate::error::JobError;
use crate::job::Job;

/// A unit of domain logic bound to one topic/channel.
///
/// Workers must be idempotent: the same logical event can be delivered more
/// than once, and a delivery abandoned by the transport may still run to
/// completion after its replacement was delivered. A worker never resolves the
/// job itself; it only classifies its failures.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn run(&self, job: &Job) -> Result<(), JobError>;
}
