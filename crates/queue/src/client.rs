//! Queue client contract.

use async_trait::async_trait;
use bytes::Bytes;
use processor_core::{Job, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::ChannelConfig;

/// Receives the jobs delivered to one channel.
///
/// The handler owns the job and is expected to resolve it (finish or
/// requeue). A job the handler drops unresolved is redelivered.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job);
}

/// Durable topic/channel pub-sub transport.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Starts delivering messages of `topic` to `handler` as competing
    /// consumer group `channel`.
    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        config: ChannelConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Result<ConsumerHandle>;

    /// Publishes a message to every channel of `topic`.
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()>;
}

/// A running channel consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    topic: String,
    channel: String,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            task,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stops accepting new deliveries. Jobs already handed to the handler run
    /// to completion.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
