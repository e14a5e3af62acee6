//! In-process topic/channel transport.
//!
//! Follows nsqd semantics:
//! - every channel of a topic receives its own copy of each message
//! - messages published before a topic has any channel are kept on the topic,
//!   up to a bound, and handed to the first channel that registers
//! - each delivery must be finished or requeued within the channel timeout,
//!   otherwise it is redelivered with the attempt counter incremented
//! - a delivery whose attempt counter exceeds `max_attempts` is discarded
//!   without reaching the handler

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use processor_core::{Error, Job, JobMeta, Resolution, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{Counter, Gauge};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ConsumerHandle, JobHandler, QueueClient};
use crate::config::ChannelConfig;

/// A message as stored by the transport, independent of any delivery.
#[derive(Debug, Clone)]
struct Envelope {
    message_id: Uuid,
    body: Bytes,
    attempts: u32,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    fn new(body: Bytes) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body,
            attempts: 1,
            timestamp: Utc::now(),
        }
    }

    fn redelivery(mut self) -> Self {
        self.attempts += 1;
        self
    }
}

/// Delivery counters for one channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub delivered: Counter,
    pub finished: Counter,
    pub requeued: Counter,
    pub timed_out: Counter,
    pub abandoned: Counter,
    pub discarded: Counter,
    pub in_flight: Gauge,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            delivered: self.delivered.get(),
            finished: self.finished.get(),
            requeued: self.requeued.get(),
            timed_out: self.timed_out.get(),
            abandoned: self.abandoned.get(),
            discarded: self.discarded.get(),
            in_flight: self.in_flight.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    pub delivered: u64,
    pub finished: u64,
    pub requeued: u64,
    pub timed_out: u64,
    pub abandoned: u64,
    pub discarded: u64,
    pub in_flight: u64,
}

struct ChannelState {
    sender: mpsc::UnboundedSender<Envelope>,
    stats: Arc<ChannelStats>,
}

#[derive(Default)]
struct TopicState {
    channels: HashMap<String, ChannelState>,
    pending: VecDeque<Envelope>,
}

/// Everything a delivery task needs about its channel.
struct ChannelContext {
    topic: String,
    channel: String,
    config: ChannelConfig,
    handler: Arc<dyn JobHandler>,
    sender: mpsc::UnboundedSender<Envelope>,
    stats: Arc<ChannelStats>,
}

/// Messages kept per topic while it has no channel.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// In-process queue transport.
#[derive(Clone)]
pub struct MemoryQueue {
    topics: Arc<Mutex<HashMap<String, TopicState>>>,
    max_pending: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            topics: Arc::default(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the messages held on a topic with no channel; the oldest are
    /// dropped first.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Delivery counters for a registered channel.
    pub fn channel_stats(&self, topic: &str, channel: &str) -> Option<ChannelStatsSnapshot> {
        let topics = self.topics.lock();
        topics
            .get(topic)
            .and_then(|t| t.channels.get(channel))
            .map(|c| c.stats.snapshot())
    }

    /// Messages held on a topic that has no channel yet.
    pub fn pending(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |t| t.pending.len())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        config: ChannelConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Result<ConsumerHandle> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(ChannelStats::default());

        {
            let mut topics = self.topics.lock();
            let state = topics.entry(topic.to_string()).or_default();

            if state.channels.contains_key(channel) {
                return Err(Error::queue(format!(
                    "channel {}/{} already has a consumer",
                    topic, channel
                )));
            }

            let first_channel = state.channels.is_empty();
            state.channels.insert(
                channel.to_string(),
                ChannelState {
                    sender: sender.clone(),
                    stats: stats.clone(),
                },
            );

            if first_channel {
                for envelope in state.pending.drain(..) {
                    let _ = sender.send(envelope);
                }
            }
        }

        info!(
            topic = topic,
            channel = channel,
            max_attempts = config.max_attempts,
            timeout_secs = config.timeout.as_secs(),
            max_in_flight = config.max_in_flight,
            "Channel consumer registered"
        );

        let ctx = Arc::new(ChannelContext {
            topic: topic.to_string(),
            channel: channel.to_string(),
            config,
            handler,
            sender,
            stats,
        });
        let task = tokio::spawn(run_channel(ctx, receiver));

        Ok(ConsumerHandle::new(topic, channel, task))
    }

    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        let envelope = Envelope::new(body);
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();

        if state.channels.is_empty() {
            if state.pending.len() >= self.max_pending {
                if let Some(dropped) = state.pending.pop_front() {
                    warn!(
                        topic = topic,
                        message_id = %dropped.message_id,
                        max_pending = self.max_pending,
                        "Topic has no channel, dropped oldest held message"
                    );
                }
            }
            if self.max_pending > 0 {
                state.pending.push_back(envelope);
            }
            return Ok(());
        }

        for (name, channel) in &state.channels {
            if channel.sender.send(envelope.clone()).is_err() {
                debug!(topic = topic, channel = %name, "Channel consumer stopped, message dropped");
            }
        }

        Ok(())
    }
}

/// Pulls messages for one channel, never holding more than `max_in_flight`
/// unresolved deliveries.
async fn run_channel(ctx: Arc<ChannelContext>, mut receiver: mpsc::UnboundedReceiver<Envelope>) {
    let in_flight = Arc::new(Semaphore::new(ctx.config.max_in_flight));

    loop {
        let permit = match in_flight.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let Some(envelope) = receiver.recv().await else {
            break;
        };

        tokio::spawn(deliver(ctx.clone(), envelope, permit));
    }

    debug!(topic = %ctx.topic, channel = %ctx.channel, "Channel consumer loop ended");
}

async fn deliver(ctx: Arc<ChannelContext>, envelope: Envelope, permit: OwnedSemaphorePermit) {
    let max_attempts = ctx.config.max_attempts;

    if envelope.attempts > max_attempts {
        ctx.stats.discarded.inc();
        warn!(
            topic = %ctx.topic,
            channel = %ctx.channel,
            message_id = %envelope.message_id,
            attempts = envelope.attempts,
            max_attempts = max_attempts,
            "Discarding message after max attempts"
        );
        return;
    }

    let meta = JobMeta::new(ctx.topic.clone(), ctx.channel.clone())
        .with_attempts(envelope.attempts)
        .with_max_attempts(max_attempts)
        .with_timestamp(envelope.timestamp);
    let (job, resolution) = Job::new(meta, envelope.body.clone());

    ctx.stats.delivered.inc();
    ctx.stats.in_flight.inc();

    let handler = ctx.handler.clone();
    tokio::spawn(async move {
        handler.handle(job).await;
    });

    let outcome = tokio::time::timeout(ctx.config.timeout, resolution).await;

    ctx.stats.in_flight.dec();
    drop(permit);

    match outcome {
        Ok(Ok(Resolution::Finished)) => {
            ctx.stats.finished.inc();
        }
        Ok(Ok(Resolution::Requeued { delay })) => {
            ctx.stats.requeued.inc();
            debug!(
                topic = %ctx.topic,
                channel = %ctx.channel,
                message_id = %envelope.message_id,
                delay_ms = %delay.as_millis(),
                "Message requeued"
            );
            redeliver(&ctx, envelope.redelivery(), delay);
        }
        Ok(Err(_)) => {
            ctx.stats.abandoned.inc();
            warn!(
                topic = %ctx.topic,
                channel = %ctx.channel,
                message_id = %envelope.message_id,
                "Job dropped without finish or requeue, redelivering"
            );
            redeliver(&ctx, envelope.redelivery(), Duration::ZERO);
        }
        Err(_) => {
            ctx.stats.timed_out.inc();
            warn!(
                topic = %ctx.topic,
                channel = %ctx.channel,
                message_id = %envelope.message_id,
                timeout_secs = ctx.config.timeout.as_secs(),
                "Job timed out, redelivering"
            );
            redeliver(&ctx, envelope.redelivery(), Duration::ZERO);
        }
    }
}

fn redeliver(ctx: &ChannelContext, envelope: Envelope, delay: Duration) {
    let sender = ctx.sender.clone();

    if delay.is_zero() {
        let _ = sender.send(envelope);
        return;
    }

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = sender.send(envelope);
    });
}
