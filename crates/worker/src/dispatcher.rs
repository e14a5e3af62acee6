//! Job dispatch: runs the bound worker for every delivered job and resolves
//! the job from the outcome.

use async_trait::async_trait;
use parking_lot::Mutex;
use processor_core::{Error, Job, JobError, JobErrorKind, Result};
use queue::{ConsumerHandle, JobHandler, QueueClient};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{ErrorReporter, Heartbeat, MetricsSink};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::ConsumerBinding;
use crate::retry::{decide, RetryDecision};

/// Dispatch timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Successful jobs taking at least this long are logged as slow.
    pub slow_job_threshold: Duration,
    /// Delay before a retryable failure is delivered again.
    pub requeue_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            slow_job_threshold: Duration::from_millis(250),
            requeue_delay: Duration::from_millis(15_000),
        }
    }
}

/// Sinks the dispatcher reports into.
#[derive(Clone)]
pub struct Instrumentation {
    pub metrics: Arc<dyn MetricsSink>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub heartbeat: Arc<dyn Heartbeat>,
}

/// Registers one consumer per binding and keeps their handles.
pub struct Dispatcher {
    queue: Arc<dyn QueueClient>,
    instrumentation: Instrumentation,
    config: DispatchConfig,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn QueueClient>, instrumentation: Instrumentation) -> Self {
        Self {
            queue,
            instrumentation,
            config: DispatchConfig::default(),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribes every binding. Fails on the first registration error.
    pub async fn start(&self, bindings: Vec<ConsumerBinding>) -> Result<()> {
        for binding in bindings {
            let topic = binding.topic().to_string();
            let channel = binding.channel().to_string();
            let config = binding.config();
            let handler = Arc::new(BindingHandler::new(
                binding,
                self.instrumentation.clone(),
                self.config,
            ));

            let handle = self
                .queue
                .consume(&topic, &channel, config, handler)
                .await?;

            info!(
                topic = %topic,
                channel = %channel,
                max_attempts = config.max_attempts,
                timeout_secs = config.timeout.as_secs(),
                max_in_flight = config.max_in_flight,
                "Consumer registered"
            );
            self.consumers.lock().push(handle);
        }

        Ok(())
    }

    /// `(topic, channel)` of every registered consumer.
    pub fn consumers(&self) -> Vec<(String, String)> {
        self.consumers
            .lock()
            .iter()
            .map(|h| (h.topic().to_string(), h.channel().to_string()))
            .collect()
    }

    /// Resolves once any consumer stops on its own.
    pub async fn wait_for_failure(&self) -> Error {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let consumers = self.consumers.lock();
            if let Some(dead) = consumers.iter().find(|h| h.is_finished()) {
                return Error::queue(format!(
                    "consumer {}/{} stopped",
                    dead.topic(),
                    dead.channel()
                ));
            }
        }
    }

    /// Stops accepting deliveries on every channel.
    pub fn stop(&self) {
        for handle in self.consumers.lock().iter() {
            handle.stop();
        }
    }
}

/// Handles deliveries for one binding.
pub struct BindingHandler {
    binding: ConsumerBinding,
    scope: String,
    permits: Arc<Semaphore>,
    instrumentation: Instrumentation,
    config: DispatchConfig,
}

impl BindingHandler {
    pub fn new(
        binding: ConsumerBinding,
        instrumentation: Instrumentation,
        config: DispatchConfig,
    ) -> Self {
        Self {
            scope: binding.scope(),
            permits: Arc::new(Semaphore::new(binding.max_in_flight())),
            binding,
            instrumentation,
            config,
        }
    }

    pub fn binding(&self) -> &ConsumerBinding {
        &self.binding
    }

    async fn dispatch(&self, job: Job) {
        let meta = job.meta().clone();
        debug!(
            "-> {} {} [attempt {} of {}]",
            meta.topic, meta.channel, meta.attempts, meta.max_attempts
        );

        // Only closed semaphores fail to hand out permits; this one never closes.
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let started = Instant::now();

        let job = Arc::new(job);
        let result = {
            let worker = self.binding.worker().clone();
            let job = job.clone();
            let span = info_span!("processor", scope = %self.scope, job_id = %meta.id);
            tokio::spawn(async move { worker.run(&job).await }.instrument(span)).await
        };
        let result = result.unwrap_or_else(|e| Err(join_failure(e)));
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let metrics = &self.instrumentation.metrics;
        match result {
            Ok(()) => {
                if !job.finish() {
                    debug!(job = %meta, "Delivery expired before the job finished");
                }
                if elapsed >= self.config.slow_job_threshold {
                    warn!(
                        topic = %meta.topic,
                        channel = %meta.channel,
                        job_id = %meta.id,
                        elapsed_ms,
                        "Slow job"
                    );
                }
                metrics.record_job(&self.scope, elapsed, true);
                self.instrumentation.heartbeat.beat();
            }
            Err(err) => {
                metrics.record_job(&self.scope, elapsed, false);
                metrics.mark_error(&meta.channel);
                self.instrumentation.reporter.notify(&err, &meta, elapsed);

                error!(
                    topic = %meta.topic,
                    channel = %meta.channel,
                    job_id = %meta.id,
                    attempts = meta.attempts,
                    elapsed_ms,
                    error = %err,
                    "Job failed"
                );

                match decide(&err, self.config.requeue_delay) {
                    RetryDecision::Requeue(delay) => {
                        job.requeue(delay);
                        info!(
                            job = %meta,
                            delay_ms = delay.as_millis() as u64,
                            "Job will be retried"
                        );
                    }
                    RetryDecision::Drop => {
                        job.finish();
                        error!(job = %meta, "Job will NOT be retried");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl JobHandler for BindingHandler {
    async fn handle(&self, job: Job) {
        self.dispatch(job).await;
    }
}

fn join_failure(err: JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::terminal(JobErrorKind::Internal, "worker task cancelled");
    }

    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string());
    JobError::terminal(JobErrorKind::Panicked, message)
}
