//! Consumer registry: which worker consumes which topic/channel, and with
//! what limits.
//!
//! The set of bindings is fixed at startup from two feature toggles.

use processor_core::{Error, Result, Worker};
use queue::{clock, topic, ChannelConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Deployment toggles selecting binding groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Index events through the alternate search path instead of
    /// Elasticsearch.
    pub alternate_search: bool,
    /// Skip the live streaming consumers.
    pub streaming_disabled: bool,
}

impl FeatureFlags {
    /// Reads `PG_SEARCH` and `NO_WARP_PIPE`; only their presence matters.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name).is_some())
    }

    pub fn from_lookup(is_set: impl Fn(&str) -> bool) -> Self {
        Self {
            alternate_search: is_set("PG_SEARCH"),
            streaming_disabled: is_set("NO_WARP_PIPE"),
        }
    }
}

/// Worker roles. Each role is consumed on the channel of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    SaveToElasticsearch,
    RotateElasticsearchIndices,
    RepairElasticsearchIndexAliases,
    IndexEvents,
    PrunePipeSessions,
    StreamEvent,
    Normalize,
    SaveActiveActor,
    SaveActiveGroup,
    ScheduleDailyReportsDue,
    NormalizeRepair,
    PruneViewerDescriptors,
    UpdateGeoData,
    AnalyzeDay,
    SaveUserReportingEvent,
    ClearIngestBacklog,
    ClearIngestQueue,
    SendEmail,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 18] = [
        Self::SaveToElasticsearch,
        Self::RotateElasticsearchIndices,
        Self::RepairElasticsearchIndexAliases,
        Self::IndexEvents,
        Self::PrunePipeSessions,
        Self::StreamEvent,
        Self::Normalize,
        Self::SaveActiveActor,
        Self::SaveActiveGroup,
        Self::ScheduleDailyReportsDue,
        Self::NormalizeRepair,
        Self::PruneViewerDescriptors,
        Self::UpdateGeoData,
        Self::AnalyzeDay,
        Self::SaveUserReportingEvent,
        Self::ClearIngestBacklog,
        Self::ClearIngestQueue,
        Self::SendEmail,
    ];

    /// Channel name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SaveToElasticsearch => "save_to_elasticsearch",
            Self::RotateElasticsearchIndices => "rotate_elasticsearch_indices",
            Self::RepairElasticsearchIndexAliases => "repair_elasticsearch_index_aliases",
            Self::IndexEvents => "index_events",
            Self::PrunePipeSessions => "prune_pipe_sessions",
            Self::StreamEvent => "stream_event",
            Self::Normalize => "normalize",
            Self::SaveActiveActor => "save_active_actor",
            Self::SaveActiveGroup => "save_active_group",
            Self::ScheduleDailyReportsDue => "schedule_daily_reports_due",
            Self::NormalizeRepair => "normalize_repair",
            Self::PruneViewerDescriptors => "prune_viewer_descriptors",
            Self::UpdateGeoData => "update_geo_data",
            Self::AnalyzeDay => "analyze_day",
            Self::SaveUserReportingEvent => "save_user_reporting_event",
            Self::ClearIngestBacklog => "clear_ingest_backlog",
            Self::ClearIngestQueue => "clear_ingest_queue",
            Self::SendEmail => "send",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One worker per role.
#[derive(Clone)]
pub struct WorkerCatalog {
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerCatalog {
    /// Builds a catalog by asking `make` for every role.
    pub fn from_fn(make: impl Fn(WorkerRole) -> Arc<dyn Worker>) -> Self {
        Self {
            workers: WorkerRole::ALL.iter().map(|role| make(*role)).collect(),
        }
    }

    /// Replaces the worker for `role`.
    pub fn with(mut self, role: WorkerRole, worker: Arc<dyn Worker>) -> Self {
        self.workers[role.index()] = worker;
        self
    }

    pub fn worker(&self, role: WorkerRole) -> Arc<dyn Worker> {
        self.workers[role.index()].clone()
    }
}

impl fmt::Debug for WorkerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.workers.iter().map(|w| w.name().to_string()))
            .finish()
    }
}

/// A worker subscribed to one topic/channel with its delivery limits.
#[derive(Clone)]
pub struct ConsumerBinding {
    topic: String,
    channel: String,
    worker: Arc<dyn Worker>,
    config: ChannelConfig,
}

impl ConsumerBinding {
    /// Creates a binding. All limits must be positive.
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        worker: Arc<dyn Worker>,
        max_attempts: u32,
        timeout: Duration,
        max_in_flight: usize,
    ) -> Result<Self> {
        let topic = topic.into();
        let channel = channel.into();
        if topic.is_empty() || channel.is_empty() {
            return Err(Error::config("binding topic and channel must be set"));
        }

        Ok(Self {
            topic,
            channel,
            worker,
            config: ChannelConfig::new(max_attempts, timeout, max_in_flight)?,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn max_in_flight(&self) -> usize {
        self.config.max_in_flight
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    /// Metrics scope, `topic__channel`.
    pub fn scope(&self) -> String {
        format!("{}__{}", self.topic, self.channel)
    }
}

impl fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("worker", &self.worker.name())
            .field("config", &self.config)
            .finish()
    }
}

/// (role, topic, max attempts, timeout seconds, max in flight)
type Row = (WorkerRole, &'static str, u32, u64, usize);

const SEARCH_GROUP: &[Row] = &[
    (WorkerRole::SaveToElasticsearch, topic::NORMALIZED_EVENTS, 3, 30, 5),
    (WorkerRole::RotateElasticsearchIndices, clock::ELEVEN_MINUTES_TO_MIDNIGHT, 1, 300, 1),
    (WorkerRole::RepairElasticsearchIndexAliases, clock::EVERY_MINUTE, 1, 300, 1),
];

const ALTERNATE_SEARCH_GROUP: &[Row] = &[
    (WorkerRole::IndexEvents, topic::NORMALIZED_EVENTS, 3, 20, 10),
];

const STREAMING_GROUP: &[Row] = &[
    (WorkerRole::PrunePipeSessions, clock::NINETEEN_PAST_HOUR, 1, 60, 1),
    (WorkerRole::StreamEvent, topic::NORMALIZED_EVENTS, 1, 10, 5),
];

const FIXED_GROUP: &[Row] = &[
    (WorkerRole::Normalize, topic::RAW_EVENTS, 1, 30, 5),
    (WorkerRole::SaveActiveActor, topic::NORMALIZED_EVENTS, 3, 10, 5),
    (WorkerRole::SaveActiveGroup, topic::NORMALIZED_EVENTS, 3, 10, 5),
    (WorkerRole::ScheduleDailyReportsDue, clock::FIFTY_THREE_PAST_HOUR, 1, 60, 1),
    (WorkerRole::NormalizeRepair, clock::EVERY_TEN_MINUTES, 1, 60, 1),
    (WorkerRole::PruneViewerDescriptors, clock::EVERY_TEN_MINUTES, 1, 60, 1),
    (WorkerRole::UpdateGeoData, clock::FIRST_WED_OF_MONTH, 1, 900, 1),
    (WorkerRole::AnalyzeDay, topic::ENVIRONMENT_DAY, 1, 10, 5),
    (WorkerRole::SaveUserReportingEvent, topic::USER_REPORTING_TASK, 1, 10, 5),
    (WorkerRole::ClearIngestBacklog, clock::EVERY_SECOND, 1, 10, 1),
    (WorkerRole::ClearIngestQueue, topic::UNSAVED_EVENTS, 20, 10, 10),
    (WorkerRole::SendEmail, topic::EMAILS, 10, 60, 10),
];

/// Builds the bindings for this deployment: the search group, then the
/// streaming group, then the bindings every deployment runs.
pub fn build_bindings(flags: FeatureFlags, catalog: &WorkerCatalog) -> Vec<ConsumerBinding> {
    let search = if flags.alternate_search {
        ALTERNATE_SEARCH_GROUP
    } else {
        SEARCH_GROUP
    };
    let streaming: &[Row] = if flags.streaming_disabled {
        &[]
    } else {
        STREAMING_GROUP
    };

    search
        .iter()
        .chain(streaming)
        .chain(FIXED_GROUP)
        .map(|&(role, topic, max_attempts, timeout_secs, max_in_flight)| ConsumerBinding {
            topic: topic.to_string(),
            channel: role.as_str().to_string(),
            worker: catalog.worker(role),
            config: ChannelConfig {
                max_attempts,
                timeout: Duration::from_secs(timeout_secs),
                max_in_flight,
            },
        })
        .collect()
}
