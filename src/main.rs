//! Audit Event Processor
//!
//! Asynchronous job-dispatch backbone of the audit log service:
//! - Topic/channel consumers with per-channel attempt, timeout and in-flight limits
//! - Elasticsearch indexing of normalized events
//! - Index rotation and alias repair on clock topics
//! - Liveness heartbeat and metrics over HTTP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{error, info, warn};

use api::AppState;
use queue::MemoryQueue;
use search::{ElasticsearchClient, IndexRotator, MemoryBackend, RepairOutcome, SearchBackend, SearchConfig};
use telemetry::{init_tracing_from_env, HealthRegistry, LogReporter, MetricsRegistry, ReporterConfig};
use worker::{
    build_bindings, wait_for_signal, ClockScheduler, Dispatcher, FeatureFlags, Instrumentation,
    LoggingWorker, RepairAliasesWorker, RotateIndicesWorker, SaveToSearchWorker,
    ShutdownCoordinator, WorkerCatalog, WorkerRole,
};

/// Postgres pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    host: String,
    #[serde(default = "default_pg_port")]
    port: u16,
    #[serde(default = "default_pg_user")]
    user: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_pg_database")]
    database: String,
    #[serde(default = "default_pool_size")]
    pool_size: u32,
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_database() -> String {
    "retraced".to_string()
}

fn default_pool_size() -> u32 {
    10
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: None,
            database: default_pg_database(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClockConfig {
    /// Publish the clock topics from this process.
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,

    /// `/healthz` fails once no job succeeded for this long.
    #[serde(default = "default_health_max_age_secs")]
    health_max_age_secs: u64,

    /// Upper bound on closing the Postgres pool at shutdown.
    #[serde(default = "default_drain_timeout_secs")]
    drain_timeout_secs: u64,

    #[serde(default)]
    search: SearchConfig,

    #[serde(default)]
    postgres: PostgresConfig,

    #[serde(default)]
    reporter: ReporterConfig,

    #[serde(default)]
    clock: ClockConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_health_max_age_secs() -> u64 {
    300
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_max_age_secs: default_health_max_age_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            search: SearchConfig::default(),
            postgres: PostgresConfig::default(),
            reporter: ReporterConfig::default(),
            clock: ClockConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting Audit Processor v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let flags = FeatureFlags::from_env();
    info!(
        alternate_search = flags.alternate_search,
        streaming_disabled = flags.streaming_disabled,
        "Loaded feature flags"
    );

    // Connections are opened on first use
    let pool = connect_postgres(&config.postgres);

    let backend = search_backend(&config.search)?;

    let health = Arc::new(HealthRegistry::new());
    let metrics = Arc::new(MetricsRegistry::new());
    check_health(&health, &pool, backend.as_ref()).await;

    let rotator = Arc::new(IndexRotator::new(backend.clone(), &config.search));
    if !flags.alternate_search {
        ensure_aliases(&rotator, &config.search.aliases).await;
    }

    let catalog = worker_catalog(&config.search, backend, rotator);
    let bindings = build_bindings(flags, &catalog);

    let queue = Arc::new(MemoryQueue::new());
    let clock = ClockScheduler::for_bindings(queue.clone(), &bindings);
    let dispatcher = Dispatcher::new(
        queue.clone(),
        Instrumentation {
            metrics: metrics.clone(),
            reporter: Arc::new(LogReporter::new(&config.reporter)),
            heartbeat: health.clone(),
        },
    );
    let coordinator = ShutdownCoordinator::new(
        Arc::new(pool),
        Duration::from_secs(config.drain_timeout_secs),
    );

    if let Err(e) = dispatcher.start(bindings).await {
        error!("Failed to register consumers: {}", e);
        std::process::exit(coordinator.shutdown().await);
    }
    info!(consumers = dispatcher.consumers().len(), "All consumers registered");

    let _clock_handles = if config.clock.enabled {
        Arc::new(clock).start()
    } else {
        info!("Clock scheduler disabled, expecting clock topics from outside");
        Vec::new()
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;
    let state = AppState::new(health.clone(), metrics.clone())
        .with_max_age(Duration::from_secs(config.health_max_age_secs));
    let server = tokio::spawn(async move {
        if let Err(e) = api::serve(addr, state).await {
            error!("Health endpoint failed: {}", e);
        }
    });

    tokio::select! {
        _ = wait_for_signal() => {}
        err = dispatcher.wait_for_failure() => {
            error!("Consumer failed: {}", err);
        }
    }

    dispatcher.stop();
    server.abort();

    let code = coordinator.shutdown().await;
    std::process::exit(code);
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("PROCESSOR")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // Flat variables shared with the rest of the deployment
    if let Ok(nodes) = std::env::var("ELASTICSEARCH_NODES") {
        config.search.nodes = nodes
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(username) = std::env::var("ELASTICSEARCH_USERNAME") {
        config.search.username = Some(username);
    }
    if let Ok(password) = std::env::var("ELASTICSEARCH_PASSWORD") {
        config.search.password = Some(password);
    }
    if let Ok(timeout) = std::env::var("ELASTICSEARCH_REQUEST_TIMEOUT") {
        config.search.timeout_secs = timeout
            .parse()
            .context("ELASTICSEARCH_REQUEST_TIMEOUT must be a number of seconds")?;
    }

    if let Ok(host) = std::env::var("POSTGRES_HOST") {
        config.postgres.host = host;
    }
    if let Ok(port) = std::env::var("POSTGRES_PORT") {
        config.postgres.port = port.parse().context("POSTGRES_PORT must be a port number")?;
    }
    if let Ok(user) = std::env::var("POSTGRES_USER") {
        config.postgres.user = user;
    }
    if let Ok(password) = std::env::var("POSTGRES_PASSWORD") {
        config.postgres.password = Some(password);
    }
    if let Ok(database) = std::env::var("POSTGRES_DATABASE") {
        config.postgres.database = database;
    }
    if let Ok(size) = std::env::var("POSTGRES_POOL_SIZE") {
        config.postgres.pool_size = size.parse().context("POSTGRES_POOL_SIZE must be a number")?;
    }

    if let Ok(token) = std::env::var("BUGSNAG_TOKEN") {
        config.reporter.token = Some(token);
    }
    if let Ok(stage) = std::env::var("STAGE") {
        config.reporter.stage = Some(stage);
    }

    Ok(config)
}

fn connect_postgres(config: &PostgresConfig) -> PgPool {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.database);
    if let Some(password) = &config.password {
        options = options.password(password);
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy_with(options);

    info!(
        host = %config.host,
        database = %config.database,
        pool_size = config.pool_size,
        "Configured Postgres pool"
    );
    pool
}

fn search_backend(config: &SearchConfig) -> Result<Arc<dyn SearchBackend>> {
    if config.is_remote() {
        let client =
            ElasticsearchClient::new(config).context("Failed to create Elasticsearch client")?;
        info!(nodes = ?config.nodes, "Using Elasticsearch backend");
        Ok(Arc::new(client))
    } else {
        warn!("No Elasticsearch nodes configured, indexing into process memory");
        Ok(Arc::new(MemoryBackend::new()))
    }
}

/// Every role runs `LoggingWorker` except the search roles served here.
fn worker_catalog(
    config: &SearchConfig,
    backend: Arc<dyn SearchBackend>,
    rotator: Arc<IndexRotator>,
) -> WorkerCatalog {
    WorkerCatalog::from_fn(|role| Arc::new(LoggingWorker::new(role.as_str())))
        .with(
            WorkerRole::SaveToElasticsearch,
            Arc::new(SaveToSearchWorker::new(backend, config.write_alias.clone())),
        )
        .with(
            WorkerRole::RotateElasticsearchIndices,
            Arc::new(RotateIndicesWorker::new(rotator.clone(), config.aliases.clone())),
        )
        .with(
            WorkerRole::RepairElasticsearchIndexAliases,
            Arc::new(RepairAliasesWorker::new(rotator, config.aliases.clone())),
        )
}

/// Converges every alias before consuming; bootstraps aliases with no index.
async fn ensure_aliases(rotator: &IndexRotator, aliases: &[String]) {
    for alias in aliases {
        match rotator.ensure(alias).await {
            Ok(RepairOutcome::Healthy { index }) => {
                info!(alias = %alias, index = %index, "Alias healthy");
            }
            Ok(outcome) => info!(alias = %alias, outcome = ?outcome, "Alias repaired at startup"),
            Err(e) => error!(alias = %alias, "Startup alias repair failed: {}", e),
        }
    }
}

/// Check component health on startup.
async fn check_health(health: &HealthRegistry, pool: &PgPool, backend: &dyn SearchBackend) {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => {
            health.postgres.set_healthy();
            info!("Postgres connection: healthy");
        }
        Err(e) => {
            health.postgres.set_unhealthy(e.to_string());
            error!("Postgres connection: unhealthy: {}", e);
        }
    }

    if search::health::check_connection(backend).await {
        health.search.set_healthy();
        info!("Search backend connection: healthy");
    } else {
        health.search.set_unhealthy("Connection failed");
        error!("Search backend connection: unhealthy");
    }
}
