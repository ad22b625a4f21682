use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service identity
    #[serde(default)]
    pub service: ServiceConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Redis connection configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Event stream configuration
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());

        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: EVENT_RELAY_)
            .add_source(
                config::Environment::with_prefix("EVENT_RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used for tracing and consumer identity
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection string
    pub url: Option<String>,

    /// Prefix for every key this service writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue backend type
    #[serde(default)]
    pub backend: QueueBackendKind,

    /// Queues the publisher is allowed to target
    #[serde(default = "default_known_queues")]
    pub known_queues: Vec<String>,

    /// Jobs processed in parallel per queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Rate limiter: max job starts per window
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,

    /// Rate limiter window (milliseconds)
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_ms: u64,

    /// Hard deadline per job execution (seconds)
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Delivery attempts before a job is permanently failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff (milliseconds)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Bounded wait when polling an empty queue (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a leased job stays invisible before it counts as stalled (seconds)
    #[serde(default = "default_lock_duration")]
    pub lock_duration_secs: u64,

    /// How often stalled jobs are reaped back into the queue (seconds)
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_secs: u64,

    /// Completed jobs kept for inspection
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,

    /// Failed jobs kept for inspection (larger cap)
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,

    /// Run the background queue in a separate worker process
    #[serde(default = "default_true")]
    pub background_out_of_process: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::default(),
            known_queues: default_known_queues(),
            concurrency: default_concurrency(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window(),
            job_timeout_secs: default_job_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            poll_interval_ms: default_poll_interval(),
            lock_duration_secs: default_lock_duration(),
            stalled_interval_secs: default_stalled_interval(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            background_out_of_process: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Enable the Redis Streams delivery path
    #[serde(default)]
    pub enabled: bool,

    /// Stream key events are appended to
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Dead-letter stream key
    #[serde(default = "default_dlq_key")]
    pub dlq_key: String,

    /// Consumer group name
    #[serde(default = "default_group")]
    pub group: String,

    /// Max entries fetched per read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Blocking read timeout (milliseconds)
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Deliveries before a message is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hard deadline per message handler (seconds)
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,

    /// How often abandoned messages are claimed (seconds)
    #[serde(default = "default_claim_interval")]
    pub claim_interval_secs: u64,

    /// Pending idle time before a message is eligible for claiming (milliseconds)
    #[serde(default = "default_min_idle")]
    pub min_idle_ms: u64,

    /// Approximate cap on stream length (MAXLEN ~)
    #[serde(default = "default_max_len")]
    pub max_len: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stream_key: default_stream_key(),
            dlq_key: default_dlq_key(),
            group: default_group(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            max_retries: default_max_retries(),
            handler_timeout_secs: default_handler_timeout(),
            claim_interval_secs: default_claim_interval(),
            min_idle_ms: default_min_idle(),
            max_len: default_max_len(),
        }
    }
}

// Default value functions
fn default_service_name() -> String {
    "event-relay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "event-relay".to_string()
}

fn default_known_queues() -> Vec<String> {
    vec![
        crate::events::EVENTS_QUEUE.to_string(),
        crate::events::BACKGROUND_QUEUE.to_string(),
    ]
}

fn default_concurrency() -> usize {
    4
}

fn default_rate_limit_max() -> u32 {
    100
}

fn default_rate_limit_window() -> u64 {
    1000
}

fn default_job_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    500
}

fn default_lock_duration() -> u64 {
    30
}

fn default_stalled_interval() -> u64 {
    30
}

fn default_keep_completed() -> usize {
    100
}

fn default_keep_failed() -> usize {
    1000
}

fn default_stream_key() -> String {
    "event-relay:events".to_string()
}

fn default_dlq_key() -> String {
    "event-relay:events:dlq".to_string()
}

fn default_group() -> String {
    "event-relay".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_block_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_handler_timeout() -> u64 {
    30
}

fn default_claim_interval() -> u64 {
    30
}

fn default_min_idle() -> u64 {
    60_000
}

fn default_max_len() -> u64 {
    10_000
}
