//! Consumer-group subscriber for the Redis event stream
//!
//! Delivery is at-least-once: entries stay in the group's pending list until
//! the handler succeeds and we XACK. Failed or timed-out handlers leave the
//! entry pending so redelivery (or another consumer via XAUTOCLAIM) retries
//! it; once the delivery count reaches the retry ceiling the entry moves to
//! the dead-letter stream and is acknowledged.
//!
//! Lifecycle: Idle -> GroupEnsured -> Consuming -> Stopped.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::events::Event;
use crate::metrics::PIPELINE_METRICS;
use crate::registry::{HandlerRegistry, JobContext};
use crate::stream::codec::{self, StreamEntry};
use crate::stream::EVENT_FIELD;

/// Consumer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    GroupEnsured,
    Consuming,
    Stopped,
}

/// Stream consumption settings, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub stream_key: String,
    pub dlq_key: String,
    pub group: String,

    /// Unique within the group; stable per process
    pub consumer_name: String,

    /// Entries fetched (and processed concurrently) per read
    pub batch_size: usize,

    /// Blocking-read timeout per XREADGROUP call
    pub block_ms: u64,

    /// Delivery count at which an entry is dead-lettered
    pub max_retries: u32,

    /// Hard deadline per handler invocation
    pub handler_timeout: Duration,

    /// How often abandoned pending entries are claimed
    pub claim_interval: Duration,

    /// Minimum pending idle time before an entry can be claimed
    pub min_idle: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream_key: config.stream.stream_key.clone(),
            dlq_key: config.stream.dlq_key.clone(),
            group: config.stream.group.clone(),
            consumer_name: format!("{}-{}", config.service.name, std::process::id()),
            batch_size: config.stream.batch_size,
            block_ms: config.stream.block_ms,
            max_retries: config.stream.max_retries,
            handler_timeout: Duration::from_secs(config.stream.handler_timeout_secs),
            claim_interval: Duration::from_secs(config.stream.claim_interval_secs),
            min_idle: Duration::from_millis(config.stream.min_idle_ms),
        }
    }
}

/// Reads the event stream through a consumer group and runs stream handlers
pub struct StreamConsumer {
    connection: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    settings: ConsumerSettings,
    state: RwLock<ConsumerState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamConsumer {
    /// Connect and verify the server is reachable
    pub async fn connect(config: &Config, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let redis_url = config.redis.url.as_ref().ok_or_else(|| {
            AppError::Configuration(
                "Stream consumption requires 'redis.url' configuration".to_string(),
            )
        })?;

        let client = Client::open(redis_url.as_str())
            .map_err(|e| AppError::Connection(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        let mut test_conn = connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut test_conn)
            .await
            .map_err(|e| AppError::Connection(format!("Redis connection test failed: {}", e)))?;

        let settings = ConsumerSettings::from_config(config);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            connection,
            registry,
            settings,
            state: RwLock::new(ConsumerState::Idle),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        *self.state.read()
    }

    pub fn consumer_name(&self) -> &str {
        &self.settings.consumer_name
    }

    /// Create the consumer group if it does not exist yet.
    ///
    /// The group starts at `0` with MKSTREAM, so entries published before the
    /// first consumer came up are still delivered. Safe to call repeatedly.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.settings.stream_key)
            .arg(&self.settings.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<_, String>(&mut conn)
            .await;

        match created {
            Ok(_) => {
                tracing::info!(
                    stream = %self.settings.stream_key,
                    group = %self.settings.group,
                    "Created stream consumer group"
                );
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(group = %self.settings.group, "Consumer group already exists");
            }
            Err(e) => {
                return Err(AppError::Stream(format!("XGROUP CREATE failed: {}", e)));
            }
        }

        let mut state = self.state.write();
        if *state == ConsumerState::Idle {
            *state = ConsumerState::GroupEnsured;
        }
        Ok(())
    }

    /// Ensure the group exists, then start the read and claim loops
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            ConsumerState::Idle => self.ensure_group().await?,
            ConsumerState::GroupEnsured => {}
            state => {
                tracing::warn!(state = ?state, "Stream consumer already started");
                return Ok(());
            }
        }

        tracing::info!(
            stream = %self.settings.stream_key,
            group = %self.settings.group,
            consumer = %self.settings.consumer_name,
            handlers = self.registry.stream_handler_count(),
            "Starting stream consumer"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_read_loop(
            self.connection.clone(),
            self.registry.clone(),
            self.settings.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(run_claim_loop(
            self.connection.clone(),
            self.registry.clone(),
            self.settings.clone(),
            self.shutdown_tx.subscribe(),
        )));

        *self.state.write() = ConsumerState::Consuming;
        Ok(())
    }

    /// Stop reading and wait for in-flight handlers to finish
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state != ConsumerState::Consuming {
                tracing::warn!(state = ?*state, "Stream consumer is not running");
                return;
            }
            *state = ConsumerState::Stopped;
        }

        tracing::info!("Stream consumer stopping, waiting for in-flight handlers");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        tracing::info!("Stream consumer stopped");
    }
}

async fn run_read_loop(
    mut connection: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    settings: ConsumerSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let batch = tokio::select! {
            _ = shutdown_rx.changed() => break,
            batch = read_batch(&mut connection, &settings) => batch,
        };

        match batch {
            Ok(entries) if entries.is_empty() => {}
            Ok(entries) => {
                // Entries within a batch are independent; run them together
                futures::future::join_all(entries.into_iter().map(|entry| {
                    process_entry(connection.clone(), registry.clone(), &settings, entry)
                }))
                .await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Stream read failed");
                tokio::time::sleep(Duration::from_millis(settings.block_ms)).await;
            }
        }
    }

    tracing::debug!(consumer = %settings.consumer_name, "Stream read loop stopped");
}

async fn run_claim_loop(
    mut connection: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    settings: ConsumerSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.claim_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        match claim_abandoned(&mut connection, &settings).await {
            Ok(claimed) if claimed.is_empty() => {}
            Ok(claimed) => {
                tracing::info!(
                    count = claimed.len(),
                    consumer = %settings.consumer_name,
                    "Claimed abandoned stream entries"
                );
                PIPELINE_METRICS
                    .claimed_messages
                    .with_label_values(&[&settings.consumer_name])
                    .inc_by(claimed.len() as f64);

                futures::future::join_all(claimed.into_iter().map(|entry| {
                    process_entry(connection.clone(), registry.clone(), &settings, entry)
                }))
                .await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Claiming abandoned stream entries failed");
            }
        }
    }

    tracing::debug!(consumer = %settings.consumer_name, "Stream claim loop stopped");
}

async fn read_batch(
    conn: &mut ConnectionManager,
    settings: &ConsumerSettings,
) -> Result<Vec<StreamEntry>> {
    let reply = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(&settings.group)
        .arg(&settings.consumer_name)
        .arg("COUNT")
        .arg(settings.batch_size)
        .arg("BLOCK")
        .arg(settings.block_ms)
        .arg("STREAMS")
        .arg(&settings.stream_key)
        .arg(">")
        .query_async::<_, redis::Value>(conn)
        .await
        .map_err(|e| AppError::Stream(format!("XREADGROUP failed: {}", e)))?;

    Ok(codec::parse_xreadgroup_reply(&reply, &settings.stream_key))
}

/// Claim entries left pending by dead consumers, cursoring until wrap-around
async fn claim_abandoned(
    conn: &mut ConnectionManager,
    settings: &ConsumerSettings,
) -> Result<Vec<StreamEntry>> {
    let mut cursor = "0-0".to_string();
    let mut claimed = Vec::new();

    loop {
        let reply = redis::cmd("XAUTOCLAIM")
            .arg(&settings.stream_key)
            .arg(&settings.group)
            .arg(&settings.consumer_name)
            .arg(settings.min_idle.as_millis() as u64)
            .arg(&cursor)
            .arg("COUNT")
            .arg(settings.batch_size)
            .query_async::<_, redis::Value>(conn)
            .await
            .map_err(|e| AppError::Stream(format!("XAUTOCLAIM failed: {}", e)))?;

        let (next_cursor, entries) = codec::parse_xautoclaim_reply(&reply);
        let done = entries.is_empty() || next_cursor == "0-0";
        claimed.extend(entries);

        if done {
            break;
        }
        cursor = next_cursor;
    }

    Ok(claimed)
}

/// Run one stream entry through decode, retry-ceiling, and handler stages
async fn process_entry(
    mut conn: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    settings: &ConsumerSettings,
    entry: StreamEntry,
) {
    let delivery_count = fetch_delivery_count(&mut conn, settings, &entry.id).await;

    let Some(raw_event) = entry.field(EVENT_FIELD) else {
        tracing::warn!(entry_id = %entry.id, "Stream entry has no event field, dead-lettering");
        dead_letter(&mut conn, settings, &entry.id, "", delivery_count).await;
        PIPELINE_METRICS
            .dead_letters
            .with_label_values(&["unknown"])
            .inc();
        ack(&mut conn, settings, &entry.id).await;
        return;
    };
    let raw_event = raw_event.to_string();

    let event: Event = match serde_json::from_str(&raw_event) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                entry_id = %entry.id,
                error = %e,
                "Undecodable stream entry, dead-lettering"
            );
            dead_letter(&mut conn, settings, &entry.id, &raw_event, delivery_count).await;
            PIPELINE_METRICS
                .dead_letters
                .with_label_values(&["unknown"])
                .inc();
            ack(&mut conn, settings, &entry.id).await;
            return;
        }
    };

    let event_type = event.event_type().to_string();

    if delivery_count >= settings.max_retries as u64 {
        tracing::warn!(
            entry_id = %entry.id,
            event_type = %event_type,
            delivery_count,
            max_retries = settings.max_retries,
            "Retry ceiling reached, dead-lettering stream entry"
        );
        dead_letter(&mut conn, settings, &entry.id, &raw_event, delivery_count).await;
        PIPELINE_METRICS
            .dead_letters
            .with_label_values(&[&event_type])
            .inc();
        ack(&mut conn, settings, &entry.id).await;
        return;
    }

    let Some(handler) = registry.stream_handler(&event_type) else {
        tracing::warn!(
            entry_id = %entry.id,
            event_type = %event_type,
            "No stream handler registered, acknowledging"
        );
        PIPELINE_METRICS
            .stream_processed
            .with_label_values(&[&event_type, "no_handler"])
            .inc();
        ack(&mut conn, settings, &entry.id).await;
        return;
    };

    let span = tracing::info_span!(
        "stream_message",
        flow_id = %Uuid::new_v4(),
        entry_id = %entry.id,
        event_type = %event_type,
        delivery = delivery_count,
        request_id = event.request_id.as_deref().unwrap_or(""),
        user_id = ?event.metadata.user_id,
    );

    async {
        let context = JobContext {
            event,
            job_id: entry.id.clone(),
            queue: settings.stream_key.clone(),
            attempt: delivery_count as u32,
        };

        // The handler runs as its own task so the deadline race only stops
        // the wait. Dropping the JoinHandle on timeout detaches the task;
        // its work finishes, but the entry stays pending for redelivery.
        let started = Instant::now();
        let mut handler_task = tokio::spawn(handler(context).in_current_span());
        match tokio::time::timeout(settings.handler_timeout, &mut handler_task).await {
            Ok(Ok(Ok(()))) => {
                ack(&mut conn, settings, &entry.id).await;
                PIPELINE_METRICS
                    .stream_processed
                    .with_label_values(&[&event_type, "processed"])
                    .inc();
                PIPELINE_METRICS
                    .stream_duration
                    .with_label_values(&[&event_type])
                    .observe(started.elapsed().as_secs_f64());
                tracing::debug!("Stream entry processed and acknowledged");
            }
            Ok(Ok(Err(e))) => {
                // Not acknowledged: stays pending for redelivery
                tracing::error!(
                    error = %e,
                    delivery_count,
                    "Stream handler failed, leaving entry pending"
                );
                PIPELINE_METRICS
                    .stream_processed
                    .with_label_values(&[&event_type, "failed"])
                    .inc();
            }
            Ok(Err(join_error)) => {
                // A panic unwinds the handler task, not the read loop
                tracing::error!(
                    error = %join_error,
                    delivery_count,
                    "Stream handler panicked, leaving entry pending"
                );
                PIPELINE_METRICS
                    .stream_processed
                    .with_label_values(&[&event_type, "failed"])
                    .inc();
            }
            Err(_) => {
                tracing::error!(
                    timeout_secs = settings.handler_timeout.as_secs(),
                    "Stream handler timed out, leaving entry pending"
                );
                PIPELINE_METRICS
                    .stream_processed
                    .with_label_values(&[&event_type, "timeout"])
                    .inc();
            }
        }
    }
    .instrument(span)
    .await
}

/// Look up this entry's delivery count in the group's pending list.
///
/// Falls back to 1 when the lookup fails or the entry is not pending, which
/// is what a first delivery looks like.
async fn fetch_delivery_count(
    conn: &mut ConnectionManager,
    settings: &ConsumerSettings,
    entry_id: &str,
) -> u64 {
    let reply = redis::cmd("XPENDING")
        .arg(&settings.stream_key)
        .arg(&settings.group)
        .arg(entry_id)
        .arg(entry_id)
        .arg(1)
        .query_async::<_, redis::Value>(conn)
        .await;

    match reply {
        Ok(value) => codec::parse_pending_counts(&value)
            .remove(entry_id)
            .unwrap_or(1),
        Err(e) => {
            tracing::warn!(
                entry_id = %entry_id,
                error = %e,
                "XPENDING lookup failed, assuming first delivery"
            );
            1
        }
    }
}

async fn ack(conn: &mut ConnectionManager, settings: &ConsumerSettings, entry_id: &str) {
    let acked = redis::cmd("XACK")
        .arg(&settings.stream_key)
        .arg(&settings.group)
        .arg(entry_id)
        .query_async::<_, i64>(conn)
        .await;

    if let Err(e) = acked {
        tracing::error!(entry_id = %entry_id, error = %e, "XACK failed");
    }
}

/// Copy a poisoned or exhausted entry to the dead-letter stream
async fn dead_letter(
    conn: &mut ConnectionManager,
    settings: &ConsumerSettings,
    entry_id: &str,
    raw_event: &str,
    delivery_count: u64,
) {
    let written = redis::cmd("XADD")
        .arg(&settings.dlq_key)
        .arg("*")
        .arg("original_message_id")
        .arg(entry_id)
        .arg("retry_count")
        .arg(delivery_count)
        .arg("failed_at")
        .arg(Utc::now().to_rfc3339())
        .arg("consumer")
        .arg(&settings.consumer_name)
        .arg(EVENT_FIELD)
        .arg(raw_event)
        .query_async::<_, String>(conn)
        .await;

    match written {
        Ok(dlq_id) => {
            tracing::warn!(
                entry_id = %entry_id,
                dlq_id = %dlq_id,
                dlq = %settings.dlq_key,
                "Stream entry moved to dead-letter queue"
            );
        }
        Err(e) => {
            tracing::error!(
                entry_id = %entry_id,
                error = %e,
                "Failed to write dead-letter entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.service.name = "relay-test".to_string();
        config.stream.batch_size = 8;
        config.stream.max_retries = 5;

        let settings = ConsumerSettings::from_config(&config);
        assert_eq!(settings.stream_key, "event-relay:events");
        assert_eq!(settings.dlq_key, "event-relay:events:dlq");
        assert_eq!(settings.group, "event-relay");
        assert!(settings.consumer_name.starts_with("relay-test-"));
        assert_eq!(settings.batch_size, 8);
        assert_eq!(settings.max_retries, 5);
    }

    #[test]
    fn test_consumer_name_includes_pid() {
        let settings = ConsumerSettings::from_config(&Config::default());
        let pid = std::process::id().to_string();
        assert!(settings.consumer_name.ends_with(&pid));
    }
}
