//! Queue backend protocol
//!
//! The dispatcher and publisher only see this trait. Job lifecycle state
//! (waiting → delayed → active → completed/failed) and the retry/backoff
//! policy are owned by the backend, not by the workers that lease jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::events::Event;

/// Scheduling options for a single enqueue
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Lower values are dequeued first; 0 is the default
    pub priority: i32,

    /// Hold the job back for this long before it becomes ready
    pub delay: Option<Duration>,

    /// Explicit job ID for idempotent enqueue; a job with the same ID
    /// already in the queue wins and the enqueue becomes a no-op
    pub job_id: Option<String>,
}

/// A queue-resident job wrapping an event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Backend job ID
    pub id: String,

    /// Job name (= event type), the handler lookup key
    pub name: String,

    /// Destination queue
    pub queue: String,

    /// The wrapped event
    pub event: Event,

    /// Scheduling priority; lower runs first
    pub priority: i32,

    /// Delivery attempts made, incremented when a worker leases the job
    pub attempts_made: u32,

    /// When the job was first enqueued
    pub enqueued_at: DateTime<Utc>,

    /// Error message from the most recent failed attempt
    pub last_error: Option<String>,
}

/// Outcome of failing a job, decided by the backend's retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt after the backoff delay
    Retry { attempt: u32, delay: Duration },

    /// Attempts exhausted; job moved to the failed set
    Discarded { attempts: u32 },
}

/// Point-in-time queue depth
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Retry, lease, and retention policy applied by a backend
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Delivery attempts before a job is permanently failed
    pub max_attempts: u32,

    /// Base delay for exponential backoff between attempts
    pub backoff_base: Duration,

    /// How long a lease holds before the job counts as stalled
    pub lock_duration: Duration,

    /// Completed jobs kept for inspection
    pub keep_completed: usize,

    /// Failed jobs kept for inspection
    pub keep_failed: usize,
}

impl QueuePolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            lock_duration: Duration::from_secs(config.lock_duration_secs),
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
        }
    }

    /// Exponential backoff delay before the given attempt is retried
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Trait for job queue backends
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue one job; returns the job ID (the existing ID when an explicit
    /// `job_id` deduplicated the enqueue)
    async fn enqueue(&self, queue: &str, event: Event, options: JobOptions) -> Result<String>;

    /// Lease the next ready job, waiting up to `wait` when the queue is
    /// empty. The returned record's `attempts_made` already counts this
    /// delivery.
    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<JobRecord>>;

    /// Mark a leased job completed
    async fn complete(&self, job: &JobRecord) -> Result<()>;

    /// Fail a leased job; the backend applies its retry/backoff policy
    async fn fail(&self, job: &JobRecord, error: &str) -> Result<FailOutcome>;

    /// Fail a leased job permanently, skipping retries (for configuration
    /// errors no retry can fix)
    async fn discard(&self, job: &JobRecord, error: &str) -> Result<()>;

    /// Move jobs whose lease expired back to waiting; returns how many were
    /// recovered
    async fn reap_stalled(&self, queue: &str) -> Result<usize>;

    /// Point-in-time counts for a queue
    async fn counts(&self, queue: &str) -> Result<QueueCounts>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = QueuePolicy {
            backoff_base: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_policy_from_config() {
        let config = QueueConfig {
            max_attempts: 5,
            backoff_base_ms: 250,
            ..Default::default()
        };

        let policy = QueuePolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base, Duration::from_millis(250));
    }
}
