//! In-memory queue backend (for development and testing)
//!
//! Keeps the full job lifecycle per queue behind a mutex: a priority-ordered
//! waiting list, a delayed set, active leases, and capped completed/failed
//! retention. Lock scopes are short and never held across awaits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::events::Event;
use crate::queue::backend::{
    FailOutcome, JobOptions, JobRecord, QueueBackend, QueueCounts, QueuePolicy,
};

struct DelayedJob {
    ready_at: DateTime<Utc>,
    record: JobRecord,
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

struct ActiveLease {
    record: JobRecord,
    locked_until: Instant,
}

#[derive(Default)]
struct ShardState {
    waiting: VecDeque<JobRecord>,
    delayed: Vec<DelayedJob>,
    active: HashMap<String, ActiveLease>,
    completed: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
    /// IDs of jobs currently waiting, delayed, or active (dedup set)
    ids: HashSet<String>,
}

#[derive(Default)]
struct Shard {
    state: Mutex<ShardState>,
    notify: Notify,
}

/// In-memory queue backend
#[derive(Clone)]
pub struct InMemoryQueue {
    shards: Arc<DashMap<String, Arc<Shard>>>,
    policy: QueuePolicy,
}

impl InMemoryQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            shards: Arc::new(DashMap::new()),
            policy,
        }
    }

    fn shard(&self, queue: &str) -> Arc<Shard> {
        self.shards
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Shard::default()))
            .clone()
    }

    /// Insert keeping the list sorted by priority, FIFO within equal priority
    fn push_waiting(state: &mut ShardState, record: JobRecord) {
        let pos = state
            .waiting
            .iter()
            .position(|job| job.priority > record.priority)
            .unwrap_or(state.waiting.len());
        state.waiting.insert(pos, record);
    }

    /// Move delayed jobs whose ready time has passed into the waiting list
    fn promote_due(state: &mut ShardState) {
        let now = Utc::now();
        let mut due = Vec::new();
        state.delayed.retain_mut(|entry| {
            if entry.ready_at <= now {
                due.push(entry.record.clone());
                false
            } else {
                true
            }
        });
        for record in due {
            Self::push_waiting(state, record);
        }
    }
}

impl InMemoryQueue {
    /// Snapshot of retained completed jobs, oldest first
    pub fn completed_jobs(&self, queue: &str) -> Vec<JobRecord> {
        let shard = self.shard(queue);
        let state = shard.state.lock();
        state.completed.iter().cloned().collect()
    }

    /// Snapshot of retained failed jobs, oldest first
    pub fn failed_jobs(&self, queue: &str) -> Vec<JobRecord> {
        let shard = self.shard(queue);
        let state = shard.state.lock();
        state.failed.iter().cloned().collect()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(QueuePolicy::default())
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, queue: &str, event: Event, options: JobOptions) -> Result<String> {
        let shard = self.shard(queue);
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = shard.state.lock();
        if options.job_id.is_some() && state.ids.contains(&id) {
            tracing::debug!(queue = %queue, job_id = %id, "Enqueue deduplicated by explicit id");
            return Ok(id);
        }

        let record = JobRecord {
            id: id.clone(),
            name: event.event_type().to_string(),
            queue: queue.to_string(),
            event,
            priority: options.priority,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        };

        state.ids.insert(id.clone());
        match options.delay {
            Some(delay) => state.delayed.push(DelayedJob {
                ready_at: Utc::now() + to_chrono(delay),
                record,
            }),
            None => {
                Self::push_waiting(&mut state, record);
                drop(state);
                shard.notify.notify_one();
            }
        }

        Ok(id)
    }

    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<JobRecord>> {
        let shard = self.shard(queue);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            {
                let mut state = shard.state.lock();
                Self::promote_due(&mut state);
                if let Some(mut record) = state.waiting.pop_front() {
                    record.attempts_made += 1;
                    state.active.insert(
                        record.id.clone(),
                        ActiveLease {
                            record: record.clone(),
                            locked_until: Instant::now() + self.policy.lock_duration,
                        },
                    );
                    return Ok(Some(record));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = shard.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        let shard = self.shard(&job.queue);
        let mut state = shard.state.lock();

        state.active.remove(&job.id);
        state.ids.remove(&job.id);
        state.completed.push_back(job.clone());
        while state.completed.len() > self.policy.keep_completed {
            state.completed.pop_front();
        }
        Ok(())
    }

    async fn fail(&self, job: &JobRecord, error: &str) -> Result<FailOutcome> {
        let shard = self.shard(&job.queue);
        let mut state = shard.state.lock();

        state.active.remove(&job.id);

        let mut record = job.clone();
        record.last_error = Some(error.to_string());
        let attempt = record.attempts_made;

        if attempt >= self.policy.max_attempts {
            state.ids.remove(&record.id);
            state.failed.push_back(record);
            while state.failed.len() > self.policy.keep_failed {
                state.failed.pop_front();
            }
            return Ok(FailOutcome::Discarded { attempts: attempt });
        }

        let delay = self.policy.backoff_delay(attempt);
        state.delayed.push(DelayedJob {
            ready_at: Utc::now() + to_chrono(delay),
            record,
        });
        Ok(FailOutcome::Retry { attempt, delay })
    }

    async fn discard(&self, job: &JobRecord, error: &str) -> Result<()> {
        let shard = self.shard(&job.queue);
        let mut state = shard.state.lock();

        state.active.remove(&job.id);
        state.ids.remove(&job.id);

        let mut record = job.clone();
        record.last_error = Some(error.to_string());
        state.failed.push_back(record);
        while state.failed.len() > self.policy.keep_failed {
            state.failed.pop_front();
        }
        Ok(())
    }

    async fn reap_stalled(&self, queue: &str) -> Result<usize> {
        let shard = self.shard(queue);
        let mut state = shard.state.lock();
        let now = Instant::now();

        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lease)| lease.locked_until <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = 0;
        for id in expired {
            if let Some(lease) = state.active.remove(&id) {
                reaped += 1;
                let mut record = lease.record;
                if record.attempts_made >= self.policy.max_attempts {
                    record.last_error = Some("stalled: lease expired".to_string());
                    state.ids.remove(&record.id);
                    state.failed.push_back(record);
                    while state.failed.len() > self.policy.keep_failed {
                        state.failed.pop_front();
                    }
                } else {
                    Self::push_waiting(&mut state, record);
                    shard.notify.notify_one();
                }
            }
        }
        Ok(reaped)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let shard = self.shard(queue);
        let state = shard.state.lock();
        Ok(QueueCounts {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }
}
