//! Redis queue backend
//!
//! Layout per queue (under the configured key prefix):
//!   `{p}:queue:{q}:jobs`      hash  job id -> serialized JobRecord
//!   `{p}:queue:{q}:waiting`   zset  job id scored by (priority, sequence)
//!   `{p}:queue:{q}:delayed`   zset  job id scored by ready-at millis
//!   `{p}:queue:{q}:active`    hash  job id -> lease expiry millis
//!   `{p}:queue:{q}:completed` list  serialized records, trimmed to retention
//!   `{p}:queue:{q}:failed`    list  serialized records, trimmed to retention
//!   `{p}:queue:{q}:seq`       int   FIFO tie-breaker within a priority
//!
//! Every transition between these structures runs as a small Lua script, so
//! from the moment its record exists a job id is in exactly one of waiting,
//! delayed, or active: a crash or dropped connection between two commands
//! cannot strand a job where no recovery path looks. Pop-and-lease keeps
//! ZPOPMIN's guarantee that a job is leased by exactly one worker even with
//! several processes on the same queue.

use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::events::Event;
use crate::queue::backend::{
    FailOutcome, JobOptions, JobRecord, QueueBackend, QueueCounts, QueuePolicy,
};

/// How many due delayed jobs are promoted per dequeue poll
const PROMOTE_BATCH: usize = 64;

/// Sleep slice while polling an empty queue
const POLL_SLICE: Duration = Duration::from_millis(100);

lazy_static! {
    /// Store the record and place the id into waiting or delayed.
    /// KEYS: jobs, seq, waiting, delayed. ARGV: id, json, ready_ms (-1 for
    /// immediate), priority. Returns 0 when the id already exists.
    static ref ENQUEUE_JOB: Script = Script::new(
        r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
local ready = tonumber(ARGV[3])
if ready >= 0 then
  redis.call('ZADD', KEYS[4], ready, ARGV[1])
else
  local seq = redis.call('INCR', KEYS[2])
  redis.call('ZADD', KEYS[3], tonumber(ARGV[4]) * 1e12 + seq, ARGV[1])
end
return 1
"#,
    );

    /// Pop the best waiting id and write its lease in the same step.
    /// KEYS: waiting, active. ARGV: lease expiry millis.
    static ref POP_AND_LEASE: Script = Script::new(
        r#"
local popped = redis.call('ZPOPMIN', KEYS[1], 1)
if #popped == 0 then
  return nil
end
redis.call('HSET', KEYS[2], popped[1], ARGV[1])
return popped[1]
"#,
    );

    /// Move due ids from delayed into waiting with a fresh sequence score.
    /// A record that fails to decode is promoted at default priority and
    /// quarantined on dequeue. KEYS: delayed, jobs, seq, waiting.
    /// ARGV: now millis, batch size.
    static ref PROMOTE_DUE: Script = Script::new(
        r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  local json = redis.call('HGET', KEYS[2], id)
  if json then
    local priority = 0
    local ok, record = pcall(cjson.decode, json)
    if ok and type(record) == 'table' and type(record['priority']) == 'number' then
      priority = record['priority']
    end
    local seq = redis.call('INCR', KEYS[3])
    redis.call('ZADD', KEYS[4], priority * 1e12 + seq, id)
  end
end
return #due
"#,
    );

    /// Remove a job from the live structures and push its serialized form
    /// onto a retention-capped list. KEYS: active, jobs, list.
    /// ARGV: id, json, keep.
    static ref FINALIZE_JOB: Script = Script::new(
        r#"
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[2])
redis.call('LTRIM', KEYS[3], 0, tonumber(ARGV[3]) - 1)
return 1
"#,
    );

    /// Release the lease and park the updated record in the delayed set.
    /// KEYS: active, jobs, delayed. ARGV: id, json, ready millis.
    static ref RESCHEDULE_JOB: Script = Script::new(
        r#"
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[3], tonumber(ARGV[3]), ARGV[1])
return 1
"#,
    );

    /// Reap one expired lease: re-checks expiry so concurrent reapers cannot
    /// requeue the same job twice, then requeues or moves it to the failed
    /// list. KEYS: active, seq, waiting, jobs, failed.
    /// ARGV: id, now millis, mode ('requeue' | 'discard'), priority, json,
    /// keep.
    static ref REAP_ONE: Script = Script::new(
        r#"
local lease = redis.call('HGET', KEYS[1], ARGV[1])
if not lease or tonumber(lease) > tonumber(ARGV[2]) then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
if ARGV[3] == 'requeue' then
  local seq = redis.call('INCR', KEYS[2])
  redis.call('ZADD', KEYS[3], tonumber(ARGV[4]) * 1e12 + seq, ARGV[1])
else
  redis.call('HDEL', KEYS[4], ARGV[1])
  redis.call('LPUSH', KEYS[5], ARGV[5])
  redis.call('LTRIM', KEYS[5], 0, tonumber(ARGV[6]) - 1)
end
return 1
"#,
    );
}

/// Redis-based queue backend
#[derive(Clone)]
pub struct RedisQueue {
    connection: ConnectionManager,
    key_prefix: String,
    policy: QueuePolicy,
}

impl RedisQueue {
    /// Connect and verify the server is reachable
    pub async fn connect(redis_url: &str, key_prefix: &str, policy: QueuePolicy) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AppError::Connection(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        // Test connection
        let mut test_conn = connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut test_conn)
            .await
            .map_err(|e| AppError::Connection(format!("Redis connection test failed: {}", e)))?;

        tracing::info!(key_prefix = %key_prefix, "Initialized Redis queue backend");

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            policy,
        })
    }

    fn jobs_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:jobs", self.key_prefix, queue)
    }

    fn waiting_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:waiting", self.key_prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.key_prefix, queue)
    }

    fn active_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:active", self.key_prefix, queue)
    }

    fn completed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:completed", self.key_prefix, queue)
    }

    fn failed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:failed", self.key_prefix, queue)
    }

    fn seq_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:seq", self.key_prefix, queue)
    }

    /// Move due delayed jobs into the waiting set
    async fn promote_due(&self, conn: &mut ConnectionManager, queue: &str) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let _: i64 = PROMOTE_DUE
            .key(self.delayed_key(queue))
            .key(self.jobs_key(queue))
            .key(self.seq_key(queue))
            .key(self.waiting_key(queue))
            .arg(now_ms)
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    async fn finalize(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &str,
        list_key: &str,
        json: &str,
        keep: usize,
    ) -> Result<()> {
        let _: i64 = FINALIZE_JOB
            .key(self.active_key(queue))
            .key(self.jobs_key(queue))
            .key(list_key)
            .arg(id)
            .arg(json)
            .arg(keep)
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, queue: &str, event: Event, options: JobOptions) -> Result<String> {
        let mut conn = self.connection.clone();
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

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
        let json = serde_json::to_string(&record)?;

        let ready_ms: i64 = match options.delay {
            Some(delay) => Utc::now().timestamp_millis() + delay.as_millis() as i64,
            None => -1,
        };

        // HSETNX inside the script doubles as the dedup check for explicit
        // ids; because record and placement commit together, a duplicate can
        // only mean the first enqueue went through whole
        let created: i64 = ENQUEUE_JOB
            .key(self.jobs_key(queue))
            .key(self.seq_key(queue))
            .key(self.waiting_key(queue))
            .key(self.delayed_key(queue))
            .arg(&id)
            .arg(&json)
            .arg(ready_ms)
            .arg(options.priority)
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            tracing::debug!(queue = %queue, job_id = %id, "Enqueue deduplicated by explicit id");
        }
        Ok(id)
    }

    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<JobRecord>> {
        let mut conn = self.connection.clone();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            self.promote_due(&mut conn, queue).await?;

            // From the moment an id leaves the waiting set it carries a
            // lease, so a crash or connection loss right after the pop
            // leaves the job where the reaper will find it
            let locked_until =
                Utc::now().timestamp_millis() + self.policy.lock_duration.as_millis() as i64;
            let popped: Option<String> = POP_AND_LEASE
                .key(self.waiting_key(queue))
                .key(self.active_key(queue))
                .arg(locked_until)
                .invoke_async(&mut conn)
                .await?;

            if let Some(id) = popped {
                let json: Option<String> = conn.hget(self.jobs_key(queue), &id).await?;
                let Some(json) = json else {
                    // Record vanished while the id sat in the waiting set;
                    // drop the lease and try the next one
                    let _: i64 = conn.hdel(self.active_key(queue), &id).await?;
                    continue;
                };

                let mut record: JobRecord = match serde_json::from_str(&json) {
                    Ok(record) => record,
                    Err(e) => {
                        // No retry can fix an undecodable record; park the
                        // raw payload on the failed list for inspection
                        tracing::error!(
                            queue = %queue,
                            job_id = %id,
                            error = %e,
                            "Undecodable job record, moving to failed list"
                        );
                        self.finalize(
                            &mut conn,
                            queue,
                            &id,
                            &self.failed_key(queue),
                            &json,
                            self.policy.keep_failed,
                        )
                        .await?;
                        continue;
                    }
                };
                record.attempts_made += 1;
                let _: i64 = conn
                    .hset(self.jobs_key(queue), &id, serde_json::to_string(&record)?)
                    .await?;

                return Ok(Some(record));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_SLICE.min(deadline - now)).await;
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        let mut conn = self.connection.clone();
        self.finalize(
            &mut conn,
            &job.queue,
            &job.id,
            &self.completed_key(&job.queue),
            &serde_json::to_string(job)?,
            self.policy.keep_completed,
        )
        .await
    }

    async fn fail(&self, job: &JobRecord, error: &str) -> Result<FailOutcome> {
        let mut conn = self.connection.clone();

        let mut record = job.clone();
        record.last_error = Some(error.to_string());
        let attempt = record.attempts_made;
        let json = serde_json::to_string(&record)?;

        if attempt >= self.policy.max_attempts {
            self.finalize(
                &mut conn,
                &job.queue,
                &job.id,
                &self.failed_key(&job.queue),
                &json,
                self.policy.keep_failed,
            )
            .await?;
            return Ok(FailOutcome::Discarded { attempts: attempt });
        }

        let delay = self.policy.backoff_delay(attempt);
        let ready_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let _: i64 = RESCHEDULE_JOB
            .key(self.active_key(&job.queue))
            .key(self.jobs_key(&job.queue))
            .key(self.delayed_key(&job.queue))
            .arg(&job.id)
            .arg(&json)
            .arg(ready_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(FailOutcome::Retry { attempt, delay })
    }

    async fn discard(&self, job: &JobRecord, error: &str) -> Result<()> {
        let mut conn = self.connection.clone();

        let mut record = job.clone();
        record.last_error = Some(error.to_string());
        self.finalize(
            &mut conn,
            &job.queue,
            &job.id,
            &self.failed_key(&job.queue),
            &serde_json::to_string(&record)?,
            self.policy.keep_failed,
        )
        .await
    }

    async fn reap_stalled(&self, queue: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let now_ms = Utc::now().timestamp_millis();

        let leases: Vec<(String, i64)> = redis::cmd("HGETALL")
            .arg(self.active_key(queue))
            .query_async(&mut conn)
            .await?;

        let mut reaped = 0;
        for (id, locked_until) in leases {
            if locked_until > now_ms {
                continue;
            }

            let json: Option<String> = conn.hget(self.jobs_key(queue), &id).await?;
            let (mode, priority, payload) = match json {
                None => {
                    // Lease without a record: the job finished elsewhere
                    let removed: i64 = conn.hdel(self.active_key(queue), &id).await?;
                    reaped += removed as usize;
                    continue;
                }
                Some(json) => match serde_json::from_str::<JobRecord>(&json) {
                    Ok(mut record) if record.attempts_made >= self.policy.max_attempts => {
                        record.last_error = Some("stalled: lease expired".to_string());
                        ("discard", 0, serde_json::to_string(&record)?)
                    }
                    Ok(record) => ("requeue", record.priority, json),
                    Err(e) => {
                        tracing::error!(
                            queue = %queue,
                            job_id = %id,
                            error = %e,
                            "Undecodable job record, moving to failed list"
                        );
                        ("discard", 0, json)
                    }
                },
            };

            let claimed: i64 = REAP_ONE
                .key(self.active_key(queue))
                .key(self.seq_key(queue))
                .key(self.waiting_key(queue))
                .key(self.jobs_key(queue))
                .key(self.failed_key(queue))
                .arg(&id)
                .arg(now_ms)
                .arg(mode)
                .arg(priority)
                .arg(&payload)
                .arg(self.policy.keep_failed)
                .invoke_async(&mut conn)
                .await?;
            reaped += claimed as usize;
        }
        Ok(reaped)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let mut conn = self.connection.clone();
        let waiting: i64 = conn.zcard(self.waiting_key(queue)).await?;
        let delayed: i64 = conn.zcard(self.delayed_key(queue)).await?;
        let active: i64 = conn.hlen(self.active_key(queue)).await?;
        let completed: i64 = conn.llen(self.completed_key(queue)).await?;
        let failed: i64 = conn.llen(self.failed_key(queue)).await?;

        Ok(QueueCounts {
            waiting: waiting as usize,
            delayed: delayed as usize,
            active: active as usize,
            completed: completed as usize,
            failed: failed as usize,
        })
    }
}
