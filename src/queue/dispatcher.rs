//! Job dispatcher / worker pool
//!
//! For every queue with registered handlers the dispatcher runs `concurrency`
//! worker tasks sharing a windowed rate limiter, plus one reaper task that
//! recovers stalled leases. Handlers run raced against a hard deadline; retry
//! and backoff decisions belong to the queue backend.
//!
//! Lifecycle: NotStarted -> Running -> Draining -> Stopped. Shutdown signals
//! every task through a watch channel and awaits in-flight jobs, no forced
//! kill. The timeout race only stops the worker from waiting; handler work
//! already in flight is not cancelled, so handlers must tolerate
//! at-least-once execution.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::metrics::PIPELINE_METRICS;
use crate::queue::backend::{FailOutcome, JobRecord, QueueBackend};
use crate::registry::{HandlerRegistry, JobContext};

/// Dispatcher lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    NotStarted,
    Running,
    Draining,
    Stopped,
}

/// Worker-pool settings, derived from [`QueueConfig`]
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Jobs processed in parallel per queue
    pub concurrency: usize,

    /// Rate limiter: max job starts per window (0 disables the limiter)
    pub rate_limit_max: u32,

    /// Rate limiter window
    pub rate_limit_window: Duration,

    /// Hard deadline per job execution
    pub job_timeout: Duration,

    /// Bounded wait when polling an empty queue
    pub poll_interval: Duration,

    /// How often stalled leases are reaped
    pub stalled_interval: Duration,

    /// Run only these queues when set; all registered queues otherwise
    pub queues: Option<Vec<String>>,
}

impl DispatcherSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            rate_limit_max: config.rate_limit_max,
            rate_limit_window: Duration::from_millis(config.rate_limit_window_ms),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stalled_interval: Duration::from_secs(config.stalled_interval_secs),
            queues: None,
        }
    }

    /// Restrict the dispatcher to the given queues
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = Some(queues);
        self
    }
}

struct Window {
    started: Instant,
    used: u32,
}

/// Max N starts per rolling window, shared by all workers of a queue
pub struct RateLimiter {
    max: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Wait until a slot in the current window is free
    pub async fn acquire(&self) {
        if self.max == 0 {
            return;
        }

        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if now.duration_since(state.started) >= self.window {
                    state.started = now;
                    state.used = 0;
                }
                if state.used < self.max {
                    state.used += 1;
                    return;
                }
                self.window - now.duration_since(state.started)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-queue worker pool pulling jobs from the backend
pub struct JobDispatcher {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<HandlerRegistry>,
    settings: DispatcherSettings,
    state: RwLock<DispatcherState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobDispatcher {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<HandlerRegistry>,
        settings: DispatcherSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            backend,
            registry,
            settings,
            state: RwLock::new(DispatcherState::NotStarted),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> DispatcherState {
        *self.state.read()
    }

    /// Start workers for every registered queue passing the filter
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != DispatcherState::NotStarted {
                tracing::warn!(state = ?*state, "Dispatcher already started");
                return Ok(());
            }
            *state = DispatcherState::Running;
        }

        let queues: Vec<String> = self
            .registry
            .queues()
            .into_iter()
            .filter(|queue| {
                self.settings
                    .queues
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(queue))
            })
            .collect();

        if queues.is_empty() {
            tracing::warn!("No queues with registered handlers to dispatch");
            return Ok(());
        }

        let mut tasks = self.tasks.lock();
        for queue in queues {
            let limiter = Arc::new(RateLimiter::new(
                self.settings.rate_limit_max,
                self.settings.rate_limit_window,
            ));

            tracing::info!(
                queue = %queue,
                concurrency = self.settings.concurrency,
                jobs = ?self.registry.job_names(&queue),
                "Starting queue workers"
            );

            for worker_id in 0..self.settings.concurrency {
                tasks.push(self.spawn_worker(queue.clone(), worker_id, limiter.clone()));
            }
            tasks.push(self.spawn_reaper(queue));
        }

        Ok(())
    }

    /// Drain in-flight jobs and stop all workers
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state != DispatcherState::Running {
                tracing::warn!(state = ?*state, "Dispatcher is not running");
                return;
            }
            *state = DispatcherState::Draining;
        }

        tracing::info!("Dispatcher draining, waiting for in-flight jobs");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        *self.state.write() = DispatcherState::Stopped;
        tracing::info!("Dispatcher stopped");
    }

    fn spawn_worker(
        &self,
        queue: String,
        worker_id: usize,
        limiter: Arc<RateLimiter>,
    ) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tracing::debug!(queue = %queue, worker_id, "Queue worker started");
            PIPELINE_METRICS
                .active_workers
                .with_label_values(&[&queue])
                .inc();

            // The dequeue wait is bounded by poll_interval, so the shutdown
            // flag is rechecked at least that often. Never cancel a dequeue
            // in flight: a lease could be taken and then dropped on the
            // floor.
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                match backend.dequeue(&queue, settings.poll_interval).await {
                    Ok(Some(job)) => {
                        limiter.acquire().await;
                        process_job(&*backend, &registry, &queue, job, settings.job_timeout).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "Failed to poll queue");
                        tokio::time::sleep(settings.poll_interval).await;
                    }
                }
            }

            PIPELINE_METRICS
                .active_workers
                .with_label_values(&[&queue])
                .dec();
            tracing::debug!(queue = %queue, worker_id, "Queue worker stopped");
        })
    }

    fn spawn_reaper(&self, queue: String) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let interval = self.settings.stalled_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                match backend.reap_stalled(&queue).await {
                    Ok(0) => {}
                    Ok(reaped) => {
                        tracing::warn!(queue = %queue, reaped, "Recovered stalled jobs");
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "Stalled-job reap failed");
                    }
                }

                if let Ok(counts) = backend.counts(&queue).await {
                    tracing::debug!(queue = %queue, ?counts, "Queue depth");
                }
            }
        })
    }
}

/// Run one leased job: resolve, race against the deadline, report the outcome
async fn process_job(
    backend: &dyn QueueBackend,
    registry: &HandlerRegistry,
    queue: &str,
    job: JobRecord,
    job_timeout: Duration,
) {
    let span = tracing::info_span!(
        "job",
        flow_id = %Uuid::new_v4(),
        queue = %queue,
        job = %job.name,
        job_id = %job.id,
        attempt = job.attempts_made,
        request_id = job.event.request_id.as_deref().unwrap_or(""),
        user_id = ?job.event.metadata.user_id,
    );

    async {
        let Some(handler) = registry.job_handler(queue, &job.name) else {
            // No retry can fix a missing handler
            let message = format!(
                "no handler registered for job '{}' on queue '{}'",
                job.name, queue
            );
            tracing::warn!("{}", message);
            if let Err(e) = backend.discard(&job, &message).await {
                tracing::error!(error = %e, "Failed to discard job");
            }
            PIPELINE_METRICS
                .jobs_processed
                .with_label_values(&[queue, &job.name, "no_handler"])
                .inc();
            return;
        };

        let context = JobContext {
            event: job.event.clone(),
            job_id: job.id.clone(),
            queue: queue.to_string(),
            attempt: job.attempts_made,
        };

        // The handler runs as its own task so the deadline race only stops
        // this worker from waiting. Dropping the JoinHandle on timeout
        // detaches the task instead of cancelling it mid-await.
        let started = Instant::now();
        let mut handler_task = tokio::spawn(handler(context).in_current_span());
        let outcome = tokio::time::timeout(job_timeout, &mut handler_task).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Ok(()))) => {
                if let Err(e) = backend.complete(&job).await {
                    tracing::error!(error = %e, "Failed to mark job completed");
                    return;
                }
                PIPELINE_METRICS
                    .jobs_processed
                    .with_label_values(&[queue, &job.name, "completed"])
                    .inc();
                PIPELINE_METRICS
                    .job_duration
                    .with_label_values(&[queue, &job.name])
                    .observe(elapsed.as_secs_f64());
                tracing::info!(duration_ms = elapsed.as_millis() as u64, "Job completed");
            }
            Ok(Ok(Err(e))) => {
                report_failure(backend, queue, &job, &e.to_string(), "failed").await;
            }
            Ok(Err(join_error)) => {
                // A panic unwinds the handler task, not this worker
                let message = format!("job handler panicked: {}", join_error);
                report_failure(backend, queue, &job, &message, "failed").await;
            }
            Err(_) => {
                // Distinguish a hung handler from one that threw; the handler
                // itself is not cancelled and may still finish its work.
                let message = format!(
                    "job handler timed out after {:?} (handler may still be running)",
                    job_timeout
                );
                report_failure(backend, queue, &job, &message, "timeout").await;
            }
        }
    }
    .instrument(span)
    .await
}

async fn report_failure(
    backend: &dyn QueueBackend,
    queue: &str,
    job: &JobRecord,
    error: &str,
    outcome_label: &str,
) {
    match backend.fail(job, error).await {
        Ok(FailOutcome::Retry { attempt, delay }) => {
            tracing::warn!(
                error = %error,
                attempt,
                retry_delay_ms = delay.as_millis() as u64,
                "Job failed, will retry"
            );
        }
        Ok(FailOutcome::Discarded { attempts }) => {
            tracing::error!(error = %error, attempts, "Job permanently failed");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to record job failure");
        }
    }
    PIPELINE_METRICS
        .jobs_processed
        .with_label_values(&[queue, &job.name, outcome_label])
        .inc();
}
