//! Handler registry
//!
//! Explicit registration tables mapping `(queue, job name)` to job handlers
//! and event types to stream handlers. The registry is built once at startup
//! by `handlers::register_all`, then frozen behind an `Arc` and read without
//! locking by the dispatcher and the stream consumer.
//!
//! Registering the same `(queue, job name)` or event type twice is a startup
//! error: a silently-shadowed handler is a misconfiguration, not a feature.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::events::Event;

/// Boxed future returned by handlers
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A registered handler function
pub type JobHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Context passed to every handler invocation
#[derive(Clone)]
pub struct JobContext {
    /// The event being processed
    pub event: Event,

    /// Backend job ID (queue path) or stream entry ID (stream path)
    pub job_id: String,

    /// Queue name, or the stream key on the stream path
    pub queue: String,

    /// Delivery attempt, starting at 1
    pub attempt: u32,
}

/// Registration tables for job and stream handlers
#[derive(Default)]
pub struct HandlerRegistry {
    job_handlers: HashMap<(String, String), JobHandler>,
    stream_handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler for `(queue, job name)`
    ///
    /// Fails when the pair is already taken so that a duplicate registration
    /// surfaces at startup instead of silently shadowing a handler.
    pub fn register<F, Fut>(
        &mut self,
        queue: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let key = (queue.into(), name.into());
        if self.job_handlers.contains_key(&key) {
            return Err(AppError::Configuration(format!(
                "duplicate job handler for queue '{}', job '{}'",
                key.0, key.1
            )));
        }

        tracing::debug!(queue = %key.0, job = %key.1, "Job handler registered");
        self.job_handlers
            .insert(key, Arc::new(move |ctx| Box::pin(handler(ctx))));
        Ok(())
    }

    /// Register a stream handler for an event type
    pub fn register_stream<F, Fut>(
        &mut self,
        event_type: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let event_type = event_type.into();
        if self.stream_handlers.contains_key(&event_type) {
            return Err(AppError::Configuration(format!(
                "duplicate stream handler for event type '{}'",
                event_type
            )));
        }

        tracing::debug!(event_type = %event_type, "Stream handler registered");
        self.stream_handlers
            .insert(event_type, Arc::new(move |ctx| Box::pin(handler(ctx))));
        Ok(())
    }

    /// Look up the job handler for `(queue, job name)`
    pub fn job_handler(&self, queue: &str, name: &str) -> Option<JobHandler> {
        self.job_handlers
            .get(&(queue.to_string(), name.to_string()))
            .cloned()
    }

    /// Look up the stream handler for an event type
    pub fn stream_handler(&self, event_type: &str) -> Option<JobHandler> {
        self.stream_handlers.get(event_type).cloned()
    }

    /// Distinct queues with at least one registered handler, sorted
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .job_handlers
            .keys()
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    /// Job names registered on a queue, sorted
    pub fn job_names(&self, queue: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .job_handlers
            .keys()
            .filter(|(q, _)| q == queue)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of registered job handlers
    pub fn job_handler_count(&self) -> usize {
        self.job_handlers.len()
    }

    /// Number of registered stream handlers
    pub fn stream_handler_count(&self) -> usize {
        self.stream_handlers.len()
    }
}
