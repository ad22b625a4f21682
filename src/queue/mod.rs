//! Job queues: publishing, storage backends, and the worker pool

pub mod backend;
pub mod dispatcher;
pub mod memory;
pub mod publisher;
pub mod redis;

pub use backend::{FailOutcome, JobOptions, JobRecord, QueueBackend, QueueCounts, QueuePolicy};
pub use dispatcher::{DispatcherSettings, DispatcherState, JobDispatcher, RateLimiter};
pub use memory::InMemoryQueue;
pub use publisher::{JobPublisher, PublishOptions};
pub use redis::RedisQueue;

use crate::config::{Config, QueueBackendKind};
use crate::error::{AppError, Result};
use std::sync::Arc;

/// Create a queue backend based on configuration
pub async fn create_queue_backend(config: &Config) -> Result<Arc<dyn QueueBackend>> {
    let policy = QueuePolicy::from_config(&config.queue);

    match config.queue.backend {
        QueueBackendKind::Memory => {
            tracing::info!("Initializing in-memory queue backend");
            Ok(Arc::new(InMemoryQueue::new(policy)))
        }

        QueueBackendKind::Redis => {
            let redis_url = config.redis.url.as_ref().ok_or_else(|| {
                AppError::Configuration(
                    "Redis queue backend requires 'redis.url' configuration".to_string(),
                )
            })?;

            tracing::info!(url = %redis_url, "Initializing Redis queue backend");

            let queue = RedisQueue::connect(redis_url, &config.redis.key_prefix, policy).await?;
            Ok(Arc::new(queue))
        }
    }
}
