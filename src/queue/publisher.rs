//! Job publisher
//!
//! The single entry point domain code uses to get an event onto a queue. A
//! publish failure must never take down the caller's business transaction:
//! targeting an unknown queue logs a warning and returns no job id, while a
//! backend error is logged and propagated for the caller to decide.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::context;
use crate::error::Result;
use crate::events::{Event, EventPayload};
use crate::metrics::PIPELINE_METRICS;
use crate::queue::backend::{JobOptions, QueueBackend};

/// Options for a single publish
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Target queue override; defaults to the event type's queue
    pub queue: Option<String>,

    /// Target user for room-scoped notifications
    pub user_id: Option<Uuid>,

    /// Also broadcast to the admins room
    pub emit_to_admins: bool,

    /// Explicit request ID; falls back to the ambient task-local one
    pub request_id: Option<String>,

    /// Scheduling priority; lower runs first
    pub priority: i32,

    /// Hold the job back before it becomes ready
    pub delay: Option<Duration>,

    /// Explicit job ID for idempotent enqueue
    pub job_id: Option<String>,
}

/// Publishes typed events as jobs
pub struct JobPublisher {
    backend: Arc<dyn QueueBackend>,
    known_queues: Vec<String>,
}

impl JobPublisher {
    pub fn new(backend: Arc<dyn QueueBackend>, known_queues: Vec<String>) -> Self {
        Self {
            backend,
            known_queues,
        }
    }

    /// Enqueue one event as a job
    ///
    /// Returns the job ID, or `None` when the destination queue is not
    /// configured (logged as a warning, never an error).
    pub async fn publish(
        &self,
        payload: EventPayload,
        options: PublishOptions,
    ) -> Result<Option<String>> {
        let event_type = payload.event_type();
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| payload.default_queue().to_string());

        if !self.known_queues.iter().any(|known| known == &queue) {
            tracing::warn!(
                queue = %queue,
                event_type = %event_type,
                "Queue is not configured, dropping publish"
            );
            return Ok(None);
        }

        let mut event = Event::new(payload);
        if let Some(user_id) = options.user_id {
            event = event.with_user(user_id);
        }
        if options.emit_to_admins {
            event = event.with_admin_broadcast();
        }
        if let Some(request_id) = options.request_id.clone().or_else(context::current_request_id)
        {
            event = event.with_request_id(request_id);
        }

        let job_options = JobOptions {
            priority: options.priority,
            delay: options.delay,
            job_id: options.job_id.clone(),
        };

        match self.backend.enqueue(&queue, event, job_options).await {
            Ok(job_id) => {
                PIPELINE_METRICS
                    .jobs_published
                    .with_label_values(&[&queue, event_type])
                    .inc();
                tracing::debug!(
                    queue = %queue,
                    event_type = %event_type,
                    job_id = %job_id,
                    "Job enqueued"
                );
                Ok(Some(job_id))
            }
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    event_type = %event_type,
                    error = %e,
                    "Failed to enqueue job"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BACKGROUND_QUEUE, EVENTS_QUEUE};
    use crate::queue::memory::InMemoryQueue;

    fn publisher_with_memory_backend() -> (JobPublisher, Arc<InMemoryQueue>) {
        let backend = Arc::new(InMemoryQueue::default());
        let publisher = JobPublisher::new(
            backend.clone(),
            vec![EVENTS_QUEUE.to_string(), BACKGROUND_QUEUE.to_string()],
        );
        (publisher, backend)
    }

    fn sample_payload() -> EventPayload {
        EventPayload::UserRegistered {
            user_id: Uuid::new_v4(),
            email: "a@b.com".to_string(),
            name: "A".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_routes_to_default_queue() {
        let (publisher, backend) = publisher_with_memory_backend();

        let job_id = publisher
            .publish(sample_payload(), PublishOptions::default())
            .await
            .unwrap();
        assert!(job_id.is_some());
        assert_eq!(backend.counts(EVENTS_QUEUE).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_publish_background_event_routes_to_background_queue() {
        let (publisher, backend) = publisher_with_memory_backend();

        publisher
            .publish(
                EventPayload::FileUploaded {
                    user_id: Uuid::new_v4(),
                    file_id: Uuid::new_v4(),
                    file_name: "a.pdf".to_string(),
                    size_bytes: 10,
                },
                PublishOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(backend.counts(BACKGROUND_QUEUE).await.unwrap().waiting, 1);
        assert_eq!(backend.counts(EVENTS_QUEUE).await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_unknown_queue_returns_none_without_error() {
        let (publisher, backend) = publisher_with_memory_backend();

        let job_id = publisher
            .publish(
                sample_payload(),
                PublishOptions {
                    queue: Some("nonexistent".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(job_id.is_none());
        assert_eq!(backend.counts("nonexistent").await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_ambient_request_id_attached() {
        let (publisher, backend) = publisher_with_memory_backend();

        context::with_request_id("req-ambient", async {
            publisher
                .publish(sample_payload(), PublishOptions::default())
                .await
                .unwrap();
        })
        .await;

        let job = backend
            .dequeue(EVENTS_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.event.request_id.as_deref(), Some("req-ambient"));
    }

    #[tokio::test]
    async fn test_explicit_request_id_wins_over_ambient() {
        let (publisher, backend) = publisher_with_memory_backend();

        context::with_request_id("req-ambient", async {
            publisher
                .publish(
                    sample_payload(),
                    PublishOptions {
                        request_id: Some("req-explicit".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        })
        .await;

        let job = backend
            .dequeue(EVENTS_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.event.request_id.as_deref(), Some("req-explicit"));
    }
}
