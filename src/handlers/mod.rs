//! Notification handlers and their registration

pub mod collaborators;
pub mod notifications;

pub use collaborators::{
    user_room, EmailSender, EmailTemplate, LoggingBroadcaster, LoggingEmailSender,
    NotificationBroadcaster, ADMIN_ROOM,
};
pub use notifications::NotificationHandlers;

use std::sync::Arc;

use crate::error::Result;
use crate::events::{
    AUDIT_EXPORT_REQUESTED, BACKGROUND_QUEUE, BILLING_PAYMENT_FAILED,
    BILLING_SUBSCRIPTION_UPDATED, EVENTS_QUEUE, FILE_UPLOADED, USER_PASSWORD_RESET,
    USER_REGISTERED,
};
use crate::registry::HandlerRegistry;

/// Which queue each event type's job handler listens on
const JOB_ROUTES: &[(&str, &str)] = &[
    (EVENTS_QUEUE, USER_REGISTERED),
    (EVENTS_QUEUE, USER_PASSWORD_RESET),
    (EVENTS_QUEUE, BILLING_PAYMENT_FAILED),
    (EVENTS_QUEUE, BILLING_SUBSCRIPTION_UPDATED),
    (BACKGROUND_QUEUE, FILE_UPLOADED),
    (BACKGROUND_QUEUE, AUDIT_EXPORT_REQUESTED),
];

/// Register every notification handler, for both the job queues and the
/// event stream. Fails if any `(queue, job)` pair is already taken.
pub fn register_all(
    registry: &mut HandlerRegistry,
    email: Arc<dyn EmailSender>,
    broadcaster: Arc<dyn NotificationBroadcaster>,
) -> Result<()> {
    let handlers = Arc::new(NotificationHandlers::new(email, broadcaster));

    for (queue, job_name) in JOB_ROUTES {
        let job_handlers = handlers.clone();
        registry.register(*queue, *job_name, move |ctx| {
            let handlers = job_handlers.clone();
            async move { handlers.dispatch(ctx).await }
        })?;

        let stream_handlers = handlers.clone();
        registry.register_stream(*job_name, move |ctx| {
            let handlers = stream_handlers.clone();
            async move { handlers.dispatch(ctx).await }
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventPayload};
    use crate::registry::JobContext;
    use uuid::Uuid;

    #[test]
    fn test_register_all_covers_every_event_type() {
        let mut registry = HandlerRegistry::new();
        register_all(
            &mut registry,
            Arc::new(LoggingEmailSender),
            Arc::new(LoggingBroadcaster),
        )
        .unwrap();

        assert_eq!(registry.job_handler_count(), 6);
        assert_eq!(registry.stream_handler_count(), 6);
        assert_eq!(
            registry.queues(),
            vec![BACKGROUND_QUEUE.to_string(), EVENTS_QUEUE.to_string()]
        );
        assert!(registry.job_handler(EVENTS_QUEUE, USER_REGISTERED).is_some());
        assert!(registry
            .job_handler(BACKGROUND_QUEUE, AUDIT_EXPORT_REQUESTED)
            .is_some());
        assert!(registry.stream_handler(USER_PASSWORD_RESET).is_some());
    }

    /// Both closures registered for a route share one `NotificationHandlers`;
    /// each must dispatch independently of the other
    #[tokio::test]
    async fn test_job_and_stream_closures_both_dispatch() {
        let mut registry = HandlerRegistry::new();
        register_all(
            &mut registry,
            Arc::new(LoggingEmailSender),
            Arc::new(LoggingBroadcaster),
        )
        .unwrap();

        let context = JobContext {
            event: Event::new(EventPayload::UserRegistered {
                user_id: Uuid::new_v4(),
                email: "a@b.com".to_string(),
                name: "A".to_string(),
            }),
            job_id: "job-1".to_string(),
            queue: EVENTS_QUEUE.to_string(),
            attempt: 1,
        };

        let job = registry.job_handler(EVENTS_QUEUE, USER_REGISTERED).unwrap();
        job(context.clone()).await.unwrap();

        let stream = registry.stream_handler(USER_REGISTERED).unwrap();
        stream(context).await.unwrap();
    }

    #[test]
    fn test_register_all_twice_is_a_startup_error() {
        let mut registry = HandlerRegistry::new();
        register_all(
            &mut registry,
            Arc::new(LoggingEmailSender),
            Arc::new(LoggingBroadcaster),
        )
        .unwrap();

        let second = register_all(
            &mut registry,
            Arc::new(LoggingEmailSender),
            Arc::new(LoggingBroadcaster),
        );
        assert!(second.is_err());
    }
}
