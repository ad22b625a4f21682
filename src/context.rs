//! Ambient request-context propagation
//!
//! Publishers fall back to the task-local request ID when the caller does not
//! pass one explicitly, so events published deep inside a request flow stay
//! correlatable without threading the ID through every call.

use std::future::Future;

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Run a future with an ambient request ID in scope
pub async fn with_request_id<F>(request_id: impl Into<String>, f: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id.into(), f).await
}

/// Get the ambient request ID, if the current task carries one
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}
