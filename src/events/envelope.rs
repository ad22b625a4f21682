//! Event envelope wrapping a typed payload with identity and tracing metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::EventPayload;

/// Delivery metadata attached to an event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Target user for room-scoped notifications
    pub user_id: Option<Uuid>,

    /// Whether notification handlers should also broadcast to the admins room
    #[serde(default)]
    pub emit_to_admins: bool,
}

/// An immutable event record
///
/// Created once by a publisher and carried unchanged through queues and
/// streams. The payload's serde tag is the event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique ID, generated at publish time
    pub event_id: Uuid,

    /// Publish time
    pub timestamp: DateTime<Utc>,

    /// Typed payload (tagged with the event type)
    pub payload: EventPayload,

    /// Tracing correlation ID from the originating request, if any
    pub request_id: Option<String>,

    /// Delivery metadata
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    /// Create a new event envelope around a payload
    pub fn new(payload: EventPayload) -> Self {
        let user_id = payload.user_id();
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
            request_id: None,
            metadata: EventMetadata {
                user_id: Some(user_id),
                emit_to_admins: false,
            },
        }
    }

    /// Set the tracing correlation ID
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Override the target user
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.metadata.user_id = Some(user_id);
        self
    }

    /// Ask notification handlers to also broadcast to the admins room
    pub fn with_admin_broadcast(mut self) -> Self {
        self.metadata.emit_to_admins = true;
        self
    }

    /// Get the event type (the payload's serde tag)
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
