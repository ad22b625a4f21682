//! Event type registry and envelope
//!
//! The closed mapping from event names to payload shapes lives here, together
//! with the two well-known queue names. Both the job path and the stream path
//! serialize the same [`Event`] record.

pub mod envelope;
pub mod types;

pub use envelope::{Event, EventMetadata};
pub use types::{
    EventPayload, AUDIT_EXPORT_REQUESTED, BACKGROUND_QUEUE, BILLING_PAYMENT_FAILED,
    BILLING_SUBSCRIPTION_UPDATED, EVENTS_QUEUE, FILE_UPLOADED, USER_PASSWORD_RESET,
    USER_REGISTERED,
};
