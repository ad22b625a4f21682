//! Event type registry: the closed set of event types, their payload shapes,
//! and the queue each type routes to by default.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Low-latency queue for notification events
pub const EVENTS_QUEUE: &str = "events";

/// Queue for heavy background work, executed out of process
pub const BACKGROUND_QUEUE: &str = "background";

/// Routing keys; these double as job names for handler lookup
pub const USER_REGISTERED: &str = "user.registered";
pub const USER_PASSWORD_RESET: &str = "user.password_reset";
pub const BILLING_PAYMENT_FAILED: &str = "billing.payment_failed";
pub const BILLING_SUBSCRIPTION_UPDATED: &str = "billing.subscription_updated";
pub const FILE_UPLOADED: &str = "file.uploaded";
pub const AUDIT_EXPORT_REQUESTED: &str = "audit.export_requested";

/// Event payloads, tagged by event type
///
/// This enum is the single source of truth for event shapes: producers and
/// consumers both deserialize through it, so a payload cannot drift from its
/// type. Adding an event requires adding a variant here first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// A new user completed registration
    #[serde(rename = "user.registered")]
    UserRegistered {
        user_id: Uuid,
        email: String,
        name: String,
    },

    /// A password reset was requested
    #[serde(rename = "user.password_reset")]
    UserPasswordReset {
        user_id: Uuid,
        email: String,
        reset_link: String,
    },

    /// A subscription payment failed
    #[serde(rename = "billing.payment_failed")]
    BillingPaymentFailed {
        user_id: Uuid,
        email: String,
        invoice_id: String,
        amount_cents: i64,
        currency: String,
    },

    /// A subscription plan or status changed
    #[serde(rename = "billing.subscription_updated")]
    BillingSubscriptionUpdated {
        user_id: Uuid,
        plan: String,
        status: String,
    },

    /// A file finished uploading and needs post-processing
    #[serde(rename = "file.uploaded")]
    FileUploaded {
        user_id: Uuid,
        file_id: Uuid,
        file_name: String,
        size_bytes: u64,
    },

    /// An audit-log export was requested
    #[serde(rename = "audit.export_requested")]
    AuditExportRequested {
        user_id: Uuid,
        email: String,
        export_id: Uuid,
    },
}

impl EventPayload {
    /// Get the event type as a string (the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::UserRegistered { .. } => USER_REGISTERED,
            EventPayload::UserPasswordReset { .. } => USER_PASSWORD_RESET,
            EventPayload::BillingPaymentFailed { .. } => BILLING_PAYMENT_FAILED,
            EventPayload::BillingSubscriptionUpdated { .. } => BILLING_SUBSCRIPTION_UPDATED,
            EventPayload::FileUploaded { .. } => FILE_UPLOADED,
            EventPayload::AuditExportRequested { .. } => AUDIT_EXPORT_REQUESTED,
        }
    }

    /// Queue this event type routes to when the publisher gets no override
    pub fn default_queue(&self) -> &'static str {
        match self {
            EventPayload::UserRegistered { .. }
            | EventPayload::UserPasswordReset { .. }
            | EventPayload::BillingPaymentFailed { .. }
            | EventPayload::BillingSubscriptionUpdated { .. } => EVENTS_QUEUE,
            EventPayload::FileUploaded { .. } | EventPayload::AuditExportRequested { .. } => {
                BACKGROUND_QUEUE
            }
        }
    }

    /// Get the user ID carried by any payload
    pub fn user_id(&self) -> Uuid {
        match self {
            EventPayload::UserRegistered { user_id, .. }
            | EventPayload::UserPasswordReset { user_id, .. }
            | EventPayload::BillingPaymentFailed { user_id, .. }
            | EventPayload::BillingSubscriptionUpdated { user_id, .. }
            | EventPayload::FileUploaded { user_id, .. }
            | EventPayload::AuditExportRequested { user_id, .. } => *user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tags() {
        let payload = EventPayload::UserRegistered {
            user_id: Uuid::new_v4(),
            email: "a@b.com".to_string(),
            name: "A".to_string(),
        };

        assert_eq!(payload.event_type(), "user.registered");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "user.registered");
        assert_eq!(json["email"], "a@b.com");
    }

    #[test]
    fn test_default_queue_routing() {
        let notification = EventPayload::UserPasswordReset {
            user_id: Uuid::new_v4(),
            email: "a@b.com".to_string(),
            reset_link: "https://app.example.com/reset/abc".to_string(),
        };
        assert_eq!(notification.default_queue(), EVENTS_QUEUE);

        let heavy = EventPayload::FileUploaded {
            user_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            file_name: "report.pdf".to_string(),
            size_bytes: 1024,
        };
        assert_eq!(heavy.default_queue(), BACKGROUND_QUEUE);
    }

    #[test]
    fn test_round_trip() {
        let payload = EventPayload::BillingPaymentFailed {
            user_id: Uuid::new_v4(),
            email: "a@b.com".to_string(),
            invoice_id: "inv_123".to_string(),
            amount_cents: 4900,
            currency: "usd".to_string(),
        };

        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "billing.payment_failed");
    }
}
