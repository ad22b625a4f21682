//! Delivery collaborators consumed by the notification handlers
//!
//! Actual email transport and the WebSocket gateway live in other services;
//! this module only defines the interfaces the handlers call, plus
//! log-and-succeed implementations so the binaries run standalone.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::events::Event;

/// Room receiving every admin-facing broadcast
pub const ADMIN_ROOM: &str = "admins";

/// Per-user WebSocket room name
pub fn user_room(user_id: &uuid::Uuid) -> String {
    format!("user_{}", user_id)
}

/// Email templates the handlers may send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    Welcome,
    PasswordReset,
    PaymentFailed,
    AuditExportReady,
}

impl EmailTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailTemplate::Welcome => "welcome",
            EmailTemplate::PasswordReset => "password_reset",
            EmailTemplate::PaymentFailed => "payment_failed",
            EmailTemplate::AuditExportReady => "audit_export_ready",
        }
    }
}

/// Sends a templated email to one recipient
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, template: EmailTemplate, recipient: &str, data: Value) -> Result<()>;
}

/// Pushes an event to WebSocket rooms; fire-and-forget
pub trait NotificationBroadcaster: Send + Sync {
    fn send_to_rooms(&self, rooms: &[String], event: &Event);
}

/// Email sender that only logs; used when no transport is wired up
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, template: EmailTemplate, recipient: &str, data: Value) -> Result<()> {
        tracing::info!(
            template = template.as_str(),
            recipient = %recipient,
            data = %data,
            "Email send requested"
        );
        Ok(())
    }
}

/// Broadcaster that only logs; used when no gateway is wired up
pub struct LoggingBroadcaster;

impl NotificationBroadcaster for LoggingBroadcaster {
    fn send_to_rooms(&self, rooms: &[String], event: &Event) {
        tracing::info!(
            rooms = ?rooms,
            event_type = %event.event_type(),
            event_id = %event.event_id,
            "WebSocket broadcast requested"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_room_format() {
        let user_id = uuid::Uuid::nil();
        assert_eq!(
            user_room(&user_id),
            "user_00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_template_names() {
        assert_eq!(EmailTemplate::Welcome.as_str(), "welcome");
        assert_eq!(EmailTemplate::PasswordReset.as_str(), "password_reset");
    }
}
