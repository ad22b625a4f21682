//! Business-level notification handlers
//!
//! One handler per event type. Each sends an email and/or pushes a WebSocket
//! notification through the collaborator interfaces; the pipeline delivers
//! at-least-once, so a retried job repeats its sends and collaborators must
//! tolerate duplicates.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{Event, EventPayload};
use crate::handlers::collaborators::{
    user_room, EmailSender, EmailTemplate, NotificationBroadcaster, ADMIN_ROOM,
};
use crate::registry::JobContext;

/// Notification side effects for every pipeline event
pub struct NotificationHandlers {
    email: Arc<dyn EmailSender>,
    broadcaster: Arc<dyn NotificationBroadcaster>,
}

impl NotificationHandlers {
    pub fn new(email: Arc<dyn EmailSender>, broadcaster: Arc<dyn NotificationBroadcaster>) -> Self {
        Self { email, broadcaster }
    }

    /// Route an event to its handler based on the payload variant
    pub async fn dispatch(&self, ctx: JobContext) -> Result<()> {
        let event = ctx.event;
        match &event.payload {
            EventPayload::UserRegistered {
                user_id,
                email,
                name,
            } => self.user_registered(&event, *user_id, email, name).await,

            EventPayload::UserPasswordReset {
                email, reset_link, ..
            } => self.password_reset(email, reset_link).await,

            EventPayload::BillingPaymentFailed {
                user_id,
                email,
                invoice_id,
                amount_cents,
                currency,
            } => {
                self.payment_failed(&event, *user_id, email, invoice_id, *amount_cents, currency)
                    .await
            }

            EventPayload::BillingSubscriptionUpdated { user_id, .. } => {
                self.subscription_updated(&event, *user_id).await
            }

            EventPayload::FileUploaded { user_id, .. } => self.file_uploaded(&event, *user_id).await,

            EventPayload::AuditExportRequested {
                email, export_id, ..
            } => self.audit_export_requested(email, *export_id).await,
        }
    }

    async fn user_registered(
        &self,
        event: &Event,
        user_id: Uuid,
        email: &str,
        name: &str,
    ) -> Result<()> {
        self.email
            .send(EmailTemplate::Welcome, email, json!({ "name": name }))
            .await?;

        let mut rooms = vec![user_room(&user_id)];
        if event.metadata.emit_to_admins {
            rooms.push(ADMIN_ROOM.to_string());
        }
        self.broadcaster.send_to_rooms(&rooms, event);
        Ok(())
    }

    /// Email only: reset links must never reach other open sessions over WebSocket
    async fn password_reset(&self, email: &str, reset_link: &str) -> Result<()> {
        self.email
            .send(
                EmailTemplate::PasswordReset,
                email,
                json!({ "reset_link": reset_link }),
            )
            .await
    }

    /// Payment failures always reach the admin room as well
    async fn payment_failed(
        &self,
        event: &Event,
        user_id: Uuid,
        email: &str,
        invoice_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<()> {
        self.email
            .send(
                EmailTemplate::PaymentFailed,
                email,
                json!({
                    "invoice_id": invoice_id,
                    "amount_cents": amount_cents,
                    "currency": currency,
                }),
            )
            .await?;

        let rooms = vec![user_room(&user_id), ADMIN_ROOM.to_string()];
        self.broadcaster.send_to_rooms(&rooms, event);
        Ok(())
    }

    async fn subscription_updated(&self, event: &Event, user_id: Uuid) -> Result<()> {
        self.broadcaster.send_to_rooms(&[user_room(&user_id)], event);
        Ok(())
    }

    async fn file_uploaded(&self, event: &Event, user_id: Uuid) -> Result<()> {
        self.broadcaster.send_to_rooms(&[user_room(&user_id)], event);
        Ok(())
    }

    async fn audit_export_requested(&self, email: &str, export_id: Uuid) -> Result<()> {
        self.email
            .send(
                EmailTemplate::AuditExportReady,
                email,
                json!({ "export_id": export_id }),
            )
            .await
    }
}
