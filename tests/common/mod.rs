//! Common test utilities for pipeline integration tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use event_relay::error::Result;
use event_relay::events::Event;
use event_relay::handlers::{EmailSender, EmailTemplate, NotificationBroadcaster};
use event_relay::queue::DispatcherSettings;

/// Email sender that records every send for assertions
#[derive(Default)]
pub struct RecordingEmail {
    pub sent: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl EmailSender for RecordingEmail {
    async fn send(&self, template: EmailTemplate, recipient: &str, data: Value) -> Result<()> {
        self.sent.lock().push((
            template.as_str().to_string(),
            recipient.to_string(),
            data,
        ));
        Ok(())
    }
}

/// Broadcaster that records target rooms and event types
#[derive(Default)]
pub struct RecordingBroadcaster {
    pub broadcasts: Mutex<Vec<(Vec<String>, String)>>,
}

impl NotificationBroadcaster for RecordingBroadcaster {
    fn send_to_rooms(&self, rooms: &[String], event: &Event) {
        self.broadcasts
            .lock()
            .push((rooms.to_vec(), event.event_type().to_string()));
    }
}

pub fn recording_collaborators() -> (Arc<RecordingEmail>, Arc<RecordingBroadcaster>) {
    (
        Arc::new(RecordingEmail::default()),
        Arc::new(RecordingBroadcaster::default()),
    )
}

/// Dispatcher settings tuned for fast tests
pub fn fast_dispatcher_settings() -> DispatcherSettings {
    DispatcherSettings {
        concurrency: 2,
        rate_limit_max: 0,
        rate_limit_window: Duration::from_millis(100),
        job_timeout: Duration::from_millis(250),
        poll_interval: Duration::from_millis(20),
        stalled_interval: Duration::from_millis(100),
        queues: None,
    }
}
