//! Durable event publishing over Redis Streams

use redis::aio::ConnectionManager;
use redis::Client;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::events::Event;
use crate::metrics::PIPELINE_METRICS;
use crate::stream::EVENT_FIELD;

struct StreamTarget {
    connection: ConnectionManager,
    stream_key: String,
    max_len: u64,
}

/// Appends events to the configured Redis stream.
///
/// When stream publishing is disabled (or Redis is not configured) the
/// publisher still exists so call sites stay unconditional; every publish
/// then warns and returns `None`.
pub struct StreamPublisher {
    target: Option<StreamTarget>,
}

impl StreamPublisher {
    /// A publisher that drops every event
    pub fn disabled() -> Self {
        Self { target: None }
    }

    /// Connect according to configuration; disabled when `stream.enabled` is off
    pub async fn connect(config: &Config) -> Result<Self> {
        if !config.stream.enabled {
            tracing::info!("Stream publishing is disabled");
            return Ok(Self::disabled());
        }

        let redis_url = config.redis.url.as_ref().ok_or_else(|| {
            AppError::Configuration(
                "Stream publishing requires 'redis.url' configuration".to_string(),
            )
        })?;

        let client = Client::open(redis_url.as_str())
            .map_err(|e| AppError::Connection(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!(
            stream = %config.stream.stream_key,
            max_len = config.stream.max_len,
            "Initialized stream publisher"
        );

        Ok(Self {
            target: Some(StreamTarget {
                connection,
                stream_key: config.stream.stream_key.clone(),
                max_len: config.stream.max_len,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Append an event to the stream, trimming it to roughly `max_len`.
    ///
    /// Returns the assigned entry ID, or `None` when publishing is disabled.
    pub async fn publish(&self, event: &Event) -> Result<Option<String>> {
        let Some(target) = &self.target else {
            tracing::warn!(
                event_type = %event.event_type(),
                "Stream publishing is not configured, dropping event"
            );
            return Ok(None);
        };

        let payload = serde_json::to_string(event)?;

        let mut conn = target.connection.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&target.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(target.max_len)
            .arg("*")
            .arg(EVENT_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Stream(format!("XADD failed: {}", e)))?;

        PIPELINE_METRICS
            .stream_published
            .with_label_values(&[event.event_type()])
            .inc();

        tracing::debug!(
            stream = %target.stream_key,
            entry_id = %entry_id,
            event_type = %event.event_type(),
            "Event published to stream"
        );

        Ok(Some(entry_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_disabled_publisher_drops_events() {
        let publisher = StreamPublisher::disabled();
        assert!(!publisher.is_enabled());

        let event = Event::new(EventPayload::UserRegistered {
            user_id: Uuid::new_v4(),
            email: "a@b.com".to_string(),
            name: "A".to_string(),
        });

        let entry_id = publisher.publish(&event).await.unwrap();
        assert!(entry_id.is_none());
    }

    #[tokio::test]
    async fn test_connect_with_stream_disabled_yields_disabled_publisher() {
        let config = Config::default();
        let publisher = StreamPublisher::connect(&config).await.unwrap();
        assert!(!publisher.is_enabled());
    }

    #[tokio::test]
    async fn test_connect_enabled_without_redis_url_fails() {
        let mut config = Config::default();
        config.stream.enabled = true;
        config.redis.url = None;

        assert!(StreamPublisher::connect(&config).await.is_err());
    }
}
