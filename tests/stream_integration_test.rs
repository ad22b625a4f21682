//! Integration tests for the Redis Streams path: publisher, consumer group,
//! redelivery via auto-claim, and the dead-letter stream.
//!
//! These tests need a local Redis (database 15) and skip themselves when it
//! is not reachable. Every test uses its own uuid-tagged stream keys.

use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use event_relay::config::Config;
use event_relay::error::AppError;
use event_relay::events::{EventPayload, USER_REGISTERED};
use event_relay::registry::HandlerRegistry;
use event_relay::stream::{codec, StreamConsumer, StreamPublisher, EVENT_FIELD};

const REDIS_URL: &str = "redis://127.0.0.1:6379/15";

async fn redis_connection() -> Option<ConnectionManager> {
    let client = Client::open(REDIS_URL).ok()?;
    let mut conn = ConnectionManager::new(client).await.ok()?;
    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .ok()?;
    Some(conn)
}

/// Config with uuid-tagged stream keys and short timings for tests
fn test_config(max_retries: u32) -> Config {
    let tag = Uuid::new_v4();
    let mut config = Config::default();
    config.service.name = "relay-test".to_string();
    config.redis.url = Some(REDIS_URL.to_string());
    config.stream.enabled = true;
    config.stream.stream_key = format!("test-relay-stream-{}", tag);
    config.stream.dlq_key = format!("test-relay-dlq-{}", tag);
    config.stream.group = "test-group".to_string();
    config.stream.batch_size = 8;
    config.stream.block_ms = 100;
    config.stream.max_retries = max_retries;
    config.stream.handler_timeout_secs = 1;
    config.stream.claim_interval_secs = 1;
    // Entries become claimable shortly after their handler gave up, but a
    // successful handler always acks well before this
    config.stream.min_idle_ms = 300;
    config
}

fn sample_payload() -> EventPayload {
    EventPayload::UserRegistered {
        user_id: Uuid::new_v4(),
        email: "a@b.com".to_string(),
        name: "A".to_string(),
    }
}

async fn pending_entries(conn: &mut ConnectionManager, key: &str, group: &str) -> usize {
    let reply = redis::cmd("XPENDING")
        .arg(key)
        .arg(group)
        .arg("-")
        .arg("+")
        .arg(100)
        .query_async::<_, redis::Value>(conn)
        .await
        .unwrap();
    codec::parse_pending_counts(&reply).len()
}

async fn read_all(conn: &mut ConnectionManager, key: &str) -> Vec<codec::StreamEntry> {
    let reply = redis::cmd("XRANGE")
        .arg(key)
        .arg("-")
        .arg("+")
        .query_async::<_, redis::Value>(conn)
        .await
        .unwrap();
    codec::parse_entries(&reply)
}

/// Test that creating the consumer group twice succeeds (idempotent setup)
#[tokio::test]
async fn test_group_setup_is_idempotent() {
    let Some(_conn) = redis_connection().await else {
        eprintln!("Skipping test: Redis not available");
        return;
    };

    let config = test_config(3);
    let registry = Arc::new(HandlerRegistry::new());

    let consumer = StreamConsumer::connect(&config, registry).await.unwrap();
    consumer.ensure_group().await.unwrap();
    consumer.ensure_group().await.unwrap();
}

/// Test publish -> consume -> handler -> acknowledge, end to end
#[tokio::test]
async fn test_publish_consume_acknowledge() {
    let Some(mut conn) = redis_connection().await else {
        eprintln!("Skipping test: Redis not available");
        return;
    };

    let config = test_config(3);
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let calls_in_handler = calls.clone();
    registry
        .register_stream(USER_REGISTERED, move |ctx| {
            let calls = calls_in_handler.clone();
            async move {
                assert_eq!(ctx.event.event_type(), USER_REGISTERED);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    let consumer = StreamConsumer::connect(&config, Arc::new(registry))
        .await
        .unwrap();
    consumer.start().await.unwrap();

    let publisher = StreamPublisher::connect(&config).await.unwrap();
    let entry_id = publisher
        .publish(&event_relay::events::Event::new(sample_payload()))
        .await
        .unwrap();
    assert!(entry_id.is_some());

    tokio::time::sleep(Duration::from_millis(600)).await;
    consumer.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        pending_entries(&mut conn, &config.stream.stream_key, &config.stream.group).await,
        0
    );
}

/// Test that an event type with no registered handler is acknowledged within
/// one consume cycle instead of blocking the stream
#[tokio::test]
async fn test_missing_handler_is_acknowledged() {
    let Some(mut conn) = redis_connection().await else {
        eprintln!("Skipping test: Redis not available");
        return;
    };

    let config = test_config(3);
    let consumer = StreamConsumer::connect(&config, Arc::new(HandlerRegistry::new()))
        .await
        .unwrap();
    consumer.start().await.unwrap();

    let publisher = StreamPublisher::connect(&config).await.unwrap();
    publisher
        .publish(&event_relay::events::Event::new(sample_payload()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    consumer.stop().await;

    assert_eq!(
        pending_entries(&mut conn, &config.stream.stream_key, &config.stream.group).await,
        0
    );
    // The entry itself stays in the stream; only its pending state is gone
    assert_eq!(read_all(&mut conn, &config.stream.stream_key).await.len(), 1);
}

/// Test that an always-failing handler is redelivered via auto-claim and the
/// entry lands in the dead-letter stream once the delivery count reaches the
/// retry ceiling
#[tokio::test]
async fn test_exhausted_retries_go_to_dead_letter_stream() {
    let Some(mut conn) = redis_connection().await else {
        eprintln!("Skipping test: Redis not available");
        return;
    };

    let config = test_config(2);
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let calls_in_handler = calls.clone();
    registry
        .register_stream(USER_REGISTERED, move |_ctx| {
            let calls = calls_in_handler.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Handler("downstream unavailable".to_string()))
            }
        })
        .unwrap();

    let consumer = StreamConsumer::connect(&config, Arc::new(registry))
        .await
        .unwrap();
    consumer.start().await.unwrap();

    let publisher = StreamPublisher::connect(&config).await.unwrap();
    let entry_id = publisher
        .publish(&event_relay::events::Event::new(sample_payload()))
        .await
        .unwrap()
        .unwrap();

    // First delivery fails; the claim pass redelivers at delivery count 2,
    // which hits the ceiling and dead-letters before re-running the handler
    tokio::time::sleep(Duration::from_millis(2500)).await;
    consumer.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        pending_entries(&mut conn, &config.stream.stream_key, &config.stream.group).await,
        0
    );

    let dead = read_all(&mut conn, &config.stream.dlq_key).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].field("original_message_id"), Some(entry_id.as_str()));
    assert_eq!(dead[0].field("retry_count"), Some("2"));
    assert!(dead[0].field("consumer").unwrap().starts_with("relay-test-"));
    assert!(dead[0].field(EVENT_FIELD).unwrap().contains("a@b.com"));
}

/// Test that a transient failure is recovered: fail once, succeed on the
/// auto-claimed redelivery, no dead-letter entry
#[tokio::test]
async fn test_transient_failure_recovers_on_redelivery() {
    let Some(mut conn) = redis_connection().await else {
        eprintln!("Skipping test: Redis not available");
        return;
    };

    let config = test_config(5);
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let calls_in_handler = calls.clone();
    registry
        .register_stream(USER_REGISTERED, move |_ctx| {
            let calls = calls_in_handler.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::Handler("first attempt fails".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .unwrap();

    let consumer = StreamConsumer::connect(&config, Arc::new(registry))
        .await
        .unwrap();
    consumer.start().await.unwrap();

    let publisher = StreamPublisher::connect(&config).await.unwrap();
    publisher
        .publish(&event_relay::events::Event::new(sample_payload()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    consumer.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        pending_entries(&mut conn, &config.stream.stream_key, &config.stream.group).await,
        0
    );
    assert!(read_all(&mut conn, &config.stream.dlq_key).await.is_empty());
}

/// Test that the handler deadline abandons the wait, not the work: a handler
/// that outlives its timeout still finishes its side effects, while the entry
/// itself is redelivered and eventually dead-lettered
#[tokio::test]
async fn test_timed_out_handler_work_still_lands() {
    let Some(mut conn) = redis_connection().await else {
        eprintln!("Skipping test: Redis not available");
        return;
    };

    let config = test_config(2);
    let calls = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let mut registry = HandlerRegistry::new();
    let calls_in_handler = calls.clone();
    let finished_in_handler = finished.clone();
    registry
        .register_stream(USER_REGISTERED, move |_ctx| {
            let calls = calls_in_handler.clone();
            let finished = finished_in_handler.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Sleeps past the 1s handler timeout
                tokio::time::sleep(Duration::from_millis(1400)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    let consumer = StreamConsumer::connect(&config, Arc::new(registry))
        .await
        .unwrap();
    consumer.start().await.unwrap();

    let publisher = StreamPublisher::connect(&config).await.unwrap();
    publisher
        .publish(&event_relay::events::Event::new(sample_payload()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    consumer.stop().await;

    // The first delivery timed out but its work was not cancelled
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(finished.load(Ordering::SeqCst));

    // The entry was never acknowledged by that delivery: the claim pass
    // redelivered it at the ceiling and dead-lettered it
    assert_eq!(
        pending_entries(&mut conn, &config.stream.stream_key, &config.stream.group).await,
        0
    );
    let dead = read_all(&mut conn, &config.stream.dlq_key).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].field("retry_count"), Some("2"));
}

/// Test that an entry whose payload cannot be deserialized is dead-lettered
/// and acknowledged instead of being retried forever
#[tokio::test]
async fn test_undecodable_entry_is_dead_lettered() {
    let Some(mut conn) = redis_connection().await else {
        eprintln!("Skipping test: Redis not available");
        return;
    };

    let config = test_config(3);
    let consumer = StreamConsumer::connect(&config, Arc::new(HandlerRegistry::new()))
        .await
        .unwrap();
    consumer.start().await.unwrap();

    // Write a poison entry straight to the stream
    let _: String = redis::cmd("XADD")
        .arg(&config.stream.stream_key)
        .arg("*")
        .arg(EVENT_FIELD)
        .arg("this is not json")
        .query_async(&mut conn)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    consumer.stop().await;

    assert_eq!(
        pending_entries(&mut conn, &config.stream.stream_key, &config.stream.group).await,
        0
    );

    let dead = read_all(&mut conn, &config.stream.dlq_key).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].field(EVENT_FIELD), Some("this is not json"));
}
