//! Durable event fan-out over Redis Streams
//!
//! The queue side of the pipeline dispatches work to this service's own
//! handlers; the stream side makes the same events available to other
//! services. Producers append with [`publisher::StreamPublisher`], each
//! consuming service reads through its own consumer group with
//! [`consumer::StreamConsumer`].

pub mod codec;
pub mod consumer;
pub mod publisher;

pub use codec::StreamEntry;
pub use consumer::{ConsumerSettings, ConsumerState, StreamConsumer};
pub use publisher::StreamPublisher;

/// Stream entry field holding the serialized event
pub const EVENT_FIELD: &str = "event";
