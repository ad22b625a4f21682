//! event-relay: background job dispatch and event notification pipeline
//!
//! Domain actions publish typed events; the pipeline delivers them twice
//! over:
//!
//! - **Job path** — [`queue::JobPublisher`] enqueues the event as a job on a
//!   named queue, [`queue::JobDispatcher`] workers lease jobs, resolve the
//!   handler through [`registry::HandlerRegistry`], and run it under a
//!   timeout with retry/backoff owned by the queue backend. The background
//!   queue is served by a separate worker process.
//! - **Stream path** — [`stream::StreamPublisher`] appends the event to a
//!   Redis stream; each consuming service reads it through its own consumer
//!   group with [`stream::StreamConsumer`], which auto-claims entries from
//!   crashed consumers and dead-letters poison messages.
//!
//! Handlers perform the business side effects (email, WebSocket pushes)
//! through the collaborator interfaces in [`handlers`].

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod stream;

pub use config::Config;
pub use error::{AppError, Result};
pub use events::{Event, EventPayload};
pub use queue::{JobDispatcher, JobPublisher};
pub use registry::HandlerRegistry;
pub use stream::{StreamConsumer, StreamPublisher};
