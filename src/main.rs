use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_relay::config::Config;
use event_relay::events::BACKGROUND_QUEUE;
use event_relay::handlers::{self, LoggingBroadcaster, LoggingEmailSender};
use event_relay::queue::{create_queue_backend, DispatcherSettings, JobDispatcher};
use event_relay::registry::HandlerRegistry;
use event_relay::stream::StreamConsumer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    init_tracing(&config);

    tracing::info!("Starting event-relay v{}", env!("CARGO_PKG_VERSION"));

    if config.observability.prometheus_enabled {
        event_relay::metrics::init_pipeline_metrics();
        tracing::info!("Prometheus metrics initialized");
    }

    // Build the handler registry once; read-only afterwards
    let mut registry = HandlerRegistry::new();
    handlers::register_all(
        &mut registry,
        Arc::new(LoggingEmailSender),
        Arc::new(LoggingBroadcaster),
    )?;
    let registry = Arc::new(registry);
    tracing::info!(
        job_handlers = registry.job_handler_count(),
        stream_handlers = registry.stream_handler_count(),
        "Handler registry built"
    );

    // Queue backend and worker pool
    let backend = create_queue_backend(&config).await?;

    let mut settings = DispatcherSettings::from_config(&config.queue);
    if config.queue.background_out_of_process {
        // The background queue is served by the event-relay-worker process
        let inline_queues: Vec<String> = registry
            .queues()
            .into_iter()
            .filter(|queue| queue != BACKGROUND_QUEUE)
            .collect();
        settings = settings.with_queues(inline_queues);
        tracing::info!("Background queue delegated to the worker process");
    }

    let dispatcher = JobDispatcher::new(backend.clone(), registry.clone(), settings);
    dispatcher.start().await?;
    tracing::info!("Job dispatcher started");

    // Stream consumer, when enabled
    let consumer = if config.stream.enabled {
        let consumer = StreamConsumer::connect(&config, registry.clone()).await?;
        consumer.start().await?;
        tracing::info!(consumer = %consumer.consumer_name(), "Stream consumer started");
        Some(consumer)
    } else {
        tracing::info!("Stream consumer disabled in configuration");
        None
    };

    tracing::info!(
        known_queues = ?config.queue.known_queues,
        concurrency = config.queue.concurrency,
        stream_enabled = config.stream.enabled,
        "event-relay running, press Ctrl+C to shut down"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    dispatcher.shutdown().await;
    if let Some(consumer) = consumer {
        consumer.stop().await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("event_relay={}", config.observability.log_level).into());

    if config.observability.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
