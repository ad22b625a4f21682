//! Dedicated worker process for the background job queues.
//!
//! Runs the same handler registry as the main service but serves only the
//! queues named on the command line (default: `background`), so long-running
//! or crash-prone jobs stay out of the serving process.

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_relay::config::{Config, QueueBackendKind};
use event_relay::events::BACKGROUND_QUEUE;
use event_relay::handlers::{self, LoggingBroadcaster, LoggingEmailSender};
use event_relay::queue::{create_queue_backend, DispatcherSettings, JobDispatcher};
use event_relay::registry::HandlerRegistry;

#[derive(Parser)]
#[command(name = "event-relay-worker")]
#[command(about = "Dedicated worker process for background job queues", long_about = None)]
struct Args {
    /// Queue to serve; repeat the flag to serve several
    #[arg(short, long = "queue")]
    queues: Vec<String>,

    /// Override the configured worker concurrency
    #[arg(short, long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    init_tracing(&config);

    let queues = if args.queues.is_empty() {
        vec![BACKGROUND_QUEUE.to_string()]
    } else {
        args.queues.clone()
    };

    tracing::info!(
        queues = ?queues,
        "Starting event-relay-worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    if config.observability.prometheus_enabled {
        event_relay::metrics::init_pipeline_metrics();
    }

    if config.queue.backend == QueueBackendKind::Memory {
        tracing::warn!(
            "Memory queue backend is process-local; this worker only sees jobs published in this process"
        );
    }

    let mut registry = HandlerRegistry::new();
    handlers::register_all(
        &mut registry,
        Arc::new(LoggingEmailSender),
        Arc::new(LoggingBroadcaster),
    )?;
    let registry = Arc::new(registry);

    let backend = create_queue_backend(&config).await?;

    let mut settings = DispatcherSettings::from_config(&config.queue).with_queues(queues);
    if let Some(concurrency) = args.concurrency {
        settings.concurrency = concurrency;
    }

    let dispatcher = JobDispatcher::new(backend, registry, settings);
    dispatcher.start().await?;
    tracing::info!("Worker dispatcher started, press Ctrl+C to shut down");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    dispatcher.shutdown().await;
    tracing::info!("Worker shutdown complete");
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
