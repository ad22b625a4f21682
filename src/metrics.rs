//! Prometheus metrics for the dispatch pipeline

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

/// Pipeline metrics
pub struct PipelineMetrics {
    /// Jobs published counter
    pub jobs_published: CounterVec,

    /// Jobs processed counter, by outcome
    pub jobs_processed: CounterVec,

    /// Job execution latency
    pub job_duration: HistogramVec,

    /// Stream events appended counter
    pub stream_published: CounterVec,

    /// Stream messages processed counter, by outcome
    pub stream_processed: CounterVec,

    /// Stream handler latency
    pub stream_duration: HistogramVec,

    /// Messages routed to the dead-letter stream
    pub dead_letters: CounterVec,

    /// Pending messages reclaimed from crashed consumers
    pub claimed_messages: CounterVec,

    /// Running dispatcher workers gauge
    pub active_workers: GaugeVec,
}

lazy_static! {
    pub static ref PIPELINE_METRICS: PipelineMetrics = PipelineMetrics {
        jobs_published: register_counter_vec!(
            "relay_jobs_published_total",
            "Total number of jobs enqueued",
            &["queue", "job"]
        )
        .unwrap(),

        jobs_processed: register_counter_vec!(
            "relay_jobs_processed_total",
            "Total number of jobs processed",
            &["queue", "job", "outcome"]
        )
        .unwrap(),

        job_duration: register_histogram_vec!(
            "relay_job_duration_seconds",
            "Job execution latency in seconds",
            &["queue", "job"]
        )
        .unwrap(),

        stream_published: register_counter_vec!(
            "relay_stream_published_total",
            "Total number of events appended to the stream",
            &["event_type"]
        )
        .unwrap(),

        stream_processed: register_counter_vec!(
            "relay_stream_processed_total",
            "Total number of stream messages processed",
            &["event_type", "outcome"]
        )
        .unwrap(),

        stream_duration: register_histogram_vec!(
            "relay_stream_duration_seconds",
            "Stream handler latency in seconds",
            &["event_type"]
        )
        .unwrap(),

        dead_letters: register_counter_vec!(
            "relay_dead_letters_total",
            "Messages moved to the dead-letter stream",
            &["event_type"]
        )
        .unwrap(),

        claimed_messages: register_counter_vec!(
            "relay_claimed_messages_total",
            "Pending messages reclaimed via auto-claim",
            &["consumer"]
        )
        .unwrap(),

        active_workers: register_gauge_vec!(
            "relay_active_workers",
            "Number of running dispatcher workers",
            &["queue"]
        )
        .unwrap(),
    };
}

/// Initialize pipeline metrics
pub fn init_pipeline_metrics() {
    lazy_static::initialize(&PIPELINE_METRICS);
}

/// Gather all registered metrics (for embedders that expose them)
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    prometheus::gather()
}
