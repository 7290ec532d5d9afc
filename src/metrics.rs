/// Metrics Module - Prometheus Instrumentation
///
/// All engine metrics live in one registry so embedders can export them
/// from wherever they serve /metrics. Label cardinality is bounded by
/// construction: event names, chain ids and table names are all fixed at
/// engine start.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

/// Reorg depth buckets (blocks)
const DEPTH_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// User handler duration by event name
    pub static ref INDEXING_FUNCTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "chainloom_indexing_function_duration_seconds",
            "User indexing function latency by event"
        )
        .buckets(LATENCY_BUCKETS.to_vec()),
        &["event"]
    ).unwrap();

    /// Events processed by event name
    pub static ref INDEXING_EVENTS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "chainloom_indexing_events_processed_total",
            "Events run through user indexing functions"
        ),
        &["event"]
    ).unwrap();

    /// Reorgs observed per chain
    pub static ref SYNC_REORG_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chainloom_sync_reorg_total", "Reorgs handled per chain"),
        &["chain"]
    ).unwrap();

    /// Reorg depth in blocks per chain
    pub static ref SYNC_REORG_DEPTH: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chainloom_sync_reorg_depth", "Reorg depth in blocks per chain")
            .buckets(DEPTH_BUCKETS.to_vec()),
        &["chain"]
    ).unwrap();

    /// Rows restored into user tables during revert
    pub static ref DATABASE_REVERT_ROWS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "chainloom_database_revert_rows_total",
            "User-table rows restored during reorg reverts"
        ),
        &["table"]
    ).unwrap();

    /// Shadow rows pruned during finalize
    pub static ref DATABASE_FINALIZE_ROWS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "chainloom_database_finalize_rows_total",
            "Shadow-table rows pruned by finalization"
        ),
        &["table"]
    ).unwrap();

    /// Historical batches committed
    pub static ref HISTORICAL_BATCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("chainloom_historical_batches_total", "Historical batches committed"),
        &["outcome"]
    ).unwrap();

    /// Batch commit latency
    pub static ref BATCH_COMMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "chainloom_batch_commit_duration_seconds",
            "Historical batch transaction latency"
        )
        .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    /// RPC cache effectiveness by tier (memory, durable, transport)
    pub static ref CLIENT_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("chainloom_client_requests_total", "Readonly client requests by serving tier"),
        &["tier"]
    ).unwrap();

    /// Static run configuration: ordering policy, database kind, command
    pub static ref SETTINGS_INFO: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainloom_settings_info", "Static engine settings"),
        &["ordering", "database", "command"]
    ).unwrap();
}

/// Register every metric with the global registry. Call once at startup;
/// duplicate registration is ignored so tests can call it freely.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(INDEXING_FUNCTION_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(INDEXING_EVENTS_PROCESSED.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_REORG_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_REORG_DEPTH.clone()));
    let _ = REGISTRY.register(Box::new(DATABASE_REVERT_ROWS.clone()));
    let _ = REGISTRY.register(Box::new(DATABASE_FINALIZE_ROWS.clone()));
    let _ = REGISTRY.register(Box::new(HISTORICAL_BATCHES.clone()));
    let _ = REGISTRY.register(Box::new(BATCH_COMMIT_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(CLIENT_REQUESTS.clone()));
    let _ = REGISTRY.register(Box::new(SETTINGS_INFO.clone()));
}

/// Encode the registry for a /metrics scrape or a CLI dump.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Small RAII timer for handler durations.
pub struct DurationTimer {
    start: Instant,
    event: String,
}

impl DurationTimer {
    pub fn start(event: &str) -> Self {
        Self {
            start: Instant::now(),
            event: event.to_string(),
        }
    }
}

impl Drop for DurationTimer {
    fn drop(&mut self) {
        INDEXING_FUNCTION_DURATION
            .with_label_values(&[&self.event])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
