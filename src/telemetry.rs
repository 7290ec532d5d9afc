/// Telemetry Module
///
/// Structured logging for the engine, plus display helpers for the two
/// values chainloom logs constantly: block hashes and encoded checkpoints.
/// Raw checkpoints are 75 opaque digits; log lines want `chain:block@ts`.
///
/// The historical path reports progress through `IndexingProgress`, which
/// folds throughput into the sampled log line instead of a bare counter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing_appender::rolling;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::checkpoint::{
    BLOCK_NUMBER_DIGITS, CHAIN_ID_DIGITS, CHECKPOINT_LEN, MAX_CHECKPOINT, TIMESTAMP_DIGITS,
    ZERO_CHECKPOINT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directives used when RUST_LOG is unset. The default keeps
    /// engine logs at info while silencing sqlx statement chatter;
    /// slow-statement warnings still pass.
    pub log_level: String,
    pub format: LogFormat,
    /// Log to a daily-rotated file instead of stdout.
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info,sqlx=warn".to_string(),
            format: LogFormat::from_name(
                &std::env::var("CHAINLOOM_LOG_FORMAT").unwrap_or_default(),
            ),
            log_file: std::env::var("CHAINLOOM_LOG_FILE").ok().map(PathBuf::from),
        }
    }
}

/// Initialize the tracing subscriber. RUST_LOG overrides the configured
/// filter; the file sink rotates daily and writes through a non-blocking
/// worker whose guard lives for the process.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(path) => {
            let directory = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let prefix = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or("invalid log file path: no file name")?;
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(directory, prefix));
            // Keep the worker alive for the process lifetime
            std::mem::forget(guard);
            install(filter, config.format, writer);
        }
        None => install(filter, config.format, std::io::stdout as fn() -> std::io::Stdout),
    }
    Ok(())
}

fn install<W>(filter: EnvFilter, format: LogFormat, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(writer)).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(writer))
            .init(),
    }
}

/// Compact display form of a block hash: "0xddf252ad1b..".
pub fn short_hash(hash: &str) -> String {
    if hash.len() <= 12 {
        hash.to_string()
    } else {
        format!("{}..", &hash[..12])
    }
}

/// Compact display form of a checkpoint: "chain:block@timestamp".
///
/// Works on block-boundary checkpoints too (their event-type digit does not
/// decode as a variant); sentinels render by name and anything malformed
/// falls back to a plain prefix.
pub fn short_checkpoint(checkpoint: &str) -> String {
    if checkpoint == ZERO_CHECKPOINT {
        return "zero".to_string();
    }
    if checkpoint == MAX_CHECKPOINT {
        return "max".to_string();
    }
    if checkpoint.len() != CHECKPOINT_LEN || !checkpoint.bytes().all(|b| b.is_ascii_digit()) {
        return short_hash(checkpoint);
    }
    let timestamp = &checkpoint[..TIMESTAMP_DIGITS];
    let chain = &checkpoint[TIMESTAMP_DIGITS..TIMESTAMP_DIGITS + CHAIN_ID_DIGITS];
    let block = &checkpoint[TIMESTAMP_DIGITS + CHAIN_ID_DIGITS
        ..TIMESTAMP_DIGITS + CHAIN_ID_DIGITS + BLOCK_NUMBER_DIGITS];
    format!(
        "{}:{}@{}",
        strip_zeros(chain),
        strip_zeros(block),
        strip_zeros(timestamp)
    )
}

fn strip_zeros(field: &str) -> &str {
    let stripped = field.trim_start_matches('0');
    if stripped.is_empty() {
        "0"
    } else {
        stripped
    }
}

/// Snapshot handed back when a progress log line is due.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub events_per_second: f64,
}

/// Historical-path progress tracker: counts processed events and yields a
/// throughput snapshot each time the count crosses an interval boundary,
/// so batch sizes do not change how often the engine logs.
pub struct IndexingProgress {
    started: Instant,
    interval: u64,
    count: AtomicU64,
}

impl IndexingProgress {
    pub fn new(interval: u64) -> Self {
        Self {
            started: Instant::now(),
            interval: interval.max(1),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, events: u64) -> Option<ProgressSnapshot> {
        if events == 0 {
            return None;
        }
        let before = self.count.fetch_add(events, Ordering::Relaxed);
        let total = before + events;
        if before / self.interval == total / self.interval {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        Some(ProgressSnapshot {
            total,
            events_per_second: total as f64 / elapsed,
        })
    }

    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
