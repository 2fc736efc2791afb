//! Pipeline metrics
//!
//! Counters and gauges for the bridge, held in a per-broker prometheus
//! registry. Counters are atomic and updated from the ingest loop and the
//! workers; rates and buffer utilization are recomputed by a periodic
//! sampler. Composite state (timestamps, connection flags, previous sample)
//! sits behind a narrow read/write lock so snapshots stay consistent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};
use serde::Serialize;

mod server;

pub use server::HealthServer;

/// Minimum spacing between two rate computations
const MIN_SAMPLE_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    received: u64,
    processed: u64,
    published: u64,
}

#[derive(Debug)]
struct MetricsState {
    start_time: SystemTime,
    started: Instant,
    source_connected: bool,
    sink_connected: bool,
    last_sample: Sample,
}

/// All bridge metrics in one place
pub struct Metrics {
    registry: Registry,

    // Message counters
    pub received: IntCounter,
    pub processed: IntCounter,
    pub published: IntCounter,
    pub failed: IntCounter,
    pub dropped: IntCounter,

    // Error counters
    pub source_errors: IntCounter,
    pub sink_errors: IntCounter,
    pub transform_errors: IntCounter,

    // Sampled gauges
    pub receive_rate: Gauge,
    pub process_rate: Gauge,
    pub publish_rate: Gauge,
    pub buffer_utilization: Gauge,

    /// Workers currently handling a message
    pub active_workers: IntGauge,

    /// Milliseconds since the epoch of the last received message, 0 if none
    last_message_ms: AtomicU64,
    state: RwLock<MetricsState>,
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub published: u64,
    pub failed: u64,
    pub dropped: u64,
    pub source_errors: u64,
    pub sink_errors: u64,
    pub transform_errors: u64,
    pub receive_rate: f64,
    pub process_rate: f64,
    pub publish_rate: f64,
    pub active_workers: i64,
    pub buffer_utilization: f64,
    /// RFC 3339
    pub start_time: String,
    /// RFC 3339, absent until the first message
    pub last_message_time: Option<String>,
    pub uptime_seconds: u64,
    pub source_connected: bool,
    pub sink_connected: bool,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let received = counter(
            &registry,
            "vibebridge_messages_received_total",
            "Messages pulled from the source",
        )?;
        let processed = counter(
            &registry,
            "vibebridge_messages_processed_total",
            "Messages routed and transformed",
        )?;
        let published = counter(
            &registry,
            "vibebridge_messages_published_total",
            "Messages acknowledged by the sink",
        )?;
        let failed = counter(
            &registry,
            "vibebridge_messages_failed_total",
            "Messages dropped by a worker after an error or missing route",
        )?;
        let dropped = counter(
            &registry,
            "vibebridge_messages_dropped_total",
            "Messages dropped because the buffer was full",
        )?;
        let source_errors = counter(
            &registry,
            "vibebridge_source_errors_total",
            "Source connect, subscribe and lost-connection errors",
        )?;
        let sink_errors = counter(
            &registry,
            "vibebridge_sink_errors_total",
            "Sink publish errors, timeouts and lost connections",
        )?;
        let transform_errors = counter(
            &registry,
            "vibebridge_transform_errors_total",
            "Payload transform failures",
        )?;

        let receive_rate = gauge(
            &registry,
            "vibebridge_receive_rate",
            "Messages received per second over the last sample",
        )?;
        let process_rate = gauge(
            &registry,
            "vibebridge_process_rate",
            "Messages processed per second over the last sample",
        )?;
        let publish_rate = gauge(
            &registry,
            "vibebridge_publish_rate",
            "Messages published per second over the last sample",
        )?;
        let buffer_utilization = gauge(
            &registry,
            "vibebridge_buffer_utilization",
            "Fill level of the hand-off buffer (0 to 1)",
        )?;

        let active_workers = IntGauge::with_opts(Opts::new(
            "vibebridge_active_workers",
            "Workers currently handling a message",
        ))?;
        registry.register(Box::new(active_workers.clone()))?;

        let started = Instant::now();
        let state = MetricsState {
            start_time: SystemTime::now(),
            started,
            source_connected: false,
            sink_connected: false,
            last_sample: Sample {
                at: started,
                received: 0,
                processed: 0,
                published: 0,
            },
        };

        Ok(Metrics {
            registry,
            received,
            processed,
            published,
            failed,
            dropped,
            source_errors,
            sink_errors,
            transform_errors,
            receive_rate,
            process_rate,
            publish_rate,
            buffer_utilization,
            active_workers,
            last_message_ms: AtomicU64::new(0),
            state: RwLock::new(state),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // Pipeline helpers

    pub fn message_received(&self) {
        self.received.inc();
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_message_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.dropped.inc();
    }

    pub fn message_processed(&self) {
        self.processed.inc();
    }

    pub fn message_published(&self) {
        self.published.inc();
    }

    pub fn route_missed(&self) {
        self.failed.inc();
    }

    pub fn transform_failed(&self) {
        self.transform_errors.inc();
        self.failed.inc();
    }

    pub fn publish_failed(&self) {
        self.sink_errors.inc();
        self.failed.inc();
    }

    pub fn source_error(&self) {
        self.source_errors.inc();
    }

    pub fn sink_error(&self) {
        self.sink_errors.inc();
    }

    pub fn set_connection_status(&self, source_connected: bool, sink_connected: bool) {
        let mut state = self.state.write();
        state.source_connected = source_connected;
        state.sink_connected = sink_connected;
    }

    /// Both source and sink report connected
    pub fn is_healthy(&self) -> bool {
        let state = self.state.read();
        state.source_connected && state.sink_connected
    }

    /// Instant the metrics were created
    pub fn started_at(&self) -> Instant {
        self.state.read().started
    }

    /// Recompute rates and buffer utilization
    pub fn sample(&self, queue_len: usize, capacity: usize) {
        self.sample_at(Instant::now(), queue_len, capacity);
    }

    /// Like [`Metrics::sample`] with an explicit clock.
    ///
    /// Utilization is always refreshed from the given live values. Rates
    /// are only recomputed once at least a second has passed since the
    /// previous rate sample.
    pub fn sample_at(&self, now: Instant, queue_len: usize, capacity: usize) {
        let utilization = if capacity == 0 {
            0.0
        } else {
            (queue_len as f64 / capacity as f64).clamp(0.0, 1.0)
        };

        let current = Sample {
            at: now,
            received: self.received.get(),
            processed: self.processed.get(),
            published: self.published.get(),
        };

        let mut state = self.state.write();
        self.buffer_utilization.set(utilization);

        let previous = state.last_sample;
        let elapsed = now.saturating_duration_since(previous.at);
        if elapsed < MIN_SAMPLE_SPACING {
            return;
        }

        let secs = elapsed.as_secs_f64();
        let rate = |now: u64, before: u64| now.saturating_sub(before) as f64 / secs;
        self.receive_rate
            .set(rate(current.received, previous.received));
        self.process_rate
            .set(rate(current.processed, previous.processed));
        self.publish_rate
            .set(rate(current.published, previous.published));
        state.last_sample = current;
    }

    fn last_message_time(&self) -> Option<SystemTime> {
        match self.last_message_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Consistent copy of all fields
    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_message_time = self.last_message_time();
        let state = self.state.read();
        MetricsSnapshot {
            received: self.received.get(),
            processed: self.processed.get(),
            published: self.published.get(),
            failed: self.failed.get(),
            dropped: self.dropped.get(),
            source_errors: self.source_errors.get(),
            sink_errors: self.sink_errors.get(),
            transform_errors: self.transform_errors.get(),
            receive_rate: self.receive_rate.get(),
            process_rate: self.process_rate.get(),
            publish_rate: self.publish_rate.get(),
            active_workers: self.active_workers.get(),
            buffer_utilization: self.buffer_utilization.get(),
            start_time: humantime::format_rfc3339_seconds(state.start_time).to_string(),
            last_message_time: last_message_time.map(|t| humantime::format_rfc3339_millis(t).to_string()),
            uptime_seconds: state.started.elapsed().as_secs(),
            source_connected: state.source_connected,
            sink_connected: state.sink_connected,
        }
    }
}
