//! Prometheus metrics for the agent RPC layer.
//!
//! All metrics follow the naming convention: `km_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: call outcomes, inbound frame classifications, transport events
//! - **Gauge**: requests currently awaiting a reply
//! - **Histogram**: call latency

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Completed calls by outcome
    pub static ref CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("km_rpc_calls_total", "Completed RPC calls by outcome"),
        // outcome: success/remote_error/timeout/transport_lost/send_failed/unavailable/...
        &["outcome"]
    ).expect("metric creation failed");

    /// Time from registration to outcome
    pub static ref CALL_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "km_rpc_call_duration_seconds",
            "Time between sending a request and observing its outcome"
        ).buckets(exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed"))
    ).expect("metric creation failed");

    /// Requests awaiting a reply
    pub static ref PENDING_REQUESTS: IntGauge = IntGauge::new(
        "km_rpc_pending_requests",
        "Number of requests currently awaiting a reply"
    ).expect("metric creation failed");

    /// Inbound frames by dispatch classification
    pub static ref INBOUND_FRAMES: CounterVec = CounterVec::new(
        Opts::new("km_rpc_inbound_frames_total", "Inbound frames by dispatch classification"),
        // classification: resolved/late_reply/event/unhandled/malformed
        &["classification"]
    ).expect("metric creation failed");

    /// Transport lifecycle events
    pub static ref TRANSPORT_EVENTS: CounterVec = CounterVec::new(
        Opts::new("km_transport_events_total", "Transport lifecycle events"),
        // transport: queue/socket, event: connected/disconnected/unavailable/reconnect_attempt
        &["transport", "event"]
    ).expect("metric creation failed");
}

/// Handle proving the metrics were registered.
pub struct MetricsHandle {
    registry: Registry,
}

impl MetricsHandle {
    /// The registry holding every metric of this crate.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CALLS_TOTAL.clone()),
        Box::new(CALL_DURATION.clone()),
        Box::new(PENDING_REQUESTS.clone()),
        Box::new(INBOUND_FRAMES.clone()),
        Box::new(TRANSPORT_EVENTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        registry: REGISTRY.clone(),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }

    /// Time elapsed since the timer started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
