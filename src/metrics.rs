use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Prediction metrics
    pub static ref PREDICTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("predictions_total", "Successful predictions by backend"),
        &["backend"]
    ).unwrap();

    pub static ref PREDICTION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("prediction_failures_total", "Failed diagnosis requests by error kind"),
        &["kind"]
    ).unwrap();

    pub static ref PREDICTION_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "prediction_duration_seconds",
            "End-to-end diagnosis latency in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0])
    ).unwrap();

    // Backend metrics
    pub static ref BACKEND_PROBES: IntCounterVec = IntCounterVec::new(
        Opts::new("backend_probes_total", "Backend probe attempts by backend and outcome"),
        &["backend", "outcome"]
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "prediction_cache_hits_total",
        "Total number of prediction cache hits"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "prediction_cache_misses_total",
        "Total number of prediction cache misses"
    ).unwrap();

    pub static ref CACHE_ENTRIES: IntGauge = IntGauge::new(
        "prediction_cache_entries",
        "Current number of cached predictions"
    ).unwrap();

    // Quota metrics
    pub static ref QUOTA_REJECTIONS: IntCounter = IntCounter::new(
        "guest_quota_rejections_total",
        "Requests rejected because a guest ran out of detections"
    ).unwrap();

    pub static ref QUOTA_TRACKED_IDENTITIES: IntGauge = IntGauge::new(
        "guest_quota_tracked_identities",
        "Guest identities with a live quota record"
    ).unwrap();
}

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(PREDICTIONS.clone()),
        Box::new(PREDICTION_FAILURES.clone()),
        Box::new(PREDICTION_LATENCY.clone()),
        Box::new(BACKEND_PROBES.clone()),
        Box::new(CACHE_HITS.clone()),
        Box::new(CACHE_MISSES.clone()),
        Box::new(CACHE_ENTRIES.clone()),
        Box::new(QUOTA_REJECTIONS.clone()),
        Box::new(QUOTA_TRACKED_IDENTITIES.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => tracing::warn!("Failed to register metric: {}", e),
        }
    }

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Get cache hit rate as a percentage
pub fn cache_hit_rate() -> f64 {
    let hits = CACHE_HITS.get() as f64;
    let misses = CACHE_MISSES.get() as f64;
    let total = hits + misses;

    if total == 0.0 {
        0.0
    } else {
        (hits / total) * 100.0
    }
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
