use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Work discovery
    pub static ref CASES_DISCOVERED: IntCounter = IntCounter::new(
        "cases_discovered_total",
        "Total number of cases found in input directories"
    ).expect("valid metric");

    pub static ref CASES_SKIPPED: IntCounter = IntCounter::new(
        "cases_skipped_total",
        "Total number of cases skipped because their outputs already exist"
    ).expect("valid metric");

    pub static ref CASES_PREDICTED: IntCounter = IntCounter::new(
        "cases_predicted_total",
        "Total number of cases run through the ensemble"
    ).expect("valid metric");

    // Inference
    pub static ref ENSEMBLE_LOADS: IntCounter = IntCounter::new(
        "ensemble_loads_total",
        "Total number of times the fold ensemble was brought up"
    ).expect("valid metric");

    pub static ref FOLD_INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "fold_inference_duration_seconds",
            "Sliding-window inference latency of one fold on one case in seconds"
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0])
    ).expect("valid metric");

    pub static ref VOLUMES_SPILLED: IntCounter = IntCounter::new(
        "volumes_spilled_total",
        "Total number of volumes written to scratch storage"
    ).expect("valid metric");

    // Export
    pub static ref EXPORTS_IN_FLIGHT: IntGauge = IntGauge::new(
        "exports_in_flight",
        "Current number of running export tasks"
    ).expect("valid metric");

    pub static ref EXPORTS_COMPLETED: IntCounter = IntCounter::new(
        "exports_completed_total",
        "Total number of label maps written"
    ).expect("valid metric");

    pub static ref PIPELINE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("pipeline_errors_total", "Total number of fatal pipeline errors by kind"),
        &["kind"]
    ).expect("valid metric");
}

/// Initialize metrics registry
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CASES_DISCOVERED.clone()),
        Box::new(CASES_SKIPPED.clone()),
        Box::new(CASES_PREDICTED.clone()),
        Box::new(ENSEMBLE_LOADS.clone()),
        Box::new(FOLD_INFERENCE_LATENCY.clone()),
        Box::new(VOLUMES_SPILLED.clone()),
        Box::new(EXPORTS_IN_FLIGHT.clone()),
        Box::new(EXPORTS_COMPLETED.clone()),
        Box::new(PIPELINE_ERRORS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::warn!("Skipping metric registration: {}", e);
        }
    }

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
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
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
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
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_metrics() {
        init_metrics();
        // Second call only logs the duplicate registrations
        init_metrics();
        CASES_DISCOVERED.inc();

        let text = export_metrics();
        assert!(text.contains("cases_discovered_total"));
    }
}
