//! Prometheus metrics for the client.
//!
//! The hot path emits exactly one metric: a histogram of per-operation
//! latency labeled by method name and by success. Everything is registered
//! to a custom registry with the `memcachesque` prefix to avoid name
//! collisions with other libraries using the default Prometheus registry,
//! and registration errors fall back to an unregistered metric instead of
//! panicking.
//!
//! Emission goes through the [`MetricSink`] trait: the default
//! construction wires the prometheus-backed sink, `disable_diagnostics`
//! wires [`NoopSink`], and tests may inject their own.

use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};
use tracing::warn;

const METHOD_NAME_LABEL: &str = "method_name";
const IS_SUCCESSFUL_LABEL: &str = "is_successful";

/// Custom Prometheus registry for client metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("memcachesque".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Execution time of successful and failed client methods.
pub static METHOD_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec_safe(
        &REGISTRY,
        "method_duration_seconds",
        "counts the execution time of successful and failed client methods",
        &[METHOD_NAME_LABEL, IS_SUCCESSFUL_LABEL],
        vec![0.0005, 0.001, 0.005, 0.007, 0.015, 0.05, 0.1, 0.2, 0.5, 1.0],
    )
});

/// Register a HistogramVec safely, returning an unregistered fallback on
/// error instead of panicking.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Destination for the per-operation latency observation.
pub trait MetricSink: Send + Sync {
    /// Record one completed method call.
    fn observe_method(&self, method: &'static str, duration_secs: f64, success: bool);
}

/// The default sink, backed by [`METHOD_DURATION_SECONDS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl MetricSink for PrometheusSink {
    fn observe_method(&self, method: &'static str, duration_secs: f64, success: bool) {
        let flag = if success { "1" } else { "0" };
        METHOD_DURATION_SECONDS
            .with_label_values(&[method, flag])
            .observe(duration_secs);
    }
}

/// Sink that discards every observation; wired when diagnostics are
/// disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn observe_method(&self, _method: &'static str, _duration_secs: f64, _success: bool) {}
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_prometheus_sink_observes() {
        let sink = PrometheusSink;
        sink.observe_method("Get", 0.002, true);
        sink.observe_method("Get", 0.3, false);

        let text = encode_metrics().unwrap();
        assert!(text.contains("memcachesque_method_duration_seconds"));
        assert!(text.contains("method_name=\"Get\""));
        assert!(text.contains("is_successful=\"1\""));
        assert!(text.contains("is_successful=\"0\""));
    }

    #[test]
    fn test_noop_sink_is_silent() {
        // Just verify it doesn't panic; nothing is recorded anywhere.
        NoopSink.observe_method("Set", 1.0, true);
    }

    #[test]
    fn test_custom_sink_injection() {
        #[derive(Default)]
        struct Recording(Mutex<Vec<(&'static str, bool)>>);
        impl MetricSink for Recording {
            fn observe_method(&self, method: &'static str, _secs: f64, success: bool) {
                self.0.lock().unwrap().push((method, success));
            }
        }

        let sink = Recording::default();
        sink.observe_method("MultiGet", 0.001, true);
        sink.observe_method("Delete", 0.001, false);

        let seen = sink.0.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("MultiGet", true), ("Delete", false)]);
    }

    #[test]
    fn test_bucket_edges_match_contract() {
        // Dashboards depend on these exact edges.
        let expected = [0.0005, 0.001, 0.005, 0.007, 0.015, 0.05, 0.1, 0.2, 0.5, 1.0];
        PrometheusSink.observe_method("bucket_probe", 0.004, true);
        let text = encode_metrics().unwrap();
        for edge in expected {
            assert!(
                text.contains(&format!("le=\"{edge}\"")),
                "missing bucket edge {edge}"
            );
        }
    }
}
