//! Prometheus metrics registry (SPEC_FULL.md §10.6), feature-gated behind
//! `metrics`. Grounded in the teacher's `LazyLock<CounterVec>` pattern
//! (`dashflow-streaming::rate_limiter`'s `RATE_LIMIT_EXCEEDED`/`RATE_LIMIT_ALLOWED`
//! statics), generalized into an owned, injectable registry rather than
//! process-global statics, so tests can construct independent instances.

#![cfg(feature = "metrics")]

use prometheus::{CounterVec, Gauge, GaugeVec, HistogramVec, Opts, Registry};

/// Caps per-route cardinality: unrecognized paths are normalized away from
/// raw path segments (which could otherwise be attacker-controlled, e.g.
/// `/pipelines/<arbitrary-name>`) before being used as a metric label.
pub fn normalize_path_label(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        if segment.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
            out.push_str(segment);
        } else {
            out.push(':');
            out.push_str(&segment.len().to_string());
        }
    }
    if out.is_empty() {
        "/".to_string()
    } else {
        out
    }
}

/// Owned Prometheus registry with the counters/histograms/gauges named in
/// SPEC_FULL.md §10.6.
pub struct ConstellationMetrics {
    pub registry: Registry,
    pub http_requests_total: CounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub module_invocations_total: CounterVec,
    pub module_duration_seconds: HistogramVec,
    pub execution_events_dropped_total: CounterVec,
    pub cache_size: GaugeVec,
    pub canary_weight: GaugeVec,
    pub active_executions: Gauge,
}

impl ConstellationMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("constellation_http_requests_total", "Total HTTP requests handled"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "constellation_http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["method", "path"],
        )?;
        let module_invocations_total = CounterVec::new(
            Opts::new("constellation_module_invocations_total", "Total module invocations"),
            &["module", "outcome"],
        )?;
        let module_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "constellation_module_duration_seconds",
                "Module invocation latency in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["module"],
        )?;
        let execution_events_dropped_total = CounterVec::new(
            Opts::new(
                "constellation_execution_events_dropped_total",
                "Execution lifecycle events dropped due to slow stream subscribers",
            ),
            &["reason"],
        )?;
        let cache_size = GaugeVec::new(
            Opts::new("constellation_cache_size", "Current entry count per cache backend"),
            &["backend"],
        )?;
        let canary_weight = GaugeVec::new(
            Opts::new("constellation_canary_weight", "Current canary traffic weight per pipeline"),
            &["pipeline"],
        )?;
        let active_executions = Gauge::new("constellation_active_executions", "Executions currently running")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(module_invocations_total.clone()))?;
        registry.register(Box::new(module_duration_seconds.clone()))?;
        registry.register(Box::new(execution_events_dropped_total.clone()))?;
        registry.register(Box::new(cache_size.clone()))?;
        registry.register(Box::new(canary_weight.clone()))?;
        registry.register(Box::new(active_executions.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            module_invocations_total,
            module_duration_seconds,
            execution_events_dropped_total,
            cache_size,
            canary_weight,
            active_executions,
        })
    }

    /// Render in Prometheus text exposition format.
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ConstellationMetrics {
    fn default() -> Self {
        Self::new().expect("metric registration with fixed, non-conflicting names cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_label_keeps_alpha_segments_and_masks_others() {
        assert_eq!(normalize_path_label("/pipelines/list"), "/pipelines/list");
        assert_eq!(normalize_path_label("/pipelines/abc123"), "/pipelines/:7");
    }

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = ConstellationMetrics::new().unwrap();
        metrics.http_requests_total.with_label_values(&["GET", "/health", "200"]).inc();
        let rendered = metrics.render();
        assert!(rendered.contains("constellation_http_requests_total"));
    }
}
