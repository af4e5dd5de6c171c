//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define the sink interface every component reports through
//! - Forward to the `metrics` facade for Prometheus exposition
//! - Expose the Prometheus scrape endpoint
//!
//! # Metrics
//! - `routeguard_requests_total` (counter): outcomes by component, key, outcome
//! - `routeguard_request_duration_seconds` (histogram): call latency by component, key
//! - `routeguard_errors_total` (counter): errors by component, key, kind
//!
//! # Design Decisions
//! - Sinks are injected at construction; components never touch a global recorder
//! - The default sink discards everything
//! - Labels are component (`circuit_breaker`, `retry`, `bulkhead`, `selector`) and key

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Outcome of a guarded call as seen by one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// The call was refused before the operation ran.
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Where components report their counters.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, component: &'static str, key: &str, outcome: Outcome);
    fn record_duration(&self, component: &'static str, key: &str, duration: Duration);
    fn record_error(&self, component: &'static str, key: &str, kind: &'static str);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _component: &'static str, _key: &str, _outcome: Outcome) {}
    fn record_duration(&self, _component: &'static str, _key: &str, _duration: Duration) {}
    fn record_error(&self, _component: &'static str, _key: &str, _kind: &'static str) {}
}

/// Sink that forwards to the process-wide `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, component: &'static str, key: &str, outcome: Outcome) {
        metrics::counter!(
            "routeguard_requests_total",
            "component" => component,
            "key" => key.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
    }

    fn record_duration(&self, component: &'static str, key: &str, duration: Duration) {
        metrics::histogram!(
            "routeguard_request_duration_seconds",
            "component" => component,
            "key" => key.to_string()
        )
        .record(duration.as_secs_f64());
    }

    fn record_error(&self, component: &'static str, key: &str, kind: &'static str) {
        metrics::counter!(
            "routeguard_errors_total",
            "component" => component,
            "key" => key.to_string(),
            "kind" => kind
        )
        .increment(1);
    }
}

/// Shared handle to the default sink.
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}
