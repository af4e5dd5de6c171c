//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Breaker / retry / bulkhead / selector:
//!     → tracing macros (structured log events)
//!     → MetricsSink (requests, durations, errors)
//!
//! Consumers:
//!     → stdout (fmt or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging with per-key fields (breaker, pool, endpoint)
//! - Metrics sinks are injected, never global
//! - Shipping logs and metrics elsewhere is left to the host process

pub mod logging;
pub mod metrics;

pub use metrics::{MetricsSink, NoopMetrics, Outcome, PrometheusMetrics};
