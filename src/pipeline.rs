//! Guarded call composition.
//!
//! # Data Flow
//! ```text
//! call(endpoints, op, is_retriable)
//!     → EndpointSelector picks a healthy endpoint
//!     → BulkheadExecutor admits into the endpoint's pool
//!     → CircuitBreaker for the endpoint (fails fast while open)
//!     → RetryExecutor retries retriable failures
//!     → op(endpoint)
//!     → outcome + latency recorded back into the selector
//! ```
//!
//! # Design Decisions
//! - One pool and one breaker per endpoint id, so a failing endpoint only
//!   degrades its own share of traffic
//! - The breaker sees one outcome per retry sequence, not per attempt;
//!   an execution timeout is reported to it as a failure
//! - Local refusals (open circuit, full or slow queue, shutdown) are not fed
//!   back into endpoint health; the endpoint was never called

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::RouteguardConfig;
use crate::load_balancer::{Endpoint, EndpointSelector};
use crate::observability::{MetricsSink, Outcome};
use crate::resilience::{
    BreakerError, BreakerRegistry, BulkheadError, BulkheadExecutor, Clock, RetryError, RetryExecutor,
    TokioClock,
};

const COMPONENT: &str = "pipeline";

/// Every way a guarded call can fail.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    #[error("circuit open for endpoint '{endpoint}', retry after {retry_after:?}")]
    CircuitOpen { endpoint: String, retry_after: Duration },

    #[error("endpoint '{endpoint}' queue timeout after {waited:?}")]
    QueueTimeout { endpoint: String, waited: Duration },

    #[error("endpoint '{endpoint}' call timed out after {timeout:?}")]
    ExecutionTimeout { endpoint: String, timeout: Duration },

    #[error("endpoint '{endpoint}' queue is full")]
    QueueFull { endpoint: String },

    #[error("pipeline is shut down")]
    ShutDown,

    #[error("endpoint '{endpoint}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: E,
    },

    #[error("{0}")]
    Operation(E),
}

impl<E> CallError<E> {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::NoHealthyEndpoint => "no_healthy_endpoint",
            CallError::CircuitOpen { .. } => "circuit_open",
            CallError::QueueTimeout { .. } => "queue_timeout",
            CallError::ExecutionTimeout { .. } => "execution_timeout",
            CallError::QueueFull { .. } => "queue_full",
            CallError::ShutDown => "shut_down",
            CallError::RetriesExhausted { .. } => "retries_exhausted",
            CallError::Operation(_) => "operation",
        }
    }

    /// Whether the endpoint itself was called and misbehaved.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            CallError::ExecutionTimeout { .. } | CallError::RetriesExhausted { .. } | CallError::Operation(_)
        )
    }

    /// The operation's own error, if it ran and failed.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CallError::RetriesExhausted { last_error, .. } => Some(last_error),
            CallError::Operation(e) => Some(e),
            _ => None,
        }
    }

    fn from_layers(endpoint: &str, error: BulkheadError<BreakerError<RetryError<E>>>) -> Self {
        match error {
            BulkheadError::QueueTimeout { waited, .. } => CallError::QueueTimeout {
                endpoint: endpoint.to_string(),
                waited,
            },
            BulkheadError::ExecutionTimeout { timeout, .. } => CallError::ExecutionTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            },
            BulkheadError::QueueFull { .. } => CallError::QueueFull {
                endpoint: endpoint.to_string(),
            },
            BulkheadError::ShutDown { .. } => CallError::ShutDown,
            BulkheadError::Inner(BreakerError::Open { retry_after, .. }) => CallError::CircuitOpen {
                endpoint: endpoint.to_string(),
                retry_after,
            },
            BulkheadError::Inner(BreakerError::Inner(RetryError::Exhausted { attempts, last_error })) => {
                CallError::RetriesExhausted {
                    endpoint: endpoint.to_string(),
                    attempts,
                    last_error,
                }
            }
            BulkheadError::Inner(BreakerError::Inner(RetryError::NonRetriable(e))) => CallError::Operation(e),
        }
    }
}

/// Selector, bulkhead, breakers and retry wired together.
pub struct CallPipeline {
    selector: EndpointSelector,
    breakers: BreakerRegistry,
    bulkhead: BulkheadExecutor,
    retry: RetryExecutor,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
}

impl fmt::Debug for CallPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPipeline")
            .field("selector", &self.selector)
            .field("bulkhead", &self.bulkhead)
            .field("retry", &self.retry)
            .finish()
    }
}

impl CallPipeline {
    /// Pipeline on the tokio clock with metrics discarded.
    pub fn from_config(config: &RouteguardConfig) -> Self {
        Self::new(config, Arc::new(TokioClock), crate::observability::metrics::noop())
    }

    pub fn new(config: &RouteguardConfig, clock: Arc<dyn Clock>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            selector: EndpointSelector::new(config.selector.clone()).with_metrics(sink.clone()),
            breakers: BreakerRegistry::new(config.circuit_breaker.clone())
                .with_clock(clock.clone())
                .with_metrics(sink.clone()),
            bulkhead: BulkheadExecutor::new(config.bulkhead.clone()).with_metrics(sink.clone()),
            retry: RetryExecutor::new(config.retry.clone())
                .with_name(COMPONENT)
                .with_clock(clock.clone())
                .with_metrics(sink.clone()),
            clock,
            sink,
        }
    }

    /// Run `operation` against one endpoint chosen from `endpoints`.
    ///
    /// `operation` is called once per attempt with the chosen endpoint.
    /// `is_retriable` decides whether a failed attempt is tried again.
    pub async fn call<F, Fut, T, E, P>(
        &self,
        endpoints: &[Endpoint],
        mut operation: F,
        is_retriable: P,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        // The selector reports the miss to the sink.
        let Some(endpoint) = self.selector.select_endpoint(endpoints) else {
            return Err(CallError::NoHealthyEndpoint);
        };

        let breaker_handle = self.breakers.get_or_create(&endpoint.id);
        let breaker = &*breaker_handle;
        let retry = &self.retry;
        let is_retriable = &is_retriable;
        let operation = &mut operation;

        let started = self.clock.now();
        let result = self
            .bulkhead
            .execute(&endpoint.id, move || {
                breaker.execute(move || retry.execute(move || operation(endpoint.clone()), is_retriable))
            })
            .await;
        let elapsed = self.clock.now().saturating_duration_since(started);
        let latency_ms = elapsed.as_secs_f64() * 1000.0;

        match result {
            Ok(value) => {
                self.selector.record_success(&endpoint.id, latency_ms);
                self.sink.record_request(COMPONENT, &endpoint.id, Outcome::Success);
                self.sink.record_duration(COMPONENT, &endpoint.id, elapsed);
                Ok(value)
            }
            Err(error) => {
                let error = CallError::from_layers(&endpoint.id, error);
                if matches!(error, CallError::ExecutionTimeout { .. }) {
                    // The deadline dropped the breaker's future before it saw an outcome.
                    breaker_handle.record_timeout();
                }
                if error.is_endpoint_failure() {
                    self.selector.record_failure(&endpoint.id, latency_ms);
                    self.sink.record_request(COMPONENT, &endpoint.id, Outcome::Failure);
                    self.sink.record_duration(COMPONENT, &endpoint.id, elapsed);
                } else {
                    self.sink.record_request(COMPONENT, &endpoint.id, Outcome::Rejected);
                }
                self.sink.record_error(COMPONENT, &endpoint.id, error.kind());
                tracing::debug!(endpoint = %endpoint.id, kind = error.kind(), "Guarded call failed");
                Err(error)
            }
        }
    }

    pub fn selector(&self) -> &EndpointSelector {
        &self.selector
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn bulkhead(&self) -> &BulkheadExecutor {
        &self.bulkhead
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Stop health checks, refuse new calls and wait for in-flight ones.
    pub async fn shutdown(&self) {
        self.selector.stop();
        self.bulkhead.shutdown().await;
        tracing::info!("Call pipeline shut down");
    }
}
