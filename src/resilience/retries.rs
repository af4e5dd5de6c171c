//! Retry logic.
//!
//! # Responsibilities
//! - Ask the caller whether a failure is worth retrying
//! - Execute retries with exponential backoff + jitter
//! - Keep aggregate counters across every call
//!
//! # Design Decisions
//! - The caller's predicate decides retriability; nothing is retried implicitly
//! - Jittered backoff prevents thundering herd
//! - A non-retriable error short-circuits without sleeping
//! - Sleeps go through the injected clock so delays are testable
//! - Cancelling the returned future (timeout, select) unwinds at the current
//!   attempt or sleep; counters are only written once an outcome is decided

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::config::RetryConfig;
use crate::observability::{MetricsSink, Outcome};
use crate::resilience::backoff::next_delay;
use crate::resilience::clock::{Clock, TokioClock};

const COMPONENT: &str = "retry";

/// Error returned by [`RetryExecutor::execute`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The predicate rejected the error; returned as-is from that attempt.
    #[error("{0}")]
    NonRetriable(E),

    /// Every attempt failed; carries the error from the final attempt.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    /// The underlying operation error.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::NonRetriable(e) => e,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::NonRetriable(e) => e,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Aggregate counters across all calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    /// One per `execute` call.
    pub total_executions: u64,
    /// Attempts beyond the first.
    pub total_retries: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
}

/// Runs operations with bounded retries and backoff.
pub struct RetryExecutor {
    name: String,
    config: RetryConfig,
    metrics: Mutex<RetryMetrics>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            name: "default".to_string(),
            config,
            metrics: Mutex::new(RetryMetrics::default()),
            clock: Arc::new(TokioClock),
            sink: crate::observability::metrics::noop(),
        }
    }

    /// Label used in logs and metrics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, `is_retriable` rejects its error,
    /// or `max_attempts` is reached.
    pub async fn execute<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        is_retriable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    self.finish(Outcome::Success, attempt - 1);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retriable(&error) {
                self.finish(Outcome::Failure, attempt - 1);
                self.sink.record_error(COMPONENT, &self.name, "non_retriable");
                tracing::debug!(retry = %self.name, attempt, "Non-retriable error, giving up");
                return Err(RetryError::NonRetriable(error));
            }

            if attempt >= max_attempts {
                self.finish(Outcome::Failure, attempt - 1);
                self.sink.record_error(COMPONENT, &self.name, "retries_exhausted");
                tracing::warn!(retry = %self.name, attempts = attempt, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = next_delay(attempt, &self.config);
            tracing::info!(retry = %self.name, attempt, delay = ?delay, "Retrying operation");
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    fn finish(&self, outcome: Outcome, retries: u32) {
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            metrics.total_executions += 1;
            metrics.total_retries += retries as u64;
            match outcome {
                Outcome::Success => metrics.successful_executions += 1,
                _ => metrics.failed_executions += 1,
            }
        }
        self.sink.record_request(COMPONENT, &self.name, outcome);
    }

    pub fn get_metrics(&self) -> RetryMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = RetryMetrics::default();
    }
}
