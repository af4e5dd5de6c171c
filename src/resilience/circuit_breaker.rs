//! Circuit breaker for endpoint protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: endpoint assumed down, requests fail fast
//! - Half-Open: testing if endpoint recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold within window
//! Open → Half-Open: after recovery timeout
//! Half-Open → Closed: probe request succeeds
//! Half-Open → Open: probe request fails
//! ```
//!
//! # Design Decisions
//! - Per-endpoint circuit breaker (not global), see [`BreakerRegistry`]
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open (prevents hammering recovering endpoint)
//! - Fail-fast rejections count as failures in the metrics but never enter
//!   the failure window, so an open breaker cannot keep itself open
//! - Never suspends on its own; only the wrapped operation awaits

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::CircuitBreakerConfig;
use crate::observability::{MetricsSink, Outcome};
use crate::resilience::clock::{Clock, TokioClock};

const COMPONENT: &str = "circuit_breaker";

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker refused the call; the operation never ran.
    #[error("Circuit breaker is OPEN for '{name}', retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Fail-fast rejections, included in `failure_count`.
    pub rejected_count: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    opened_at: Option<Instant>,
    /// Timestamps of failures counted toward the threshold.
    failures: VecDeque<Instant>,
    trial_in_flight: bool,
    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    rejected_count: u64,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            failures: VecDeque::new(),
            trial_in_flight: false,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.failures.clear();
        self.trial_in_flight = false;
    }
}

/// A circuit breaker guarding one failure domain.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.get_state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker using the Tokio clock and no metrics sink.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            core: Mutex::new(BreakerCore::new()),
            clock: Arc::new(TokioClock),
            sink: crate::observability::metrics::noop(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` through the breaker. Every error counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Run `operation` through the breaker, counting only errors for which
    /// `is_failure` returns true. Other errors are returned unchanged and
    /// recorded as successes.
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let is_trial = match self.admit() {
            Ok(is_trial) => is_trial,
            Err(retry_after) => {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                })
            }
        };

        let mut guard = TrialGuard {
            core: &self.core,
            armed: is_trial,
        };
        let started = self.clock.now();
        let result = operation().await;
        guard.armed = false;
        self.sink
            .record_duration(COMPONENT, &self.name, self.clock.now().saturating_duration_since(started));

        match result {
            Ok(value) => {
                self.on_success(is_trial);
                Ok(value)
            }
            Err(e) if is_failure(&e) => {
                self.on_failure(is_trial);
                Err(BreakerError::Inner(e))
            }
            Err(e) => {
                self.on_success(is_trial);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Decide whether a call may proceed. `Ok(true)` marks the half-open trial;
    /// `Err` carries the remaining recovery time.
    fn admit(&self) -> Result<bool, Duration> {
        let now = self.clock.now();
        let mut core = self.lock();

        let rejection = match core.state {
            CircuitState::Closed => return Ok(false),
            CircuitState::Open => {
                let opened_at = core.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                let recovery = self.config.recovery_timeout();
                if elapsed >= recovery {
                    core.state = CircuitState::HalfOpen;
                    core.trial_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                    return Ok(true);
                }
                recovery - elapsed
            }
            CircuitState::HalfOpen => {
                if !core.trial_in_flight {
                    core.trial_in_flight = true;
                    return Ok(true);
                }
                Duration::ZERO
            }
        };

        core.total_requests += 1;
        core.failure_count += 1;
        core.rejected_count += 1;
        drop(core);

        tracing::debug!(breaker = %self.name, retry_after = ?rejection, "Circuit open, failing fast");
        self.sink.record_request(COMPONENT, &self.name, Outcome::Rejected);
        self.sink.record_error(COMPONENT, &self.name, "circuit_open");
        Err(rejection)
    }

    fn on_success(&self, is_trial: bool) {
        let mut core = self.lock();
        core.total_requests += 1;
        core.success_count += 1;
        if is_trial && core.state == CircuitState::HalfOpen {
            core.state = CircuitState::Closed;
            core.opened_at = None;
            core.failures.clear();
            core.trial_in_flight = false;
            tracing::info!(breaker = %self.name, "Trial call succeeded, circuit closed");
        }
        drop(core);
        self.sink.record_request(COMPONENT, &self.name, Outcome::Success);
    }

    fn on_failure(&self, is_trial: bool) {
        self.register_failure(FailureSource::Completed { is_trial });
    }

    /// Count a call this breaker admitted whose future was then dropped by an
    /// outer deadline (for example a bulkhead execution timeout).
    ///
    /// The failure enters the window like any other. If the breaker is
    /// half-open with no trial in flight, the abandoned call was the trial
    /// and the circuit re-opens.
    pub fn record_timeout(&self) {
        tracing::debug!(breaker = %self.name, "Admitted call timed out");
        self.register_failure(FailureSource::TimedOut);
    }

    fn register_failure(&self, source: FailureSource) {
        let now = self.clock.now();
        let window = self.config.monitoring_window();
        let mut core = self.lock();
        core.total_requests += 1;
        core.failure_count += 1;

        let was_trial = match source {
            FailureSource::Completed { is_trial } => is_trial,
            FailureSource::TimedOut => core.state == CircuitState::HalfOpen && !core.trial_in_flight,
        };

        match core.state {
            CircuitState::HalfOpen if was_trial => {
                core.open(now);
                tracing::warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
            }
            CircuitState::Closed => {
                core.failures.push_back(now);
                while let Some(&oldest) = core.failures.front() {
                    if now.saturating_duration_since(oldest) > window {
                        core.failures.pop_front();
                    } else {
                        break;
                    }
                }
                let failures = core.failures.len();
                if failures >= self.config.failure_threshold as usize {
                    core.open(now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures,
                        window = ?window,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            // Late results from calls admitted before a transition.
            _ => {}
        }
        drop(core);
        self.sink.record_request(COMPONENT, &self.name, Outcome::Failure);
        self.sink.record_error(COMPONENT, &self.name, "operation_failed");
    }

    pub fn get_state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn get_metrics(&self) -> BreakerMetrics {
        let core = self.lock();
        let (success_rate, failure_rate) = if core.total_requests > 0 {
            let success_rate = core.success_count as f64 / core.total_requests as f64;
            (success_rate, 1.0 - success_rate)
        } else {
            (0.0, 0.0)
        };
        BreakerMetrics {
            state: core.state,
            total_requests: core.total_requests,
            success_count: core.success_count,
            failure_count: core.failure_count,
            rejected_count: core.rejected_count,
            success_rate,
            failure_rate,
        }
    }

    /// Force the breaker closed and zero every counter.
    pub fn reset(&self) {
        *self.lock() = BreakerCore::new();
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }
}

enum FailureSource {
    /// The operation returned an error through `execute`.
    Completed { is_trial: bool },
    /// The operation's future was dropped by a deadline outside the breaker.
    TimedOut,
}

/// Frees the half-open trial slot if the trial future is dropped mid-flight.
struct TrialGuard<'a> {
    core: &'a Mutex<BreakerCore>,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
            if core.state == CircuitState::HalfOpen {
                core.trial_in_flight = false;
            }
        }
    }
}

/// Breakers keyed by failure domain, sharing one configuration.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            clock: Arc::new(TokioClock),
            sink: crate::observability::metrics::noop(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The breaker for `key`, created closed on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return breaker.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(key, self.config.clone())
                        .with_clock(self.clock.clone())
                        .with_metrics(self.sink.clone()),
                )
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| b.clone())
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    /// Metrics for every breaker, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, BreakerMetrics)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get_metrics()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
