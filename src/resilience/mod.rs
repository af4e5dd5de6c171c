//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to an endpoint:
//!     → bulkhead.rs (admit into the endpoint's pool, bound queue and run time)
//!     → circuit_breaker.rs (fail fast while the endpoint is open)
//!     → retries.rs (retry retriable failures with backoff.rs delays)
//!     → downstream operation
//! ```
//!
//! # Design Decisions
//! - Every primitive is usable on its own; composition is explicit (see `pipeline`)
//! - Timeouts are non-negotiable; every admitted call has a deadline
//! - Retries only when the caller's predicate allows
//! - Circuit breaker prevents cascading failures
//! - Time flows through clock.rs so tests control it

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod retries;

pub use bulkhead::{BulkheadError, BulkheadExecutor, PoolMetrics};
pub use circuit_breaker::{BreakerError, BreakerMetrics, BreakerRegistry, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, TokioClock};
pub use retries::{RetryError, RetryExecutor, RetryMetrics};
