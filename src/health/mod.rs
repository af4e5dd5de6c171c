//! Health tracking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive (load_balancer::weighted):
//!     Call outcome recorded
//!     → state.rs updates counters, latency means, hysteresis
//!
//! Active (active.rs):
//!     Periodic timer
//!     → HealthSource snapshot
//!     → state.rs hysteresis only
//!
//! State machine (state.rs):
//!     Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Active and passive signals are complementary
//! - State transitions require consecutive successes/failures
//! - Health state is per-endpoint, owned by the selector

pub mod active;
pub mod state;

pub use active::{HealthMonitor, HealthSource, ProbeReport};
pub use state::{HealthStats, HealthStatus};
