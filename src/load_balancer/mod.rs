//! Endpoint selection subsystem.
//!
//! # Data Flow
//! ```text
//! Caller supplies endpoints
//!     → weighted.rs (drop unhealthy, adjust weights by performance)
//!     → weighted random draw
//!     → backend.rs Endpoint handed back to the caller
//! ```
//!
//! # Design Decisions
//! - Endpoints are caller-owned; the selector only keeps statistics by id
//! - Unhealthy endpoints excluded from selection
//! - Selection is synchronous and never waits on the health monitor

pub mod backend;
pub mod weighted;

pub use backend::Endpoint;
pub use weighted::EndpointSelector;
