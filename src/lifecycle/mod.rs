//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     selector.stop() / CLI signal → trigger → background tasks exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful teardown in the CLI
//! ```
//!
//! # Design Decisions
//! - Background tasks subscribe before they are spawned, so no signal is missed
//! - Teardown order in the CLI: stop traffic, drain bulkhead, stop selector

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
