//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RouteguardConfig (validated, immutable)
//!     → handed to each component constructor
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; components copy the section they need
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BulkheadConfig, CircuitBreakerConfig, EndpointConfig, ObservabilityConfig, PoolConfig,
    RetryConfig, RouteguardConfig, SelectorConfig,
};
pub use validation::ValidationError;
