//! Call-resilience core: circuit breakers, retries, bulkheads and
//! health-weighted endpoint selection.

pub mod config;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod pipeline;
pub mod resilience;

pub use config::schema::RouteguardConfig;
pub use lifecycle::Shutdown;
pub use load_balancer::{Endpoint, EndpointSelector};
pub use pipeline::{CallError, CallPipeline};
