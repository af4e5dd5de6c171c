//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! resilience core. All types derive Serde traits for deserialization from
//! TOML files, and every section falls back to the documented defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteguardConfig {
    /// Settings shared by every per-endpoint circuit breaker.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry policy for downstream calls.
    pub retry: RetryConfig,

    /// Health-weighted endpoint selection.
    pub selector: SelectorConfig,

    /// Concurrency pools.
    pub bulkhead: BulkheadConfig,

    /// Downstream endpoints.
    pub endpoints: Vec<EndpointConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring window required to open the circuit.
    pub failure_threshold: u32,

    /// Time an open circuit waits before allowing a trial call, in milliseconds.
    pub recovery_timeout_ms: u64,

    /// Window over which failures are counted, in milliseconds.
    pub monitoring_window_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            monitoring_window_ms: 60_000,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one. 1 disables retries.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,

    /// Scale each delay by a random factor in [0.5, 1.0].
    pub jitter: bool,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Endpoint selector configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Consecutive successes before an unhealthy endpoint is healthy again.
    pub healthy_threshold: u32,

    /// Consecutive failures before an endpoint is marked unhealthy.
    pub unhealthy_threshold: u32,

    /// Mean success latency at or below which an endpoint is not penalised, in milliseconds.
    pub latency_target_ms: f64,

    /// Period of the background health re-evaluation. `None` disables it.
    pub health_check_interval_ms: Option<u64>,
}

impl SelectorConfig {
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms.map(Duration::from_millis)
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            latency_target_ms: 1000.0,
            health_check_interval_ms: None,
        }
    }
}

/// Limits for a single bulkhead pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Operations allowed to run at once.
    pub max_concurrency: usize,

    /// Longest a caller may wait for a slot, in milliseconds.
    pub queue_timeout_ms: u64,

    /// Longest an admitted operation may run, in milliseconds.
    pub execution_timeout_ms: u64,

    /// Maximum number of waiting callers. `None` means unbounded.
    pub max_queue: Option<usize>,
}

impl PoolConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_timeout_ms: 5_000,
            execution_timeout_ms: 30_000,
            max_queue: None,
        }
    }
}

/// Bulkhead configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Limits for pools without an explicit entry in `pools`.
    pub default_pool: PoolConfig,

    /// Per-pool overrides keyed by pool name.
    pub pools: HashMap<String, PoolConfig>,
}

impl BulkheadConfig {
    /// Limits that apply to the named pool.
    pub fn pool(&self, name: &str) -> &PoolConfig {
        self.pools.get(name).unwrap_or(&self.default_pool)
    }
}

/// Downstream endpoint definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Unique endpoint identifier; also the breaker and pool key.
    pub id: String,

    /// Endpoint URL.
    pub url: String,

    /// Relative selection weight (default: 1.0).
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    pub log_format: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RouteguardConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.selector.unhealthy_threshold, 3);
        assert_eq!(config.bulkhead.default_pool.max_concurrency, 10);
        assert!(config.endpoints.is_empty());
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: RouteguardConfig = toml::from_str(
            r#"
            [retry]
            max_attempts = 5
            jitter = false

            [bulkhead.pools.gpu-a]
            max_concurrency = 2

            [[endpoints]]
            id = "gpu-a"
            url = "http://10.0.0.1:8000"
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.bulkhead.pool("gpu-a").max_concurrency, 2);
        assert_eq!(config.bulkhead.pool("gpu-a").queue_timeout_ms, 5_000);
        assert_eq!(config.bulkhead.pool("other").max_concurrency, 10);
        assert_eq!(config.endpoints[0].weight, 1.0);
    }
}
