//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, delays ordered, weights positive, pool sizes within semaphore capacity)
//! - Check endpoint integrity (unique ids, parsable URLs)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RouteguardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::schema::{PoolConfig, RouteguardConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: String },

    #[error("{field} must be at most {max}, got {value}")]
    TooLarge { field: String, value: u64, max: u64 },

    #[error("retry.max_delay_ms ({max}) is smaller than retry.base_delay_ms ({base})")]
    DelayOrder { base: u64, max: u64 },

    #[error("retry.backoff_multiplier must be a finite number >= 1.0, got {0}")]
    Multiplier(f64),

    #[error("selector.latency_target_ms must be a positive finite number, got {0}")]
    LatencyTarget(f64),

    #[error("endpoint '{id}' has invalid weight {weight}")]
    Weight { id: String, weight: f64 },

    #[error("endpoint '{id}' has invalid url '{url}': {reason}")]
    Url { id: String, url: String, reason: String },

    #[error("endpoint id '{0}' is defined more than once")]
    DuplicateEndpoint(String),

    #[error("endpoint id must not be empty")]
    EmptyEndpointId,

    #[error("observability.log_format must be 'pretty' or 'json', got '{0}'")]
    LogFormat(String),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &RouteguardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let cb = &config.circuit_breaker;
    require_positive(&mut errors, "circuit_breaker.failure_threshold", cb.failure_threshold as u64);
    require_positive(&mut errors, "circuit_breaker.recovery_timeout_ms", cb.recovery_timeout_ms);
    require_positive(&mut errors, "circuit_breaker.monitoring_window_ms", cb.monitoring_window_ms);

    let retry = &config.retry;
    require_positive(&mut errors, "retry.max_attempts", retry.max_attempts as u64);
    if retry.max_delay_ms < retry.base_delay_ms {
        errors.push(ValidationError::DelayOrder {
            base: retry.base_delay_ms,
            max: retry.max_delay_ms,
        });
    }
    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
        errors.push(ValidationError::Multiplier(retry.backoff_multiplier));
    }

    let selector = &config.selector;
    require_positive(&mut errors, "selector.healthy_threshold", selector.healthy_threshold as u64);
    require_positive(&mut errors, "selector.unhealthy_threshold", selector.unhealthy_threshold as u64);
    if !selector.latency_target_ms.is_finite() || selector.latency_target_ms <= 0.0 {
        errors.push(ValidationError::LatencyTarget(selector.latency_target_ms));
    }
    if let Some(interval) = selector.health_check_interval_ms {
        require_positive(&mut errors, "selector.health_check_interval_ms", interval);
    }

    validate_pool(&mut errors, "bulkhead.default_pool", &config.bulkhead.default_pool);
    let mut pool_names: Vec<_> = config.bulkhead.pools.keys().collect();
    pool_names.sort();
    for name in pool_names {
        validate_pool(&mut errors, &format!("bulkhead.pools.{}", name), &config.bulkhead.pools[name]);
    }

    let mut seen = HashSet::new();
    for endpoint in &config.endpoints {
        if endpoint.id.is_empty() {
            errors.push(ValidationError::EmptyEndpointId);
        } else if !seen.insert(endpoint.id.as_str()) {
            errors.push(ValidationError::DuplicateEndpoint(endpoint.id.clone()));
        }
        if !endpoint.weight.is_finite() || endpoint.weight <= 0.0 {
            errors.push(ValidationError::Weight {
                id: endpoint.id.clone(),
                weight: endpoint.weight,
            });
        }
        if let Err(e) = url::Url::parse(&endpoint.url) {
            errors.push(ValidationError::Url {
                id: endpoint.id.clone(),
                url: endpoint.url.clone(),
                reason: e.to_string(),
            });
        }
    }

    let format = config.observability.log_format.as_str();
    if format != "pretty" && format != "json" {
        errors.push(ValidationError::LogFormat(format.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_pool(errors: &mut Vec<ValidationError>, prefix: &str, pool: &PoolConfig) {
    require_positive(errors, &format!("{}.max_concurrency", prefix), pool.max_concurrency as u64);
    if pool.max_concurrency > Semaphore::MAX_PERMITS {
        errors.push(ValidationError::TooLarge {
            field: format!("{}.max_concurrency", prefix),
            value: pool.max_concurrency as u64,
            max: Semaphore::MAX_PERMITS as u64,
        });
    }
    require_positive(errors, &format!("{}.queue_timeout_ms", prefix), pool.queue_timeout_ms);
    require_positive(errors, &format!("{}.execution_timeout_ms", prefix), pool.execution_timeout_ms);
}

fn require_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero { field: field.to_string() });
    }
}
