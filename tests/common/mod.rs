//! Shared utilities for integration and load testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use routeguard::config::{EndpointConfig, RouteguardConfig};
use routeguard::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamError {
    #[error("{0} unavailable")]
    Unavailable(String),
    #[allow(dead_code)]
    #[error("bad request")]
    BadRequest,
}

pub fn is_retriable(e: &DownstreamError) -> bool {
    matches!(e, DownstreamError::Unavailable(_))
}

/// Config with deterministic retries and the given `(id, weight)` endpoints.
pub fn config_with(endpoints: &[(&str, f64)]) -> RouteguardConfig {
    let mut config = RouteguardConfig::default();
    config.retry.jitter = false;
    config.endpoints = endpoints
        .iter()
        .enumerate()
        .map(|(i, (id, weight))| EndpointConfig {
            id: id.to_string(),
            url: format!("http://127.0.0.1:{}", 28100 + i),
            weight: *weight,
        })
        .collect();
    config
}

pub fn endpoints(config: &RouteguardConfig) -> Vec<Endpoint> {
    Endpoint::from_configs(&config.endpoints).unwrap()
}

#[derive(Debug, Default)]
struct EndpointState {
    failing: AtomicBool,
    /// Fail this many upcoming calls, then recover.
    fail_next: AtomicU32,
    calls: AtomicU32,
}

/// Programmable in-process downstream.
#[derive(Debug)]
pub struct MockDownstream {
    endpoints: HashMap<String, EndpointState>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl MockDownstream {
    pub fn new(ids: &[&str], latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoints: ids.iter().map(|id| (id.to_string(), EndpointState::default())).collect(),
            latency,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    fn state(&self, id: &str) -> &EndpointState {
        self.endpoints
            .get(id)
            .unwrap_or_else(|| panic!("unknown endpoint {}", id))
    }

    pub fn set_failing(&self, id: &str, failing: bool) {
        self.state(id).failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, id: &str, n: u32) {
        self.state(id).fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self, id: &str) -> u32 {
        self.state(id).calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub async fn call(self: Arc<Self>, endpoint: Endpoint) -> Result<String, DownstreamError> {
        let state = self.state(&endpoint.id);
        state.calls.fetch_add(1, Ordering::SeqCst);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || state.failing.load(Ordering::SeqCst) {
            Err(DownstreamError::Unavailable(endpoint.id))
        } else {
            Ok(endpoint.id)
        }
    }
}
