//! Endpoint health state machine.
//!
//! # States
//! - Healthy: endpoint receives traffic
//! - Unhealthy: endpoint excluded from selection
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on state transition
//! - Transitions are returned to the caller, which logs them

use serde::Serialize;

/// Health of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
}

/// Observed statistics for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct HealthStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Mean latency over every recorded call.
    pub average_latency_ms: f64,
    /// Mean latency over successful calls only.
    pub average_success_latency_ms: f64,
    pub success_rate: f64,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl HealthStats {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Record a successful call. Returns the new status if it changed.
    pub fn record_success(&mut self, latency_ms: f64, healthy_threshold: u32) -> Option<HealthStatus> {
        let latency_ms = sanitize(latency_ms);
        self.total_requests += 1;
        self.success_count += 1;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.total_requests as f64;
        self.average_success_latency_ms +=
            (latency_ms - self.average_success_latency_ms) / self.success_count as f64;
        self.update_rate();
        self.mark_success(healthy_threshold)
    }

    /// Record a failed call. Returns the new status if it changed.
    pub fn record_failure(&mut self, latency_ms: f64, unhealthy_threshold: u32) -> Option<HealthStatus> {
        let latency_ms = sanitize(latency_ms);
        self.total_requests += 1;
        self.failure_count += 1;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.total_requests as f64;
        self.update_rate();
        self.mark_failure(unhealthy_threshold)
    }

    /// Feed a positive signal into the hysteresis counters only.
    pub fn mark_success(&mut self, healthy_threshold: u32) -> Option<HealthStatus> {
        self.consecutive_failures = 0;

        if self.status == HealthStatus::Healthy {
            return None;
        }

        self.consecutive_successes += 1;
        if self.consecutive_successes >= healthy_threshold {
            self.status = HealthStatus::Healthy;
            self.consecutive_successes = 0;
            return Some(HealthStatus::Healthy);
        }
        None
    }

    /// Feed a negative signal into the hysteresis counters only.
    pub fn mark_failure(&mut self, unhealthy_threshold: u32) -> Option<HealthStatus> {
        self.consecutive_successes = 0;

        if self.status == HealthStatus::Unhealthy {
            return None;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= unhealthy_threshold {
            self.status = HealthStatus::Unhealthy;
            self.consecutive_failures = 0;
            return Some(HealthStatus::Unhealthy);
        }
        None
    }

    fn update_rate(&mut self) {
        self.success_rate = self.success_count as f64 / self.total_requests as f64;
    }
}

fn sanitize(latency_ms: f64) -> f64 {
    if latency_ms.is_finite() {
        latency_ms.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis() {
        let mut stats = HealthStats::default();
        assert!(stats.is_healthy());

        assert_eq!(stats.record_failure(10.0, 3), None);
        assert_eq!(stats.record_failure(10.0, 3), None);
        // A single success breaks the streak.
        assert_eq!(stats.record_success(10.0, 2), None);
        assert_eq!(stats.record_failure(10.0, 3), None);
        assert_eq!(stats.record_failure(10.0, 3), None);
        assert_eq!(stats.record_failure(10.0, 3), Some(HealthStatus::Unhealthy));
        assert!(!stats.is_healthy());

        assert_eq!(stats.record_success(10.0, 2), None);
        assert_eq!(stats.record_success(10.0, 2), Some(HealthStatus::Healthy));
        assert!(stats.is_healthy());
    }

    #[test]
    fn test_running_averages() {
        let mut stats = HealthStats::default();
        stats.record_success(100.0, 2);
        stats.record_success(200.0, 2);
        stats.record_failure(600.0, 3);

        assert_eq!(stats.total_requests, 3);
        assert!((stats.average_latency_ms - 300.0).abs() < 1e-9);
        assert!((stats.average_success_latency_ms - 150.0).abs() < 1e-9);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_bad_latency_is_clamped() {
        let mut stats = HealthStats::default();
        stats.record_success(f64::NAN, 2);
        stats.record_success(-5.0, 2);
        assert_eq!(stats.average_latency_ms, 0.0);
    }

    #[test]
    fn test_probe_signals_leave_request_counters() {
        let mut stats = HealthStats::default();
        assert_eq!(stats.mark_failure(1), Some(HealthStatus::Unhealthy));
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.mark_success(1), Some(HealthStatus::Healthy));
    }
}
