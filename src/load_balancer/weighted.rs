//! Health-weighted random endpoint selection.
//!
//! Each endpoint's base weight is scaled by a performance multiplier derived
//! from its recorded outcomes:
//!
//! ```text
//! score          = (successes - failures) / (total + 10)        in (-1, 1)
//! success_factor = 1 + 0.5 * score                              in (0.5, 1.5)
//! latency_factor = 1                    if mean success latency <= target
//!                = max(0.5, target / mean)  otherwise
//! multiplier     = clamp(success_factor * latency_factor, 0.25, 1.5)
//! ```
//!
//! The prior of 10 samples keeps a handful of early results from swinging the
//! weight. A success at or below the latency target never lowers the
//! multiplier and a failure never raises it, since failures do not feed the
//! success-latency mean.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::SelectorConfig;
use crate::health::active::{HealthMonitor, HealthSource};
use crate::health::state::{HealthStats, HealthStatus};
use crate::lifecycle::Shutdown;
use crate::load_balancer::backend::Endpoint;
use crate::observability::{MetricsSink, Outcome};

const COMPONENT: &str = "selector";

const SAMPLE_PRIOR: f64 = 10.0;
const MAX_SUCCESS_SWING: f64 = 0.5;
const MIN_LATENCY_FACTOR: f64 = 0.5;
const MIN_MULTIPLIER: f64 = 0.25;
const MAX_MULTIPLIER: f64 = 1.5;

/// Performance multiplier for an endpoint's statistics.
pub fn performance_multiplier(stats: &HealthStats, latency_target_ms: f64) -> f64 {
    if stats.total_requests == 0 {
        return 1.0;
    }

    let total = stats.total_requests as f64;
    let score = (stats.success_count as f64 - stats.failure_count as f64) / (total + SAMPLE_PRIOR);
    let success_factor = 1.0 + MAX_SUCCESS_SWING * score;

    let mean = stats.average_success_latency_ms;
    let latency_factor = if stats.success_count == 0 || mean <= latency_target_ms {
        1.0
    } else {
        (latency_target_ms / mean).max(MIN_LATENCY_FACTOR)
    };

    (success_factor * latency_factor).clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
}

struct SelectorInner {
    config: SelectorConfig,
    stats: DashMap<String, HealthStats>,
    stopped: AtomicBool,
    shutdown: Shutdown,
}

/// Picks a healthy endpoint with probability proportional to its adjusted weight.
///
/// Cloning is cheap and every clone shares the same statistics.
#[derive(Clone)]
pub struct EndpointSelector {
    inner: Arc<SelectorInner>,
    sink: Arc<dyn MetricsSink>,
}

impl fmt::Debug for EndpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSelector")
            .field("config", &self.inner.config)
            .field("endpoints", &self.inner.stats.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl EndpointSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                config,
                stats: DashMap::new(),
                stopped: AtomicBool::new(false),
                shutdown: Shutdown::new(),
            }),
            sink: crate::observability::metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.inner.config
    }

    /// Pick an endpoint using the thread-local RNG.
    pub fn select_endpoint<'a>(&self, endpoints: &'a [Endpoint]) -> Option<&'a Endpoint> {
        self.select_endpoint_with(endpoints, &mut rand::thread_rng())
    }

    /// Pick an endpoint using `rng`. Returns `None` when no endpoint is
    /// healthy with a positive adjusted weight.
    pub fn select_endpoint_with<'a, R: Rng + ?Sized>(
        &self,
        endpoints: &'a [Endpoint],
        rng: &mut R,
    ) -> Option<&'a Endpoint> {
        let mut candidates: Vec<(&Endpoint, f64)> = endpoints
            .iter()
            .filter_map(|endpoint| {
                let stats = self.stats_for_selection(&endpoint.id);
                if !stats.is_healthy() {
                    return None;
                }
                let weight = self.adjusted_weight(endpoint, &stats);
                (weight > 0.0).then_some((endpoint, weight))
            })
            .collect();

        if candidates.is_empty() {
            tracing::debug!(endpoint_count = endpoints.len(), "No healthy endpoints found");
            self.sink.record_error(COMPONENT, "none", "no_healthy_endpoint");
            return None;
        }

        let mut total: f64 = candidates.iter().map(|(_, weight)| weight).sum();
        if !total.is_finite() {
            // Very large weights overflow the sum; draw over their share of the largest.
            let largest = candidates.iter().map(|(_, weight)| *weight).fold(0.0, f64::max);
            for (_, weight) in candidates.iter_mut() {
                *weight /= largest;
            }
            total = candidates.iter().map(|(_, weight)| weight).sum();
        }
        let draw = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (endpoint, weight) in &candidates {
            cumulative += weight;
            if draw < cumulative {
                return Some(*endpoint);
            }
        }
        // Rounding can leave the draw just past the final boundary.
        candidates.last().map(|(endpoint, _)| *endpoint)
    }

    /// Base weight scaled by the endpoint's performance multiplier.
    pub fn get_adjusted_weight(&self, endpoint: &Endpoint) -> f64 {
        let stats = self
            .inner
            .stats
            .get(&endpoint.id)
            .map(|s| s.clone())
            .unwrap_or_default();
        self.adjusted_weight(endpoint, &stats)
    }

    fn adjusted_weight(&self, endpoint: &Endpoint, stats: &HealthStats) -> f64 {
        if !endpoint.weight.is_finite() || endpoint.weight <= 0.0 {
            return 0.0;
        }
        (endpoint.weight * performance_multiplier(stats, self.inner.config.latency_target_ms)).min(f64::MAX)
    }

    fn stats_for_selection(&self, id: &str) -> HealthStats {
        if let Some(stats) = self.inner.stats.get(id) {
            return stats.clone();
        }
        if self.is_stopped() {
            return HealthStats::default();
        }
        self.inner.stats.entry(id.to_string()).or_default().clone()
    }

    pub fn record_success(&self, id: &str, latency_ms: f64) {
        if self.is_stopped() {
            return;
        }
        let threshold = self.inner.config.healthy_threshold;
        let transition = self
            .inner
            .stats
            .entry(id.to_string())
            .or_default()
            .record_success(latency_ms, threshold);
        self.sink.record_request(COMPONENT, id, Outcome::Success);
        self.sink.record_duration(COMPONENT, id, latency(latency_ms));
        log_transition(id, transition);
    }

    pub fn record_failure(&self, id: &str, latency_ms: f64) {
        if self.is_stopped() {
            return;
        }
        let threshold = self.inner.config.unhealthy_threshold;
        let transition = self
            .inner
            .stats
            .entry(id.to_string())
            .or_default()
            .record_failure(latency_ms, threshold);
        self.sink.record_request(COMPONENT, id, Outcome::Failure);
        self.sink.record_duration(COMPONENT, id, latency(latency_ms));
        log_transition(id, transition);
    }

    /// Apply an out-of-band health signal to the hysteresis counters.
    pub fn apply_probe(&self, id: &str, healthy: bool) {
        if self.is_stopped() {
            return;
        }
        let mut stats = self.inner.stats.entry(id.to_string()).or_default();
        let transition = if healthy {
            stats.mark_success(self.inner.config.healthy_threshold)
        } else {
            stats.mark_failure(self.inner.config.unhealthy_threshold)
        };
        drop(stats);
        log_transition(id, transition);
    }

    pub fn get_endpoint_health(&self, id: &str) -> Option<HealthStats> {
        self.inner.stats.get(id).map(|s| s.clone())
    }

    /// Statistics for every known endpoint, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, HealthStats)> {
        let mut all: Vec<_> = self
            .inner
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Start periodic re-evaluation from `source`, if an interval is configured.
    pub fn spawn_health_checks(&self, source: Arc<dyn HealthSource>) -> Option<JoinHandle<()>> {
        let Some(interval) = self.inner.config.health_check_interval() else {
            tracing::info!("Active health checks disabled");
            return None;
        };
        if self.is_stopped() {
            return None;
        }
        let shutdown = self.inner.shutdown.subscribe();
        let monitor = HealthMonitor::new(self.clone(), source, interval);
        Some(tokio::spawn(monitor.run(shutdown)))
    }

    /// Halt background checks and stop accepting updates. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.trigger();
        tracing::info!("Endpoint selector stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

fn latency(latency_ms: f64) -> Duration {
    if latency_ms.is_finite() && latency_ms > 0.0 {
        Duration::from_secs_f64(latency_ms / 1000.0)
    } else {
        Duration::ZERO
    }
}

fn log_transition(id: &str, transition: Option<HealthStatus>) {
    match transition {
        Some(HealthStatus::Unhealthy) => {
            tracing::warn!(endpoint = %id, "Endpoint marked unhealthy")
        }
        Some(HealthStatus::Healthy) => {
            tracing::info!(endpoint = %id, "Endpoint recovered, marked healthy")
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> SelectorConfig {
        SelectorConfig {
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            latency_target_ms: 200.0,
            health_check_interval_ms: None,
        }
    }

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::parse("gpu-a", "http://10.0.0.1:8000", 0.7).unwrap(),
            Endpoint::parse("gpu-b", "http://10.0.0.2:8000", 0.3).unwrap(),
        ]
    }

    #[test]
    fn test_weighted_ratio() {
        let selector = EndpointSelector::new(config());
        let endpoints = endpoints();
        let mut rng = StdRng::seed_from_u64(42);

        let mut a_hits = 0;
        for _ in 0..1000 {
            if selector.select_endpoint_with(&endpoints, &mut rng).unwrap().id == "gpu-a" {
                a_hits += 1;
            }
        }
        assert!((600..=800).contains(&a_hits), "gpu-a selected {} times", a_hits);
    }

    #[test]
    fn test_thread_rng_selection() {
        let selector = EndpointSelector::new(config());
        let endpoints = endpoints();
        for _ in 0..100 {
            assert!(selector.select_endpoint(&endpoints).is_some());
        }
    }

    #[test]
    fn test_unhealthy_never_selected() {
        let selector = EndpointSelector::new(config());
        let endpoints = endpoints();
        for _ in 0..3 {
            selector.record_failure("gpu-a", 20.0);
        }
        assert_eq!(
            selector.get_endpoint_health("gpu-a").unwrap().status,
            HealthStatus::Unhealthy
        );

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..500 {
            assert_eq!(selector.select_endpoint_with(&endpoints, &mut rng).unwrap().id, "gpu-b");
        }

        for _ in 0..3 {
            selector.record_failure("gpu-b", 20.0);
        }
        assert!(selector.select_endpoint(&endpoints).is_none());

        // Hysteresis: two successes bring gpu-a back.
        selector.record_success("gpu-a", 20.0);
        assert!(selector.select_endpoint(&endpoints).is_none());
        selector.record_success("gpu-a", 20.0);
        assert_eq!(selector.select_endpoint(&endpoints).unwrap().id, "gpu-a");
    }

    #[test]
    fn test_empty_and_zero_weight() {
        let selector = EndpointSelector::new(config());
        assert!(selector.select_endpoint(&[]).is_none());

        let endpoints = vec![
            Endpoint::parse("zero", "http://10.0.0.1:8000", 0.0).unwrap(),
            Endpoint::parse("nan", "http://10.0.0.2:8000", f64::NAN).unwrap(),
        ];
        assert!(selector.select_endpoint(&endpoints).is_none());
    }

    #[test]
    fn test_huge_weights_do_not_overflow() {
        let selector = EndpointSelector::new(config());
        let endpoints = vec![
            Endpoint::parse("gpu-a", "http://10.0.0.1:8000", 1e308).unwrap(),
            Endpoint::parse("gpu-b", "http://10.0.0.2:8000", 1e308).unwrap(),
        ];
        let mut rng = StdRng::seed_from_u64(7);

        let mut a_hits = 0;
        for _ in 0..1000 {
            if selector.select_endpoint_with(&endpoints, &mut rng).unwrap().id == "gpu-a" {
                a_hits += 1;
            }
        }
        assert!((400..=600).contains(&a_hits), "gpu-a selected {} times", a_hits);

        // Good performance pushes the adjusted weight past f64::MAX.
        for _ in 0..20 {
            selector.record_success("gpu-b", 1.0);
        }
        let maxed = vec![
            Endpoint::parse("gpu-a", "http://10.0.0.1:8000", f64::MAX).unwrap(),
            Endpoint::parse("gpu-b", "http://10.0.0.2:8000", f64::MAX).unwrap(),
        ];
        assert_eq!(selector.get_adjusted_weight(&maxed[1]), f64::MAX);
        for _ in 0..100 {
            assert!(selector.select_endpoint_with(&maxed, &mut rng).is_some());
        }
    }

    #[test]
    fn test_adjusted_weight_follows_performance() {
        let selector = EndpointSelector::new(config());
        let endpoints = endpoints();
        let a = &endpoints[0];
        let b = &endpoints[1];
        assert_eq!(selector.get_adjusted_weight(a), 0.7);

        for _ in 0..20 {
            selector.record_success("gpu-a", 50.0);
            selector.record_failure("gpu-b", 50.0);
        }
        assert!(selector.get_adjusted_weight(a) > 0.7);
        assert!(selector.get_adjusted_weight(b) < 0.3);
        assert!(selector.get_adjusted_weight(b) > 0.0);
    }

    #[test]
    fn test_multiplier_monotonic() {
        let mut stats = HealthStats::default();
        for _ in 0..5 {
            stats.record_failure(500.0, u32::MAX);
        }

        let mut previous = performance_multiplier(&stats, 200.0);
        for _ in 0..50 {
            stats.record_success(100.0, 1);
            let current = performance_multiplier(&stats, 200.0);
            assert!(current >= previous);
            previous = current;
        }

        for _ in 0..50 {
            stats.record_failure(10.0, u32::MAX);
            let current = performance_multiplier(&stats, 200.0);
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn test_multiplier_bounded() {
        let mut good = HealthStats::default();
        let mut bad = HealthStats::default();
        for _ in 0..10_000 {
            good.record_success(1.0, 1);
            bad.record_failure(10_000.0, u32::MAX);
        }
        assert!(performance_multiplier(&good, 200.0) <= MAX_MULTIPLIER);
        assert!(performance_multiplier(&bad, 200.0) >= MIN_MULTIPLIER);

        let mut slow = HealthStats::default();
        for _ in 0..100 {
            slow.record_success(100_000.0, 1);
        }
        let multiplier = performance_multiplier(&slow, 200.0);
        assert!(multiplier < 1.0 && multiplier >= MIN_MULTIPLIER);
    }

    #[test]
    fn test_lazy_stats_and_stop() {
        let selector = EndpointSelector::new(config());
        assert!(selector.get_endpoint_health("gpu-a").is_none());
        selector.select_endpoint(&endpoints());
        assert_eq!(selector.get_endpoint_health("gpu-a").unwrap().total_requests, 0);

        selector.record_success("gpu-a", 10.0);
        selector.stop();
        selector.stop();
        assert!(selector.is_stopped());

        selector.record_failure("gpu-a", 10.0);
        selector.apply_probe("gpu-a", false);
        let stats = selector.get_endpoint_health("gpu-a").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.consecutive_failures, 0);

        // Selection keeps working on the frozen statistics.
        assert!(selector.select_endpoint(&endpoints()).is_some());
    }
}
