//! Active health checking.
//!
//! # Responsibilities
//! - Periodically pull health snapshots from an external source
//! - Feed them into the selector's hysteresis counters

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::load_balancer::weighted::EndpointSelector;

/// Health of one endpoint as reported by an external prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub endpoint_id: String,
    pub healthy: bool,
}

impl ProbeReport {
    pub fn new(endpoint_id: impl Into<String>, healthy: bool) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            healthy,
        }
    }
}

/// Supplies health snapshots on demand.
pub trait HealthSource: Send + Sync {
    fn snapshot(&self) -> BoxFuture<'_, Vec<ProbeReport>>;
}

/// Background task re-evaluating endpoint health on a fixed period.
pub struct HealthMonitor {
    selector: EndpointSelector,
    source: Arc<dyn HealthSource>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(selector: EndpointSelector, source: Arc<dyn HealthSource>, interval: Duration) -> Self {
        Self {
            selector,
            source,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?self.interval, "Health monitor starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }
            // A slow source must not hold up shutdown.
            tokio::select! {
                _ = self.check_all() => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Health monitor received shutdown signal, exiting loop");
    }

    async fn check_all(&self) {
        let reports = self.source.snapshot().await;
        tracing::debug!(reports = reports.len(), "Applying health snapshot");
        for report in reports {
            if !report.healthy {
                tracing::debug!(endpoint = %report.endpoint_id, "Health check failed");
            }
            self.selector.apply_probe(&report.endpoint_id, report.healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::health::state::HealthStatus;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FlakySource {
        healthy: AtomicBool,
        polls: AtomicU32,
    }

    impl HealthSource for FlakySource {
        fn snapshot(&self) -> BoxFuture<'_, Vec<ProbeReport>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let healthy = self.healthy.load(Ordering::SeqCst);
            Box::pin(async move { vec![ProbeReport::new("gpu-a", healthy)] })
        }
    }

    fn status(selector: &EndpointSelector) -> HealthStatus {
        selector.get_endpoint_health("gpu-a").unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checks_and_stop() {
        let selector = EndpointSelector::new(SelectorConfig {
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            latency_target_ms: 200.0,
            health_check_interval_ms: Some(1_000),
        });
        let source = Arc::new(FlakySource {
            healthy: AtomicBool::new(false),
            polls: AtomicU32::new(0),
        });

        let handle = selector.spawn_health_checks(source.clone()).unwrap();

        // Ticks at 0s and 1s.
        time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(status(&selector), HealthStatus::Unhealthy);

        source.healthy.store(true, Ordering::SeqCst);
        // Ticks at 2s and 3s.
        time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(status(&selector), HealthStatus::Healthy);

        selector.stop();
        handle.await.unwrap();
        let polls = source.polls.load(Ordering::SeqCst);

        source.healthy.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.polls.load(Ordering::SeqCst), polls);
        assert_eq!(status(&selector), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_disabled_without_interval() {
        let selector = EndpointSelector::new(SelectorConfig::default());
        let source = Arc::new(FlakySource {
            healthy: AtomicBool::new(true),
            polls: AtomicU32::new(0),
        });
        assert!(selector.spawn_health_checks(source).is_none());
    }
}
