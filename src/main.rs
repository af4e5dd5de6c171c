//! routeguard
//!
//! Drives a simulated workload through the call-resilience pipeline and
//! prints what every component observed.
//!
//! # Architecture Overview
//!
//! ```text
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                         CallPipeline                          │
//!     │                                                               │
//!     │  ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌───────┐        │
//!  ──▶│  │ selector │──▶│ bulkhead │──▶│ breaker │──▶│ retry │────────┼──▶ Endpoint
//!     │  └────▲─────┘   └──────────┘   └─────────┘   └───────┘        │
//!     │       │ outcome + latency                                     │
//!     │       └───────────────────────────────────────────────────────│
//!     │                                                               │
//!     │  ┌────────────────────────────────────────────────────────┐   │
//!     │  │ config · observability · lifecycle · health monitor    │   │
//!     │  └────────────────────────────────────────────────────────┘   │
//!     └──────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use futures_util::future::BoxFuture;
use rand::Rng;
use thiserror::Error;

use routeguard::config::{load_config, EndpointConfig, RouteguardConfig};
use routeguard::health::{HealthSource, ProbeReport};
use routeguard::lifecycle::signals::shutdown_signal;
use routeguard::observability::logging::init_logging;
use routeguard::observability::metrics::{init_metrics, noop};
use routeguard::observability::{MetricsSink, PrometheusMetrics};
use routeguard::resilience::TokioClock;
use routeguard::{CallError, CallPipeline, Endpoint};

#[derive(Parser, Debug)]
#[command(name = "routeguard")]
#[command(about = "Run a simulated workload through circuit breakers, retries and bulkheads", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total number of calls to make.
    #[arg(short, long, default_value_t = 200)]
    requests: usize,

    /// Number of concurrent callers.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Failure rate for an endpoint, as `<endpoint>=<rate>`. Repeatable.
    #[arg(long = "fail", value_parser = parse_fail_rate)]
    fail: Vec<(String, f64)>,

    /// Simulated downstream latency in milliseconds.
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,
}

fn parse_fail_rate(s: &str) -> Result<(String, f64), String> {
    let (id, rate) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <endpoint>=<rate>, got '{}'", s))?;
    let rate: f64 = rate.parse().map_err(|e| format!("invalid rate '{}': {}", rate, e))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("rate must be within 0.0..=1.0, got {}", rate));
    }
    Ok((id.to_string(), rate))
}

/// Downstream that fails each endpoint at a configured rate.
#[derive(Debug)]
struct SimulatedDownstream {
    fail_rates: HashMap<String, f64>,
    latency: Duration,
}

#[derive(Debug, Error)]
#[error("simulated downstream failure")]
struct SimulatedFailure;

impl SimulatedDownstream {
    fn fail_rate(&self, id: &str) -> f64 {
        self.fail_rates.get(id).copied().unwrap_or(0.0)
    }

    async fn call(&self, endpoint: Endpoint) -> Result<String, SimulatedFailure> {
        let fails = rand::thread_rng().gen_bool(self.fail_rate(&endpoint.id));
        tokio::time::sleep(self.latency).await;
        if fails {
            Err(SimulatedFailure)
        } else {
            Ok(endpoint.id)
        }
    }
}

impl HealthSource for SimulatedDownstream {
    fn snapshot(&self) -> BoxFuture<'_, Vec<ProbeReport>> {
        let reports = self
            .fail_rates
            .iter()
            .map(|(id, rate)| ProbeReport::new(id.clone(), *rate < 0.5))
            .collect();
        Box::pin(async move { reports })
    }
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![
        EndpointConfig {
            id: "primary".into(),
            url: "http://127.0.0.1:8001".into(),
            weight: 0.7,
        },
        EndpointConfig {
            id: "secondary".into(),
            url: "http://127.0.0.1:8002".into(),
            weight: 0.3,
        },
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RouteguardConfig::default(),
    };
    if config.endpoints.is_empty() {
        config.endpoints = default_endpoints();
    }

    init_logging(&config.observability);
    tracing::info!("routeguard v{} starting", env!("CARGO_PKG_VERSION"));

    let sink: Arc<dyn MetricsSink> = if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                init_metrics(addr);
                Arc::new(PrometheusMetrics)
            }
            Err(_) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                );
                noop()
            }
        }
    } else {
        noop()
    };

    let endpoints = Endpoint::from_configs(&config.endpoints)?;
    let mut fail_rates: HashMap<String, f64> = endpoints.iter().map(|e| (e.id.clone(), 0.0)).collect();
    fail_rates.extend(cli.fail.iter().cloned());

    tracing::info!(
        endpoints = endpoints.len(),
        requests = cli.requests,
        concurrency = cli.concurrency,
        "Configuration loaded"
    );

    let downstream = Arc::new(SimulatedDownstream {
        fail_rates,
        latency: Duration::from_millis(cli.latency_ms),
    });
    let pipeline = Arc::new(CallPipeline::new(&config, Arc::new(TokioClock), sink));
    let monitor = pipeline.selector().spawn_health_checks(downstream.clone());

    let endpoints = Arc::new(endpoints);
    let next = Arc::new(AtomicUsize::new(0));
    let outcomes: Arc<Mutex<BTreeMap<String, u64>>> = Arc::default();

    let mut workers = Vec::with_capacity(cli.concurrency.max(1));
    for _ in 0..cli.concurrency.max(1) {
        let pipeline = pipeline.clone();
        let downstream = downstream.clone();
        let endpoints = endpoints.clone();
        let next = next.clone();
        let outcomes = outcomes.clone();
        let requests = cli.requests;

        workers.push(tokio::spawn(async move {
            while next.fetch_add(1, Ordering::SeqCst) < requests {
                let result = pipeline
                    .call(
                        &endpoints,
                        |endpoint| {
                            let downstream = downstream.clone();
                            async move { downstream.call(endpoint).await }
                        },
                        |_: &SimulatedFailure| true,
                    )
                    .await;
                let label = match &result {
                    Ok(_) => "ok",
                    Err(e) => CallError::kind(e),
                };
                *outcomes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(label.to_string())
                    .or_default() += 1;
            }
        }));
    }

    let workload = async {
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
    };

    tokio::select! {
        _ = workload => tracing::info!("Workload complete"),
        _ = shutdown_signal() => tracing::info!("Interrupted, draining in-flight calls"),
    }

    pipeline.shutdown().await;
    if let Some(handle) = monitor {
        let _ = handle.await;
    }

    let pools: Vec<_> = pipeline
        .bulkhead()
        .pool_names()
        .iter()
        .map(|name| pipeline.bulkhead().get_pool_metrics(name))
        .collect();
    let breakers: BTreeMap<_, _> = pipeline.breakers().snapshot().into_iter().collect();
    let endpoint_health: BTreeMap<_, _> = pipeline.selector().snapshot().into_iter().collect();
    let outcomes = outcomes.lock().unwrap_or_else(PoisonError::into_inner).clone();

    let report = serde_json::json!({
        "outcomes": outcomes,
        "breakers": breakers,
        "retry": pipeline.retry().get_metrics(),
        "pools": pools,
        "endpoints": endpoint_health,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    tracing::info!("Shutdown complete");
    Ok(())
}
