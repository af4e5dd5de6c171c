//! Load testing for the guarded call pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use routeguard::config::PoolConfig;
use routeguard::health::HealthStatus;
use routeguard::resilience::CircuitState;
use routeguard::CallPipeline;

mod common;

use common::{config_with, endpoints, is_retriable, MockDownstream};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_performance() {
    // 1. Two endpoints, b2 dead from the start
    let mut config = config_with(&[("b1", 1.0), ("b2", 1.0)]);
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.bulkhead.default_pool = PoolConfig {
        max_concurrency: 4,
        queue_timeout_ms: 10_000,
        execution_timeout_ms: 10_000,
        max_queue: None,
    };
    let endpoints = Arc::new(endpoints(&config));
    let pipeline = Arc::new(CallPipeline::from_config(&config));

    let downstream = MockDownstream::new(&["b1", "b2"], Duration::from_millis(1));
    downstream.set_failing("b2", true);

    // 2. Run load
    let concurrency = 20;
    let requests_per_task = 50;
    let total_requests = concurrency * requests_per_task;
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..concurrency {
        let pipeline = pipeline.clone();
        let endpoints = endpoints.clone();
        let downstream = downstream.clone();
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            let mut failures = 0;
            for _ in 0..requests_per_task {
                let req_start = Instant::now();
                match pipeline
                    .call(&endpoints, |ep| downstream.clone().call(ep), is_retriable)
                    .await
                {
                    Ok(hit) => {
                        assert_eq!(hit, "b1");
                        latencies.push(req_start.elapsed());
                    }
                    Err(_) => failures += 1,
                }
            }
            (latencies, failures)
        }));
    }

    let mut all_latencies = Vec::new();
    let mut failures = 0;
    for task in tasks {
        let (latencies, task_failures) = task.await.unwrap();
        all_latencies.extend(latencies);
        failures += task_failures;
    }

    let duration = start.elapsed();
    let rps = total_requests as f64 / duration.as_secs_f64();

    if all_latencies.is_empty() {
        panic!("No successful requests recorded");
    }

    all_latencies.sort();
    let p50 = all_latencies[all_latencies.len() / 2];
    let p95 = all_latencies[(all_latencies.len() as f64 * 0.95) as usize];
    let p99 = all_latencies[(all_latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests: {}", total_requests);
    println!("Concurrency:    {}", concurrency);
    println!("Total Duration: {:?}", duration);
    println!("Requests/sec:   {:.2}", rps);
    println!("P50 Latency:    {:?}", p50);
    println!("P95 Latency:    {:?}", p95);
    println!("P99 Latency:    {:?}", p99);
    println!("Success Rate:   {}/{}", all_latencies.len(), total_requests);
    println!("-------------------------\n");

    // 3. Invariants
    assert_eq!(all_latencies.len() + failures, total_requests);
    // b2 stops being selected once marked unhealthy; only calls already
    // routed to it can still fail.
    assert!(failures <= concurrency * 2, "too many failures: {}", failures);

    let b2 = pipeline.selector().get_endpoint_health("b2").unwrap();
    assert_eq!(b2.status, HealthStatus::Unhealthy);
    assert_eq!(pipeline.breakers().get("b1").unwrap().get_state(), CircuitState::Closed);

    // One pool per endpoint, each capped at four concurrent calls.
    assert!(downstream.peak_in_flight() <= 8, "peak in flight {}", downstream.peak_in_flight());
    let b1_pool = pipeline.bulkhead().get_pool_metrics("b1");
    assert_eq!(b1_pool.active, 0);
    assert_eq!(b1_pool.queued, 0);
    assert_eq!(b1_pool.successful_executions as usize, all_latencies.len());
    assert_eq!(b1_pool.failed_executions, 0);

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulkhead_caps_concurrency_under_load() {
    let mut config = config_with(&[("b1", 1.0)]);
    config.bulkhead.default_pool = PoolConfig {
        max_concurrency: 3,
        queue_timeout_ms: 10_000,
        execution_timeout_ms: 10_000,
        max_queue: None,
    };
    let endpoints = Arc::new(endpoints(&config));
    let pipeline = Arc::new(CallPipeline::from_config(&config));
    let downstream = MockDownstream::new(&["b1"], Duration::from_millis(2));

    let mut tasks = Vec::new();
    for _ in 0..30 {
        let pipeline = pipeline.clone();
        let endpoints = endpoints.clone();
        let downstream = downstream.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                pipeline
                    .call(&endpoints, |ep| downstream.clone().call(ep), is_retriable)
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(downstream.peak_in_flight() <= 3, "peak in flight {}", downstream.peak_in_flight());
    assert_eq!(downstream.calls("b1"), 150);

    let pool = pipeline.bulkhead().get_pool_metrics("b1");
    assert_eq!(pool.total_executions, 150);
    assert_eq!(pool.successful_executions, 150);
    assert_eq!(pool.queue_timeouts, 0);
}
