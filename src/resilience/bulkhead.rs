//! Bulkhead isolation.
//!
//! # Responsibilities
//! - Keep named concurrency pools, created lazily from configuration
//! - Admit callers up to `max_concurrency`, queue the rest in FIFO order
//! - Bound queueing with `queue_timeout` and running with `execution_timeout`
//!
//! # Design Decisions
//! - One fair semaphore per pool; waiters are served strictly in arrival order
//! - Pools live in a sharded registry owned by the executor, never a global
//! - A dropped waiter leaves the queue without consuming a permit
//! - On execution timeout the operation future is dropped, which cancels it
//!   at its next suspension point; work it spawned elsewhere keeps running
//! - The slot is released as soon as the outcome reaches the caller

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::timeout;

use crate::config::{BulkheadConfig, PoolConfig};
use crate::observability::{MetricsSink, Outcome};

const COMPONENT: &str = "bulkhead";

/// Error returned by [`BulkheadExecutor::execute`].
#[derive(Debug, Error)]
pub enum BulkheadError<E> {
    /// Waited longer than `queue_timeout` for a slot; the operation never ran.
    #[error("bulkhead pool '{pool}' queue timeout after {waited:?}")]
    QueueTimeout { pool: String, waited: Duration },

    /// The admitted operation ran longer than `execution_timeout`.
    #[error("bulkhead pool '{pool}' execution timeout after {timeout:?}")]
    ExecutionTimeout { pool: String, timeout: Duration },

    /// The wait queue is at `max_queue`; the operation never ran.
    #[error("bulkhead pool '{pool}' queue is full ({max_queue} waiting)")]
    QueueFull { pool: String, max_queue: usize },

    /// The executor is shut down; the operation never ran.
    #[error("bulkhead pool '{pool}' is shut down")]
    ShutDown { pool: String },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BulkheadError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            BulkheadError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub name: String,
    pub max_concurrency: usize,
    pub active: usize,
    pub queued: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub queue_timeouts: u64,
    pub execution_timeouts: u64,
    /// Refused because the queue was full or the executor was shut down.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    total_executions: u64,
    successful_executions: u64,
    failed_executions: u64,
    queue_timeouts: u64,
    execution_timeouts: u64,
    rejected: u64,
}

enum Completion {
    Success,
    Failed,
    QueueTimeout,
    ExecutionTimeout,
    Rejected,
}

struct Pool {
    name: String,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    idle: Notify,
    counters: Mutex<PoolCounters>,
}

impl Pool {
    fn new(name: &str, config: PoolConfig) -> Self {
        Self {
            name: name.to_string(),
            permits: Arc::new(Semaphore::new(config.max_concurrency.min(Semaphore::MAX_PERMITS))),
            config,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            idle: Notify::new(),
            counters: Mutex::new(PoolCounters::default()),
        }
    }

    fn complete(&self, completion: Completion) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.total_executions += 1;
        match completion {
            Completion::Success => counters.successful_executions += 1,
            Completion::Failed => counters.failed_executions += 1,
            Completion::QueueTimeout => {
                counters.failed_executions += 1;
                counters.queue_timeouts += 1;
            }
            Completion::ExecutionTimeout => {
                counters.failed_executions += 1;
                counters.execution_timeouts += 1;
            }
            Completion::Rejected => {
                counters.failed_executions += 1;
                counters.rejected += 1;
            }
        }
    }

    fn metrics(&self) -> PoolMetrics {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        PoolMetrics {
            name: self.name.clone(),
            max_concurrency: self.config.max_concurrency,
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            total_executions: counters.total_executions,
            successful_executions: counters.successful_executions,
            failed_executions: counters.failed_executions,
            queue_timeouts: counters.queue_timeouts,
            execution_timeouts: counters.execution_timeouts,
            rejected: counters.rejected,
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the queue gauge when the waiter leaves, however it leaves.
struct QueuedGuard<'a>(&'a Pool);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds a concurrency slot; dropping it admits the next waiter.
struct ActiveGuard<'a> {
    pool: &'a Pool,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if self.pool.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pool.idle.notify_waiters();
        }
    }
}

/// Named, isolated concurrency pools.
pub struct BulkheadExecutor {
    config: BulkheadConfig,
    pools: DashMap<String, Arc<Pool>>,
    shut_down: AtomicBool,
    sink: Arc<dyn MetricsSink>,
}

impl fmt::Debug for BulkheadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadExecutor")
            .field("pools", &self.pool_names())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl BulkheadExecutor {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
            shut_down: AtomicBool::new(false),
            sink: crate::observability::metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    fn pool(&self, name: &str) -> Arc<Pool> {
        if let Some(pool) = self.pools.get(name) {
            return pool.clone();
        }
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.config.pool(name).clone();
                tracing::debug!(
                    pool = %name,
                    max_concurrency = config.max_concurrency,
                    "Creating bulkhead pool"
                );
                Arc::new(Pool::new(name, config))
            })
            .clone()
    }

    /// Run `operation` inside the named pool.
    pub async fn execute<F, Fut, T, E>(&self, pool_name: &str, operation: F) -> Result<T, BulkheadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let pool = self.pool(pool_name);

        if self.shut_down.load(Ordering::SeqCst) {
            return Err(self.reject(&pool, BulkheadError::ShutDown { pool: pool.name.clone() }));
        }

        let permit = match pool.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(self.reject(&pool, BulkheadError::ShutDown { pool: pool.name.clone() }));
            }
            Err(TryAcquireError::NoPermits) => self.wait_for_slot(&pool).await?,
        };

        pool.active.fetch_add(1, Ordering::SeqCst);
        let slot = ActiveGuard {
            pool: &pool,
            _permit: permit,
        };
        // A shutdown that raced the permit may already have seen the pool idle.
        if self.shut_down.load(Ordering::SeqCst) {
            drop(slot);
            return Err(self.reject(&pool, BulkheadError::ShutDown { pool: pool.name.clone() }));
        }

        let limit = pool.config.execution_timeout();
        match timeout(limit, operation()).await {
            Ok(Ok(value)) => {
                pool.complete(Completion::Success);
                self.sink.record_request(COMPONENT, &pool.name, Outcome::Success);
                Ok(value)
            }
            Ok(Err(e)) => {
                pool.complete(Completion::Failed);
                self.sink.record_request(COMPONENT, &pool.name, Outcome::Failure);
                Err(BulkheadError::Inner(e))
            }
            Err(_) => {
                pool.complete(Completion::ExecutionTimeout);
                self.sink.record_request(COMPONENT, &pool.name, Outcome::Failure);
                self.sink.record_error(COMPONENT, &pool.name, "execution_timeout");
                tracing::warn!(pool = %pool.name, timeout = ?limit, "Bulkhead execution timed out");
                Err(BulkheadError::ExecutionTimeout {
                    pool: pool.name.clone(),
                    timeout: limit,
                })
            }
        }
    }

    async fn wait_for_slot<E>(&self, pool: &Pool) -> Result<OwnedSemaphorePermit, BulkheadError<E>> {
        match pool.config.max_queue {
            Some(max_queue) => {
                let reserved = pool
                    .queued
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                        (queued < max_queue).then_some(queued + 1)
                    });
                if reserved.is_err() {
                    return Err(self.reject(
                        pool,
                        BulkheadError::QueueFull {
                            pool: pool.name.clone(),
                            max_queue,
                        },
                    ));
                }
            }
            None => {
                pool.queued.fetch_add(1, Ordering::SeqCst);
            }
        }
        let queued = QueuedGuard(pool);
        let wait = pool.config.queue_timeout();
        let acquired = timeout(wait, pool.permits.clone().acquire_owned()).await;
        drop(queued);

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(self.reject(pool, BulkheadError::ShutDown { pool: pool.name.clone() })),
            Err(_) => {
                pool.complete(Completion::QueueTimeout);
                self.sink.record_request(COMPONENT, &pool.name, Outcome::Rejected);
                self.sink.record_error(COMPONENT, &pool.name, "queue_timeout");
                tracing::warn!(pool = %pool.name, waited = ?wait, "Bulkhead queue timeout");
                Err(BulkheadError::QueueTimeout {
                    pool: pool.name.clone(),
                    waited: wait,
                })
            }
        }
    }

    fn reject<E>(&self, pool: &Pool, error: BulkheadError<E>) -> BulkheadError<E> {
        pool.complete(Completion::Rejected);
        self.sink.record_request(COMPONENT, &pool.name, Outcome::Rejected);
        let kind = match error {
            BulkheadError::QueueFull { .. } => "queue_full",
            _ => "shut_down",
        };
        self.sink.record_error(COMPONENT, &pool.name, kind);
        error
    }

    /// Metrics for `pool_name`; zeroed if the pool has never been used.
    pub fn get_pool_metrics(&self, pool_name: &str) -> PoolMetrics {
        match self.pools.get(pool_name) {
            Some(pool) => pool.metrics(),
            None => PoolMetrics {
                name: pool_name.to_string(),
                max_concurrency: self.config.pool(pool_name).max_concurrency,
                ..PoolMetrics::default()
            },
        }
    }

    /// Names of every pool created so far, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Reject every queued caller, let in-flight operations finish or time
    /// out, and refuse all later calls. Idempotent.
    pub async fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!(pools = self.pools.len(), "Bulkhead shutting down");
        }

        let pools: Vec<Arc<Pool>> = self.pools.iter().map(|p| p.value().clone()).collect();
        for pool in &pools {
            pool.permits.close();
        }
        for pool in &pools {
            pool.wait_idle().await;
        }
        tracing::info!("Bulkhead drained");
    }
}
