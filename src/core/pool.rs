//! Bounded connection pool
//!
//! Caps the number of operations running concurrently against a dependency.
//! Work beyond `max_connections` waits in a FIFO queue of at most
//! `max_queue_size` entries; anything beyond that is rejected immediately
//! with [`ResilienceError::QueueFull`].
//!
//! A slot is represented by a [`SlotGuard`]. Dropping the guard is the single
//! release point, so a slot is returned exactly once whether the operation
//! completed, timed out or its caller went away. A freed slot is handed
//! directly to the oldest queued request.

use crate::core::retry::{with_retry, RetryPolicy};
use crate::monitor::ResourceUsageMonitor;
use crate::utils::errors::{ResilienceError, ResilienceResult};
use crate::utils::tasks::{BackgroundTask, TaskGroup};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Utilisation ratio at which the pool reports itself near capacity
const NEAR_CAPACITY_RATIO: f64 = 0.9;
const DEFAULT_LABEL: &str = "query";
const POOL_HEALTH_TASK: &str = "pool-health-check";
const POOL_CLEANUP_TASK: &str = "pool-idle-cleanup";

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrently executing operations
    pub max_connections: usize,
    /// Idle time after which a pooled connection is dropped
    pub idle_timeout: Duration,
    /// Deadline for a single operation once it holds a slot
    pub connection_timeout: Duration,
    /// Total attempts made by `execute_with_retry`
    pub retry_attempts: u32,
    /// Backoff before the second attempt, doubled afterwards
    pub retry_delay: Duration,
    /// Maximum number of requests waiting for a slot
    pub max_queue_size: usize,
    /// Health check interval
    pub health_check_interval: Duration,
    pub error_rate_threshold: f64,
    pub slow_response_threshold: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(300), // 5 minutes
            connection_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            max_queue_size: 100,
            health_check_interval: Duration::from_secs(30),
            error_rate_threshold: 0.1,
            slow_response_threshold: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_connections == 0 {
            return Err(ResilienceError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(ResilienceError::Config(
                "connection_timeout must be greater than zero".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() || self.health_check_interval.is_zero() {
            return Err(ResilienceError::Config(
                "idle_timeout and health_check_interval must be greater than zero".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ResilienceError::Config(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(ResilienceError::Config(
                "error_rate_threshold must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay)
    }
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub queued_requests: usize,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub timed_out_queries: u64,
    pub rejected_requests: u64,
    /// Milliseconds
    pub average_response_time: f64,
    pub error_rate: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealthStatus {
    pub is_healthy: bool,
    pub issues: Vec<String>,
    pub metrics: PoolMetrics,
}

#[derive(Debug)]
struct ConnectionRecord {
    id: Uuid,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    use_count: u64,
}

struct QueuedRequest {
    label: String,
    enqueued_at: Instant,
    grant: oneshot::Sender<SlotGuard>,
}

struct PoolState {
    active: usize,
    connections: Vec<ConnectionRecord>,
    queue: VecDeque<QueuedRequest>,
    accepting: bool,
    total_queries: u64,
    failed_queries: u64,
    timed_out_queries: u64,
    rejected_requests: u64,
    total_response_time_ms: u64,
    last_health_check: Option<DateTime<Utc>>,
    is_healthy: bool,
}

impl PoolState {
    fn new() -> Self {
        Self {
            active: 0,
            connections: Vec::new(),
            queue: VecDeque::new(),
            accepting: true,
            total_queries: 0,
            failed_queries: 0,
            timed_out_queries: 0,
            rejected_requests: 0,
            total_response_time_ms: 0,
            last_health_check: None,
            is_healthy: true,
        }
    }

    /// Reuse an idle connection or open a new one
    fn check_out(&mut self, now: Instant) -> Uuid {
        if let Some(conn) = self.connections.iter_mut().find(|c| !c.in_use) {
            conn.in_use = true;
            conn.last_used = now;
            conn.use_count += 1;
            return conn.id;
        }

        let id = Uuid::new_v4();
        self.connections.push(ConnectionRecord {
            id,
            created_at: now,
            last_used: now,
            in_use: true,
            use_count: 1,
        });
        debug!("Opened pooled connection {}", id);
        id
    }

    fn touch(&mut self, id: Uuid, now: Instant, in_use: bool) {
        if let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) {
            conn.last_used = now;
            conn.in_use = in_use;
            if in_use {
                conn.use_count += 1;
            }
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Mirrors `PoolState::active` so shutdown can wait for in-flight work
    active_tx: watch::Sender<usize>,
    monitor: Option<Arc<ResourceUsageMonitor>>,
    tasks: TaskGroup,
    shutdown_started: AtomicBool,
}

impl PoolShared {
    /// Return a slot: hand it to the oldest live waiter, or free it.
    fn release(self: &Arc<Self>, connection_id: Uuid) {
        loop {
            let waiter = {
                let mut st = self.state.lock();
                let now = Instant::now();
                match st.queue.pop_front() {
                    Some(waiter) => {
                        st.touch(connection_id, now, true);
                        waiter
                    }
                    None => {
                        st.touch(connection_id, now, false);
                        st.active -= 1;
                        self.active_tx.send_replace(st.active);
                        if let Some(monitor) = &self.monitor {
                            monitor.set_active_connections(st.active, self.config.max_connections);
                        }
                        return;
                    }
                }
            };

            let waited = waiter.enqueued_at.elapsed();
            let guard = SlotGuard {
                shared: Some(self.clone()),
                connection_id,
            };
            match waiter.grant.send(guard) {
                Ok(()) => {
                    debug!("Dequeued '{}' after waiting {:?}", waiter.label, waited);
                    return;
                }
                Err(mut guard) => {
                    // Caller stopped waiting; offer the slot to the next one.
                    guard.defuse();
                }
            }
        }
    }

    fn record_query(&self, label: &str, elapsed: Duration, error: Option<&ResilienceError>) {
        {
            let mut st = self.state.lock();
            st.total_queries += 1;
            st.total_response_time_ms += elapsed.as_millis() as u64;
            if let Some(e) = error {
                st.failed_queries += 1;
                if matches!(e, ResilienceError::Timeout(_)) {
                    st.timed_out_queries += 1;
                }
            }
        }

        if elapsed >= self.config.slow_response_threshold {
            warn!("Slow query '{}' took {}ms", label, elapsed.as_millis());
        }
        if let Some(monitor) = &self.monitor {
            monitor.record_query(label, elapsed, error.is_none());
        }
    }

    fn metrics(&self) -> PoolMetrics {
        let st = self.state.lock();
        let total_connections = st.connections.len();
        let idle_connections = st.connections.iter().filter(|c| !c.in_use).count();

        PoolMetrics {
            total_connections,
            active_connections: st.active,
            idle_connections,
            queued_requests: st.queue.len(),
            total_queries: st.total_queries,
            failed_queries: st.failed_queries,
            timed_out_queries: st.timed_out_queries,
            rejected_requests: st.rejected_requests,
            average_response_time: if st.total_queries == 0 {
                0.0
            } else {
                st.total_response_time_ms as f64 / st.total_queries as f64
            },
            error_rate: if st.total_queries == 0 {
                0.0
            } else {
                st.failed_queries as f64 / st.total_queries as f64
            },
            last_health_check: st.last_health_check,
            is_healthy: st.is_healthy,
        }
    }

    fn health_status(&self) -> PoolHealthStatus {
        let metrics = self.metrics();
        let accepting = self.state.lock().accepting;
        let max = self.config.max_connections;
        let mut issues = Vec::new();

        if !accepting {
            issues.push("Pool is shut down".to_string());
        }

        if metrics.active_connections as f64 / max as f64 >= NEAR_CAPACITY_RATIO {
            issues.push(format!(
                "Connection pool near capacity ({}/{})",
                metrics.active_connections, max
            ));
        }

        let queue_max = self.config.max_queue_size;
        if queue_max > 0 && metrics.queued_requests as f64 / queue_max as f64 >= NEAR_CAPACITY_RATIO {
            issues.push(format!(
                "Request queue near capacity ({}/{})",
                metrics.queued_requests, queue_max
            ));
        }

        if metrics.total_queries > 0 && metrics.error_rate > self.config.error_rate_threshold {
            issues.push(format!(
                "High error rate: {:.1}%",
                metrics.error_rate * 100.0
            ));
        }

        let slow_ms = self.config.slow_response_threshold.as_millis() as f64;
        if metrics.total_queries > 0 && metrics.average_response_time > slow_ms {
            issues.push(format!(
                "Slow average response time: {:.0}ms",
                metrics.average_response_time
            ));
        }

        PoolHealthStatus {
            is_healthy: issues.is_empty(),
            issues,
            metrics,
        }
    }

    fn run_health_check(&self) -> PoolHealthStatus {
        let mut status = self.health_status();
        let now = Utc::now();
        {
            let mut st = self.state.lock();
            st.last_health_check = Some(now);
            st.is_healthy = status.is_healthy;
        }
        status.metrics.last_health_check = Some(now);
        status.metrics.is_healthy = status.is_healthy;

        if !status.is_healthy {
            warn!("Connection pool health issues: {}", status.issues.join("; "));
        }
        status
    }

    fn cleanup_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();
        let mut st = self.state.lock();
        let before = st.connections.len();
        st.connections.retain(|c| {
            let keep = c.in_use || now.saturating_duration_since(c.last_used) < idle_timeout;
            if !keep {
                debug!(
                    "Closing idle connection {} (age {:?}, {} uses)",
                    c.id,
                    now.saturating_duration_since(c.created_at),
                    c.use_count
                );
            }
            keep
        });
        let removed = before - st.connections.len();
        if removed > 0 {
            debug!("Closed {} idle pooled connections", removed);
        }
        removed
    }
}

/// Exclusive hold on one pool slot
pub struct SlotGuard {
    shared: Option<Arc<PoolShared>>,
    connection_id: Uuid,
}

impl SlotGuard {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn defuse(&mut self) {
        self.shared = None;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.connection_id);
        }
    }
}

enum Admission {
    Slot(Uuid),
    Queued(oneshot::Receiver<SlotGuard>),
    Full(usize),
}

/// Bounded executor for operations against one dependency.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPoolManager {
    shared: Arc<PoolShared>,
}

impl ConnectionPoolManager {
    /// Create a new connection pool manager
    pub fn new(config: PoolConfig) -> ResilienceResult<Self> {
        Self::build(config, None)
    }

    /// Create a pool that reports usage to `monitor`
    pub fn with_monitor(config: PoolConfig, monitor: Arc<ResourceUsageMonitor>) -> ResilienceResult<Self> {
        Self::build(config, Some(monitor))
    }

    fn build(config: PoolConfig, monitor: Option<Arc<ResourceUsageMonitor>>) -> ResilienceResult<Self> {
        config.validate()?;
        let (active_tx, _) = watch::channel(0);
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState::new()),
                active_tx,
                monitor,
                tasks: TaskGroup::new(),
                shutdown_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire a slot, waiting in the FIFO queue if necessary
    pub async fn acquire(&self, label: Option<&str>) -> ResilienceResult<SlotGuard> {
        let label = label.unwrap_or(DEFAULT_LABEL);
        let admission = {
            let mut st = self.shared.state.lock();
            if !st.accepting {
                return Err(ResilienceError::Shutdown);
            }

            if st.active < self.shared.config.max_connections {
                st.active += 1;
                let id = st.check_out(Instant::now());
                self.shared.active_tx.send_replace(st.active);
                if let Some(monitor) = &self.shared.monitor {
                    monitor.set_active_connections(st.active, self.shared.config.max_connections);
                }
                Admission::Slot(id)
            } else if st.queue.len() < self.shared.config.max_queue_size {
                let (grant, rx) = oneshot::channel();
                st.queue.push_back(QueuedRequest {
                    label: label.to_string(),
                    enqueued_at: Instant::now(),
                    grant,
                });
                debug!("Queued '{}' ({} waiting)", label, st.queue.len());
                Admission::Queued(rx)
            } else {
                st.rejected_requests += 1;
                Admission::Full(st.queue.len())
            }
        };

        match admission {
            Admission::Slot(connection_id) => Ok(SlotGuard {
                shared: Some(self.shared.clone()),
                connection_id,
            }),
            Admission::Queued(rx) => rx.await.map_err(|_| ResilienceError::Shutdown),
            Admission::Full(pending) => {
                warn!("Rejecting '{}': request queue full ({} pending)", label, pending);
                if let Some(monitor) = &self.shared.monitor {
                    monitor.record_queue_rejection();
                }
                Err(ResilienceError::QueueFull(pending))
            }
        }
    }

    /// Run `operation` once a slot is available, bounded by
    /// `connection_timeout`. A timed-out operation is dropped and its slot
    /// released.
    pub async fn execute_query<T, F, Fut>(&self, operation: F, label: Option<&str>) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let guard = self.acquire(label).await?;
        let label = label.unwrap_or(DEFAULT_LABEL);
        let timeout = self.shared.config.connection_timeout;

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("'{}' timed out after {}ms", label, timeout.as_millis());
                Err(ResilienceError::Timeout(timeout.as_millis() as u64))
            }
        };
        let elapsed = start.elapsed();

        self.shared.record_query(label, elapsed, result.as_ref().err());

        drop(guard);
        result
    }

    /// `execute_query` with retries for retryable failures. `operation` is
    /// invoked afresh for every attempt.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F, label: Option<&str>) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let policy = self.shared.config.retry_policy();
        with_retry(&policy, label.unwrap_or(DEFAULT_LABEL), |_| {
            let fut = operation();
            self.execute_query(move || fut, label)
        })
        .await
    }

    pub fn get_metrics(&self) -> PoolMetrics {
        self.shared.metrics()
    }

    pub fn get_health_status(&self) -> PoolHealthStatus {
        self.shared.health_status()
    }

    /// Evaluate health and remember the outcome in the metrics
    pub fn run_health_check(&self) -> PoolHealthStatus {
        self.shared.run_health_check()
    }

    /// Drop pooled connections idle for longer than `idle_timeout`
    pub fn cleanup_idle_connections(&self) -> usize {
        self.shared.cleanup_idle()
    }

    /// Start the periodic health check and idle cleanup. Returns false when
    /// already started or shut down.
    pub fn start_maintenance(&self) -> bool {
        if self.shared.shutdown_started.load(Ordering::SeqCst) {
            return false;
        }

        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let health_period = self.shared.config.health_check_interval;
        let health = self.shared.tasks.spawn_if_absent(POOL_HEALTH_TASK, || {
            BackgroundTask::spawn_interval(POOL_HEALTH_TASK, health_period, move || {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.run_health_check();
                    }
                }
            })
        });

        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let cleanup_period = self.shared.config.idle_timeout.min(Duration::from_secs(60));
        let cleanup = self.shared.tasks.spawn_if_absent(POOL_CLEANUP_TASK, || {
            BackgroundTask::spawn_interval(POOL_CLEANUP_TASK, cleanup_period, move || {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.cleanup_idle();
                    }
                }
            })
        });

        health || cleanup
    }

    /// Number of background tasks currently scheduled
    pub fn active_task_count(&self) -> usize {
        self.shared.tasks.active_count()
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.state.lock().accepting
    }

    /// Stop admitting work, reject queued requests, wait for in-flight
    /// operations and stop background tasks. A second call is a no-op.
    pub async fn shutdown(&self) {
        if self.shared.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (waiters, in_flight) = {
            let mut st = self.shared.state.lock();
            st.accepting = false;
            (std::mem::take(&mut st.queue), st.active)
        };
        info!(
            "Shutting down connection pool ({} in flight, {} queued requests rejected)",
            in_flight,
            waiters.len()
        );
        // Dropping the senders wakes every waiter with `Shutdown`.
        drop(waiters);

        let mut active = self.shared.active_tx.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;

        self.shared.tasks.stop_all().await;
        self.shared.state.lock().connections.clear();
        if let Some(monitor) = &self.shared.monitor {
            monitor.set_active_connections(0, self.shared.config.max_connections);
        }
        info!("Connection pool shut down");
    }
}
