//! Circuit breaker registry for resilient dependency calls
//!
//! Tracks the health of named dependencies and fails fast, optionally through
//! a fallback, once a dependency has failed `failure_threshold` times in a row.
//!
//! Half-open admission: exactly one probe call is in flight per circuit. Calls
//! arriving while that probe is outstanding are handled as if the circuit were
//! still open.

use crate::utils::errors::{ResilienceError, ResilienceResult};
use crate::utils::tasks::{BackgroundTask, TaskGroup};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Response-time samples kept per service
const RESPONSE_TIME_HISTORY: usize = 100;
const HEALTH_MONITOR_TASK: &str = "circuit-breaker-health";
/// Upper bound on a single health check; shorter intervals lower it further
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failure threshold reached - requests are rejected
    Open,
    /// Testing if service has recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive unexpected failures before opening the circuit
    pub failure_threshold: u32,
    /// Time spent open before a probe is admitted
    pub recovery_timeout: Duration,
    /// Whether fallbacks are consulted at all
    pub fallback_enabled: bool,
    /// Case-insensitive substrings of errors that do not count towards opening
    pub expected_error_patterns: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            fallback_enabled: true,
            expected_error_patterns: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::Config(
                "recovery_timeout must be greater than zero".to_string(),
            ));
        }
        if self.expected_error_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(ResilienceError::Config(
                "expected_error_patterns must not contain empty patterns".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a partial update on top of this configuration
    pub fn merged(&self, update: &CircuitBreakerConfigUpdate) -> Self {
        Self {
            failure_threshold: update.failure_threshold.unwrap_or(self.failure_threshold),
            recovery_timeout: update.recovery_timeout.unwrap_or(self.recovery_timeout),
            fallback_enabled: update.fallback_enabled.unwrap_or(self.fallback_enabled),
            expected_error_patterns: update
                .expected_error_patterns
                .clone()
                .unwrap_or_else(|| self.expected_error_patterns.clone()),
        }
    }

    fn is_expected(&self, error: &ResilienceError) -> bool {
        if self.expected_error_patterns.is_empty() {
            return false;
        }
        let message = error.to_string().to_lowercase();
        self.expected_error_patterns
            .iter()
            .any(|p| message.contains(&p.to_lowercase()))
    }
}

/// Partial configuration; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitBreakerConfigUpdate {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout: Option<Duration>,
    pub fallback_enabled: Option<bool>,
    pub expected_error_patterns: Option<Vec<String>>,
}

impl From<CircuitBreakerConfig> for CircuitBreakerConfigUpdate {
    fn from(config: CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: Some(config.failure_threshold),
            recovery_timeout: Some(config.recovery_timeout),
            fallback_enabled: Some(config.fallback_enabled),
            expected_error_patterns: Some(config.expected_error_patterns),
        }
    }
}

/// Alternate result producer used when a call is skipped or fails
pub type FallbackFn<T> = Arc<dyn Fn() -> BoxFuture<'static, ResilienceResult<T>> + Send + Sync>;

/// Health probe; `Ok(false)` and `Err(_)` both count as unhealthy
pub type HealthCheckFn = Arc<dyn Fn() -> BoxFuture<'static, ResilienceResult<bool>> + Send + Sync>;

/// Wrap an async closure as a [`FallbackFn`]
pub fn fallback_fn<T, F, Fut>(f: F) -> FallbackFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Everything needed to register a dependency
pub struct ServiceRegistration {
    name: String,
    overrides: CircuitBreakerConfigUpdate,
    fallback: Option<Arc<dyn Any + Send + Sync>>,
    health_check: Option<HealthCheckFn>,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overrides: CircuitBreakerConfigUpdate::default(),
            fallback: None,
            health_check: None,
        }
    }

    /// Use a complete configuration instead of the registry defaults
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.overrides = config.into();
        self
    }

    /// Override selected fields of the registry defaults
    pub fn overrides(mut self, overrides: CircuitBreakerConfigUpdate) -> Self {
        self.overrides = overrides;
        self
    }

    /// Register a fallback producing `T`. It is used by `execute::<T>` calls
    /// only; calls with another result type see no registered fallback.
    pub fn fallback<T, F, Fut>(mut self, f: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
    {
        let fallback: FallbackFn<T> = fallback_fn(f);
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(fallback);
        self.fallback = Some(erased);
        self
    }

    pub fn health_check<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<bool>> + Send + 'static,
    {
        let check: HealthCheckFn = Arc::new(move || f().boxed());
        self.health_check = Some(check);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of a health probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckRecord {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub message: Option<String>,
}

/// Result returned by [`CircuitBreakerRegistry::execute`]
#[derive(Debug)]
pub struct ExecutionResult<T> {
    pub success: bool,
    pub data: Option<T>,
    /// Failure reason; also set when a fallback recovered the call
    pub error: Option<ResilienceError>,
    pub fallback_used: bool,
    /// Circuit state after the call settled
    pub state: CircuitState,
    pub execution_time: Duration,
}

impl<T> ExecutionResult<T> {
    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time.as_millis() as u64
    }

    /// Collapse into a plain `Result`
    pub fn into_result(self) -> ResilienceResult<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(self
                .error
                .unwrap_or_else(|| ResilienceError::operation("operation produced no result"))),
        }
    }
}

/// Read-only snapshot of one registered service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Calls short-circuited without reaching the dependency
    pub rejected_requests: u64,
    pub failure_rate: f64,
    pub average_response_time_ms: f64,
    pub last_error: Option<String>,
    /// Remaining time before an open circuit admits a probe
    pub half_open_in_ms: Option<u64>,
    pub probe_in_flight: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub fallback_enabled: bool,
    pub has_fallback: bool,
    pub has_health_check: bool,
    pub last_health_check: Option<HealthCheckRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
    Rejected,
}

#[derive(Debug)]
struct CircuitRuntime {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    response_times: VecDeque<u64>,
    probe_in_flight: bool,
    last_error: Option<String>,
    last_health_check: Option<HealthCheckRecord>,
}

impl Default for CircuitRuntime {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            response_times: VecDeque::with_capacity(RESPONSE_TIME_HISTORY),
            probe_in_flight: false,
            last_error: None,
            last_health_check: None,
        }
    }
}

struct ServiceEntry {
    config: CircuitBreakerConfig,
    fallback: Option<Arc<dyn Any + Send + Sync>>,
    health_check: Option<HealthCheckFn>,
    runtime: CircuitRuntime,
}

impl ServiceEntry {
    /// Lazily move an expired open circuit to half-open
    fn refresh(&mut self, name: &str, now: Instant) {
        let rt = &mut self.runtime;
        if rt.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = rt.opened_at {
            if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout {
                rt.state = CircuitState::HalfOpen;
                rt.probe_in_flight = false;
                info!("Circuit breaker '{}' transitioned to half-open", name);
            }
        }
    }

    fn admit(&mut self, name: &str, now: Instant) -> Admission {
        self.refresh(name, now);
        let rt = &mut self.runtime;
        match rt.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::HalfOpen if !rt.probe_in_flight => {
                rt.probe_in_flight = true;
                debug!("Circuit breaker '{}' admitting probe call", name);
                Admission::Probe
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                rt.rejected_requests += 1;
                Admission::Rejected
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.runtime.state = CircuitState::Open;
        self.runtime.opened_at = Some(now);
        self.runtime.probe_in_flight = false;
    }

    fn record_success(&mut self, name: &str, admission: Admission, elapsed: Duration) -> CircuitState {
        let rt = &mut self.runtime;
        rt.total_requests += 1;
        rt.successful_requests += 1;
        if rt.response_times.len() == RESPONSE_TIME_HISTORY {
            rt.response_times.pop_front();
        }
        rt.response_times.push_back(elapsed.as_millis() as u64);

        match admission {
            Admission::Probe => {
                rt.state = CircuitState::Closed;
                rt.consecutive_failures = 0;
                rt.opened_at = None;
                rt.probe_in_flight = false;
                info!("Circuit breaker '{}' closed after recovery", name);
            }
            _ if rt.state == CircuitState::Closed => rt.consecutive_failures = 0,
            _ => {}
        }
        rt.state
    }

    fn record_failure(&mut self, name: &str, admission: Admission, error: &ResilienceError, now: Instant) {
        let expected = self.config.is_expected(error);
        let threshold = self.config.failure_threshold;
        {
            let rt = &mut self.runtime;
            rt.total_requests += 1;
            rt.failed_requests += 1;
            rt.last_error = Some(error.to_string());
        }

        if admission == Admission::Probe {
            self.open(now);
            warn!(
                "Circuit breaker '{}' re-opened after failure in half-open state: {}",
                name, error
            );
            return;
        }

        if expected {
            debug!("Circuit breaker '{}' ignoring expected error: {}", name, error);
            return;
        }

        self.runtime.consecutive_failures += 1;
        let failures = self.runtime.consecutive_failures;
        if self.runtime.state == CircuitState::Closed && failures >= threshold {
            self.open(now);
            warn!("Circuit breaker '{}' opened after {} failures", name, failures);
        }
    }

    fn record_health_check(&mut self, name: &str, healthy: bool, message: Option<String>, now: Instant) {
        self.runtime.last_health_check = Some(HealthCheckRecord {
            healthy,
            checked_at: Utc::now(),
            message,
        });

        self.refresh(name, now);
        if healthy && self.runtime.state == CircuitState::Open {
            self.runtime.state = CircuitState::HalfOpen;
            self.runtime.probe_in_flight = false;
            info!(
                "Circuit breaker '{}' transitioned to half-open after passing health check",
                name
            );
        }
    }

    fn reset(&mut self) {
        let last_health_check = self.runtime.last_health_check.take();
        self.runtime = CircuitRuntime {
            last_health_check,
            ..CircuitRuntime::default()
        };
    }

    fn status(&mut self, name: &str, now: Instant) -> ServiceStatus {
        self.refresh(name, now);
        let rt = &self.runtime;

        let average_response_time_ms = if rt.response_times.is_empty() {
            0.0
        } else {
            rt.response_times.iter().sum::<u64>() as f64 / rt.response_times.len() as f64
        };
        let failure_rate = if rt.total_requests == 0 {
            0.0
        } else {
            rt.failed_requests as f64 / rt.total_requests as f64
        };
        let half_open_in_ms = match (rt.state, rt.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(now.saturating_duration_since(opened_at))
                    .as_millis() as u64,
            ),
            _ => None,
        };

        ServiceStatus {
            name: name.to_string(),
            state: rt.state,
            consecutive_failures: rt.consecutive_failures,
            total_requests: rt.total_requests,
            successful_requests: rt.successful_requests,
            failed_requests: rt.failed_requests,
            rejected_requests: rt.rejected_requests,
            failure_rate,
            average_response_time_ms,
            last_error: rt.last_error.clone(),
            half_open_in_ms,
            probe_in_flight: rt.probe_in_flight,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout.as_millis() as u64,
            fallback_enabled: self.config.fallback_enabled,
            has_fallback: self.fallback.is_some(),
            has_health_check: self.health_check.is_some(),
            last_health_check: rt.last_health_check.clone(),
        }
    }
}

type SharedEntry = Arc<Mutex<ServiceEntry>>;

/// Releases a probe slot if the calling future is dropped mid-flight, so the
/// circuit can admit another probe.
struct ProbeGuard {
    entry: Option<SharedEntry>,
}

impl ProbeGuard {
    fn new(entry: &SharedEntry, admission: Admission) -> Self {
        Self {
            entry: (admission == Admission::Probe).then(|| entry.clone()),
        }
    }

    fn disarm(&mut self) {
        self.entry = None;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.lock().runtime.probe_in_flight = false;
        }
    }
}

struct RegistryInner {
    services: DashMap<String, SharedEntry>,
    defaults: CircuitBreakerConfig,
    health_check_interval: Duration,
    health_check_timeout: Duration,
    tasks: TaskGroup,
    destroyed: AtomicBool,
}

/// Registry of circuit breakers keyed by dependency name.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RegistryInner>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose registrations default to `defaults`
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_health_check_interval(defaults, Duration::from_secs(30))
    }

    pub fn with_health_check_interval(defaults: CircuitBreakerConfig, interval: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                services: DashMap::new(),
                defaults,
                health_check_interval: interval,
                health_check_timeout: interval.min(HEALTH_CHECK_TIMEOUT),
                tasks: TaskGroup::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_settings(settings: &crate::config::CircuitBreakerSettings) -> ResilienceResult<Self> {
        let defaults = settings.breaker_config();
        defaults.validate()?;
        Ok(Self::with_health_check_interval(
            defaults,
            settings.health_check_interval(),
        ))
    }

    /// Create or replace a service registration. Fails with `Shutdown` once
    /// the registry has been destroyed.
    pub fn register(&self, registration: ServiceRegistration) -> ResilienceResult<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ResilienceError::Shutdown);
        }
        if registration.name.trim().is_empty() {
            return Err(ResilienceError::Validation(
                "service name cannot be empty".to_string(),
            ));
        }

        let config = self.inner.defaults.merged(&registration.overrides);
        config.validate()?;

        let entry = ServiceEntry {
            config,
            fallback: registration.fallback,
            health_check: registration.health_check,
            runtime: CircuitRuntime::default(),
        };

        let replaced = self
            .inner
            .services
            .insert(registration.name.clone(), Arc::new(Mutex::new(entry)))
            .is_some();

        if replaced {
            info!("Replaced registration for service '{}'", registration.name);
        } else {
            info!("Registered service '{}'", registration.name);
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.services.remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.services.contains_key(name)
    }

    fn entry(&self, name: &str) -> ResilienceResult<SharedEntry> {
        self.inner
            .services
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ResilienceError::UnregisteredService(name.to_string()))
    }

    /// Run `operation` under the named service's circuit breaker.
    ///
    /// Failures of the operation never surface as `Err`; they are folded into
    /// the returned [`ExecutionResult`]. The only `Err` is
    /// [`ResilienceError::UnregisteredService`].
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        operation: F,
        fallback: Option<FallbackFn<T>>,
    ) -> ResilienceResult<ExecutionResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let entry = self.entry(name)?;
        let start = Instant::now();

        let (admission, fallback_enabled, registered) = {
            let mut svc = entry.lock();
            let admission = svc.admit(name, start);
            (admission, svc.config.fallback_enabled, svc.fallback.clone())
        };

        let fallback = fallback.or_else(|| {
            let registered = registered?;
            let typed = registered.downcast_ref::<FallbackFn<T>>().cloned();
            if typed.is_none() {
                debug!(
                    "Registered fallback for '{}' does not produce {}; ignoring it",
                    name,
                    std::any::type_name::<T>()
                );
            }
            typed
        });
        let fallback = if fallback_enabled { fallback } else { None };

        if admission == Admission::Rejected {
            debug!("Circuit breaker '{}' rejected call", name);
            let error = ResilienceError::CircuitOpen(name.to_string());
            return Ok(resolve_with_fallback(&entry, fallback, error, start).await);
        }

        let mut probe = ProbeGuard::new(&entry, admission);
        let outcome = match AssertUnwindSafe(async { operation().await }).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(ResilienceError::OperationFailure(panic_message(panic.as_ref()))),
        };
        let elapsed = start.elapsed();
        probe.disarm();

        match outcome {
            Ok(data) => {
                let state = entry.lock().record_success(name, admission, elapsed);
                Ok(ExecutionResult {
                    success: true,
                    data: Some(data),
                    error: None,
                    fallback_used: false,
                    state,
                    execution_time: elapsed,
                })
            }
            Err(error) => {
                entry
                    .lock()
                    .record_failure(name, admission, &error, Instant::now());
                Ok(resolve_with_fallback(&entry, fallback, error, start).await)
            }
        }
    }

    /// Probe every registered health check concurrently. A check that does
    /// not settle within the health-check timeout counts as unhealthy.
    pub async fn perform_health_checks(&self) -> HashMap<String, bool> {
        let checks: Vec<(String, SharedEntry, HealthCheckFn)> = self
            .inner
            .services
            .iter()
            .filter_map(|e| {
                let check = e.value().lock().health_check.clone()?;
                Some((e.key().clone(), e.value().clone(), check))
            })
            .collect();

        let running: Vec<_> = checks
            .into_iter()
            .map(|(name, entry, check)| (name, entry, tokio::spawn(check())))
            .collect();

        let timeout = self.inner.health_check_timeout;
        let deadline = Instant::now() + timeout;
        let mut results = HashMap::new();
        for (name, entry, mut handle) in running {
            let (healthy, message) = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(true))) => (true, None),
                Ok(Ok(Ok(false))) => (false, Some("reported unhealthy".to_string())),
                Ok(Ok(Err(e))) => (false, Some(e.to_string())),
                Ok(Err(e)) => (false, Some(format!("health check aborted: {}", e))),
                Err(_) => {
                    handle.abort();
                    (false, Some(format!("health check timed out after {:?}", timeout)))
                }
            };

            if let Some(message) = &message {
                let failure = ResilienceError::HealthCheckFailure {
                    name: name.clone(),
                    message: message.clone(),
                };
                warn!("{}", failure);
            }

            entry
                .lock()
                .record_health_check(&name, healthy, message, Instant::now());
            results.insert(name, healthy);
        }
        results
    }

    /// Start the periodic health-check task. Returns false if it is already
    /// running or the registry was destroyed.
    pub fn start_health_monitor(&self) -> bool {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return false;
        }

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.health_check_interval;
        self.inner.tasks.spawn_if_absent(HEALTH_MONITOR_TASK, || {
            BackgroundTask::spawn_interval(HEALTH_MONITOR_TASK, interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        CircuitBreakerRegistry { inner }.perform_health_checks().await;
                    }
                }
            })
        })
    }

    /// Number of background tasks currently scheduled
    pub fn active_task_count(&self) -> usize {
        self.inner.tasks.active_count()
    }

    /// Force a service back to closed and zero its counters
    pub fn reset(&self, name: &str) -> ResilienceResult<()> {
        self.entry(name)?.lock().reset();
        info!("Circuit breaker '{}' manually reset", name);
        Ok(())
    }

    /// Merge configuration without touching runtime state
    pub fn update_config(&self, name: &str, update: CircuitBreakerConfigUpdate) -> ResilienceResult<()> {
        let entry = self.entry(name)?;
        let mut svc = entry.lock();
        let merged = svc.config.merged(&update);
        merged.validate()?;
        svc.config = merged;
        debug!("Updated circuit breaker config for '{}'", name);
        Ok(())
    }

    pub fn get_service_status(&self, name: &str) -> Option<ServiceStatus> {
        let entry = self.inner.services.get(name)?.value().clone();
        let status = entry.lock().status(name, Instant::now());
        Some(status)
    }

    pub fn get_all_service_statuses(&self) -> Vec<ServiceStatus> {
        let now = Instant::now();
        let mut statuses: Vec<ServiceStatus> = self
            .inner
            .services
            .iter()
            .map(|e| e.value().lock().status(e.key(), now))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names of services whose circuit is currently open or half-open
    pub fn unhealthy_services(&self) -> Vec<String> {
        self.get_all_service_statuses()
            .into_iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| s.name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.services.is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Stop background work and clear every registration. Later `register`
    /// calls fail with `Shutdown`. Idempotent.
    pub async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        let stopped = self.inner.tasks.stop_all().await;
        let had_services = !self.inner.services.is_empty();
        self.inner.services.clear();
        if stopped > 0 || had_services {
            info!("Circuit breaker registry destroyed");
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

async fn resolve_with_fallback<T>(
    entry: &SharedEntry,
    fallback: Option<FallbackFn<T>>,
    error: ResilienceError,
    start: Instant,
) -> ExecutionResult<T> {
    let (success, data, error, fallback_used) = match fallback {
        Some(fallback) => match fallback().await {
            Ok(data) => (true, Some(data), error, true),
            Err(fallback_error) => (
                false,
                None,
                ResilienceError::FallbackFailure(format!(
                    "{} (original error: {})",
                    fallback_error, error
                )),
                true,
            ),
        },
        None => (false, None, error, false),
    };

    ExecutionResult {
        success,
        data,
        error: Some(error),
        fallback_used,
        state: entry.lock().runtime.state,
        execution_time: start.elapsed(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("operation panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("operation panicked: {}", msg)
    } else {
        "operation panicked".to_string()
    }
}
