//! Realtime Subscription Manager
//!
//! Owns the lifecycle of logical subscriptions. Batchable subscriptions on the
//! same table and event share one transport channel; every other subscription
//! gets a dedicated channel. Each logical subscription keeps its own callback,
//! and a failing callback never affects the others.
//!
//! Lifecycle operations (subscribe, unsubscribe, activity changes, destroy)
//! are serialized by an async lock because they await the transport. The
//! bookkeeping itself lives behind a synchronous lock so that delivery and
//! the read-only getters never wait on transport I/O.

use super::activity::{ActivityLevel, ActivityTracker, Priority};
use super::transport::{ChannelHandle, ChannelTopic, EventFilter, EventHandler, RealtimeEvent, RealtimeTransport};
use super::RealtimeConfig;
use crate::monitor::ResourceUsageMonitor;
use crate::utils::errors::{ResilienceError, ResilienceResult};
use crate::utils::tasks::{BackgroundTask, TaskGroup};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

const INACTIVITY_TASK: &str = "realtime-inactivity";
/// Share of `max_subscriptions` above which health reports a warning
const SUBSCRIPTION_PRESSURE_RATIO: f64 = 0.9;
const MIN_EVENTS_FOR_ERROR_RATE: u64 = 10;
const CALLBACK_ERROR_RATE_THRESHOLD: f64 = 0.1;

/// Callback invoked for every event delivered to a subscription
pub type SubscriptionCallback = Arc<dyn Fn(&RealtimeEvent) -> ResilienceResult<()> + Send + Sync>;

pub fn subscription_callback<F>(f: F) -> SubscriptionCallback
where
    F: Fn(&RealtimeEvent) -> ResilienceResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
pub struct SubscriptionConfig {
    pub id: String,
    pub table: String,
    pub event: EventFilter,
    pub callback: SubscriptionCallback,
    pub priority: Priority,
    pub batchable: bool,
}

impl SubscriptionConfig {
    pub fn new(id: impl Into<String>, table: impl Into<String>, callback: SubscriptionCallback) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            event: EventFilter::All,
            callback,
            priority: Priority::Medium,
            batchable: false,
        }
    }

    pub fn event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn batchable(mut self, batchable: bool) -> Self {
        self.batchable = batchable;
        self
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("batchable", &self.batchable)
            .finish()
    }
}

/// Observable record of one logical subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub table: String,
    pub event: EventFilter,
    pub priority: Priority,
    pub batchable: bool,
    pub created_at: DateTime<Utc>,
    pub suspended: bool,
    pub channel: String,
    pub events_delivered: u64,
    pub callback_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMetrics {
    pub activity_level: ActivityLevel,
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
    pub suspended_subscriptions: usize,
    pub channel_count: usize,
    pub events_delivered: u64,
    pub callback_errors: u64,
    pub subscriptions: Vec<SubscriptionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeHealthStatus {
    pub is_healthy: bool,
    pub issues: Vec<String>,
    pub activity_level: ActivityLevel,
    pub active_subscriptions: usize,
    pub channel_count: usize,
    pub destroyed: bool,
}

/// Identity of a transport channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    topic: ChannelTopic,
    /// Owning subscription id for non-shared channels
    dedicated: Option<String>,
}

impl ChannelKey {
    fn for_subscription(config: &SubscriptionConfig, batching_enabled: bool) -> Self {
        let dedicated = if batching_enabled && config.batchable {
            None
        } else {
            Some(config.id.clone())
        };
        Self {
            topic: ChannelTopic::new(config.table.clone(), config.event),
            dedicated,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dedicated {
            Some(id) => write!(f, "realtime:{}#{}", self.topic, id),
            None => write!(f, "realtime:{}", self.topic),
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    errors: AtomicU64,
}

#[derive(Clone)]
struct Route {
    id: String,
    callback: SubscriptionCallback,
    stats: Arc<DeliveryStats>,
}

impl Route {
    fn deliver(&self, event: &RealtimeEvent, monitor: Option<&ResourceUsageMonitor>) {
        self.stats.delivered.fetch_add(1, Ordering::SeqCst);
        if let Some(monitor) = monitor {
            monitor.record_realtime_event();
        }

        let failure = match catch_unwind(AssertUnwindSafe(|| (self.callback)(event))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        self.stats.errors.fetch_add(1, Ordering::SeqCst);
        let error = ResilienceError::SubscriptionCallback {
            id: self.id.clone(),
            message: failure,
        };
        warn!("{}", error);
        if let Some(monitor) = monitor {
            monitor.record_callback_error();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("callback panicked: {}", msg)
    } else {
        "callback panicked".to_string()
    }
}

type RouteTable = Arc<RwLock<Vec<Route>>>;

struct Channel {
    handle: ChannelHandle,
    routes: RouteTable,
}

struct SubscriptionRecord {
    table: String,
    event: EventFilter,
    priority: Priority,
    batchable: bool,
    created_at: DateTime<Utc>,
    key: ChannelKey,
    route: Route,
    suspended: bool,
}

impl SubscriptionRecord {
    fn info(&self, id: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            id: id.to_string(),
            table: self.table.clone(),
            event: self.event,
            priority: self.priority,
            batchable: self.batchable,
            created_at: self.created_at,
            suspended: self.suspended,
            channel: self.key.to_string(),
            events_delivered: self.route.stats.delivered.load(Ordering::SeqCst),
            callback_errors: self.route.stats.errors.load(Ordering::SeqCst),
        }
    }
}

struct ManagerState {
    subscriptions: HashMap<String, SubscriptionRecord>,
    channels: HashMap<ChannelKey, Channel>,
    activity: ActivityTracker,
}

impl ManagerState {
    fn live_count(&self) -> usize {
        self.subscriptions.values().filter(|s| !s.suspended).count()
    }

    fn infos(&self, filter: impl Fn(&SubscriptionRecord) -> bool) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .subscriptions
            .iter()
            .filter(|(_, record)| filter(record))
            .map(|(id, record)| record.info(id))
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }
}

struct ManagerInner {
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<ManagerState>,
    monitor: Option<Arc<ResourceUsageMonitor>>,
    tasks: TaskGroup,
    destroyed: AtomicBool,
}

// Methods below expect the caller to hold `lifecycle`.
impl ManagerInner {
    fn channel_handler(&self, routes: RouteTable) -> EventHandler {
        let monitor = self.monitor.clone();
        Arc::new(move |event: RealtimeEvent| {
            let targets: Vec<Route> = routes.read().clone();
            for route in &targets {
                route.deliver(&event, monitor.as_deref());
            }
        })
    }

    /// Add `route` to the channel for `key`, opening the channel if needed
    async fn attach(&self, key: &ChannelKey, route: Route) -> ResilienceResult<()> {
        {
            let state = self.state.lock();
            if let Some(channel) = state.channels.get(key) {
                channel.routes.write().push(route);
                debug!("Subscription joined existing channel {}", key);
                return Ok(());
            }
        }

        let routes: RouteTable = Arc::new(RwLock::new(vec![route]));
        let handler = self.channel_handler(routes.clone());
        let handle = self.transport.subscribe(&key.topic, handler).await?;
        info!("Realtime channel opened: {}", key);
        self.state.lock().channels.insert(key.clone(), Channel { handle, routes });
        Ok(())
    }

    /// Remove subscription `id` from its channel, closing the channel when it
    /// was the last subscriber
    async fn detach(&self, key: &ChannelKey, id: &str) {
        let closed = {
            let mut state = self.state.lock();
            let empty = match state.channels.get(key) {
                Some(channel) => {
                    let mut routes = channel.routes.write();
                    routes.retain(|r| r.id != id);
                    routes.is_empty()
                }
                None => false,
            };
            if empty {
                state.channels.remove(key)
            } else {
                None
            }
        };

        if let Some(channel) = closed {
            match self.transport.unsubscribe(channel.handle).await {
                Ok(()) => info!("Realtime channel closed: {}", key),
                Err(e) => warn!("Failed to close realtime channel {}: {}", key, e),
            }
        }
    }

    fn set_suspended(&self, id: &str, suspended: bool) {
        if let Some(record) = self.state.lock().subscriptions.get_mut(id) {
            record.suspended = suspended;
        }
    }

    fn report_counts(&self) {
        if let Some(monitor) = &self.monitor {
            let state = self.state.lock();
            monitor.set_subscription_counts(state.live_count(), state.channels.len());
        }
    }

    async fn apply_activity(&self, level: ActivityLevel) {
        let plan: Vec<(String, ChannelKey, Route, bool)> = {
            let mut state = self.state.lock();
            if let Some(previous) = state.activity.set(level) {
                info!("Activity level changed: {} -> {}", previous, level);
            }

            // Entries whose liveness disagrees with the level; true means resume.
            // Rebuilt on every call so a resume that failed earlier is retried.
            let mut plan: Vec<_> = state
                .subscriptions
                .iter()
                .filter_map(|(id, record)| {
                    let keep = level.keeps(record.priority);
                    (keep == record.suspended).then(|| (id.clone(), record.key.clone(), record.route.clone(), keep))
                })
                .collect();
            plan.sort_by(|a, b| a.0.cmp(&b.0));
            plan
        };

        let (mut suspended, mut resumed) = (0usize, 0usize);
        for (id, key, route, resume) in plan {
            if resume {
                match self.attach(&key, route).await {
                    Ok(()) => {
                        self.set_suspended(&id, false);
                        resumed += 1;
                    }
                    Err(e) => warn!("Failed to resume subscription {}, will retry on next activity update: {}", id, e),
                }
            } else {
                self.detach(&key, &id).await;
                self.set_suspended(&id, true);
                suspended += 1;
            }
        }

        if suspended + resumed > 0 {
            info!(
                "Activity {}: {} subscriptions suspended, {} resumed",
                level, suspended, resumed
            );
        }
        self.report_counts();
    }

    async fn check_inactivity(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let (level, idle) = {
            let state = self.state.lock();
            (state.activity.level(), state.activity.idle_for())
        };
        if level != ActivityLevel::Inactive && idle >= self.config.inactivity_timeout {
            info!("No user activity for {:?}, switching to inactive mode", idle);
            self.apply_activity(ActivityLevel::Inactive).await;
        }
    }

    /// Drop every subscription and close every channel
    async fn teardown(&self) -> usize {
        let (removed, channels) = {
            let mut state = self.state.lock();
            let removed = state.subscriptions.len();
            state.subscriptions.clear();
            let channels: Vec<(ChannelKey, Channel)> = state.channels.drain().collect();
            (removed, channels)
        };

        let closed = channels.len();
        for (key, channel) in channels {
            if let Err(e) = self.transport.unsubscribe(channel.handle).await {
                warn!("Failed to close realtime channel {}: {}", key, e);
            }
        }

        if removed > 0 || closed > 0 {
            info!("Removed {} subscriptions and closed {} channels", removed, closed);
        }
        self.report_counts();
        removed
    }
}

/// Manages logical push subscriptions over an injected transport
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: RealtimeConfig) -> ResilienceResult<Self> {
        Self::build(transport, config, None)
    }

    /// Create a manager that reports subscription counts to `monitor`
    pub fn with_monitor(
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
        monitor: Arc<ResourceUsageMonitor>,
    ) -> ResilienceResult<Self> {
        Self::build(transport, config, Some(monitor))
    }

    fn build(
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
        monitor: Option<Arc<ResourceUsageMonitor>>,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(ManagerState {
                    subscriptions: HashMap::new(),
                    channels: HashMap::new(),
                    activity: ActivityTracker::new(),
                }),
                monitor,
                tasks: TaskGroup::new(),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Register a subscription. Returns `Ok(true)` when a new subscription was
    /// created and `Ok(false)` when `id` already existed, in which case only
    /// its callback is replaced and no channel is opened.
    pub async fn subscribe(&self, config: SubscriptionConfig) -> ResilienceResult<bool> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(ResilienceError::Shutdown);
        }
        if config.id.trim().is_empty() {
            return Err(ResilienceError::Validation("subscription id must not be empty".to_string()));
        }
        if config.table.trim().is_empty() {
            return Err(ResilienceError::Validation("subscription table must not be empty".to_string()));
        }

        let level = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            if let Some(existing) = state.subscriptions.get_mut(&config.id) {
                existing.route.callback = config.callback.clone();
                if let Some(channel) = state.channels.get(&existing.key) {
                    for route in channel.routes.write().iter_mut().filter(|r| r.id == config.id) {
                        route.callback = config.callback.clone();
                    }
                }
                if existing.table != config.table || existing.event != config.event {
                    warn!(
                        "Subscription {} already exists on {}; keeping the original channel",
                        config.id, existing.key
                    );
                } else {
                    debug!("Subscription {} already registered, callback updated", config.id);
                }
                return Ok(false);
            }

            if state.subscriptions.len() >= inner.config.max_subscriptions {
                warn!(
                    "Rejecting subscription {}: limit of {} reached",
                    config.id, inner.config.max_subscriptions
                );
                return Err(ResilienceError::SubscriptionLimit(inner.config.max_subscriptions));
            }
            state.activity.level()
        };

        let key = ChannelKey::for_subscription(&config, inner.config.batching_enabled);
        let route = Route {
            id: config.id.clone(),
            callback: config.callback.clone(),
            stats: Arc::default(),
        };
        let live = level.keeps(config.priority);
        if live {
            inner.attach(&key, route.clone()).await?;
        }

        info!(
            "Subscribed {} to {} (priority {}{})",
            config.id,
            key,
            config.priority,
            if live { "" } else { ", suspended" }
        );
        inner.state.lock().subscriptions.insert(
            config.id.clone(),
            SubscriptionRecord {
                table: config.table,
                event: config.event,
                priority: config.priority,
                batchable: config.batchable,
                created_at: Utc::now(),
                key,
                route,
                suspended: !live,
            },
        );
        inner.report_counts();
        Ok(true)
    }

    /// Remove one subscription. Unknown ids are a no-op returning false.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let record = inner.state.lock().subscriptions.remove(id);
        let Some(record) = record else {
            debug!("Unsubscribe ignored for unknown subscription {}", id);
            return false;
        };

        if !record.suspended {
            inner.detach(&record.key, id).await;
        }
        info!("Unsubscribed {}", id);
        inner.report_counts();
        true
    }

    /// Remove every subscription. Returns how many were removed.
    pub async fn unsubscribe_all(&self) -> usize {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown().await
    }

    /// Stop background tasks and remove every subscription. Later subscribe
    /// calls fail with `Shutdown`. Idempotent.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let stopped = inner.tasks.stop_all().await;
        let _lifecycle = inner.lifecycle.lock().await;
        let removed = inner.teardown().await;
        info!(
            "Subscription manager destroyed ({} subscriptions removed, {} tasks stopped)",
            removed, stopped
        );
    }

    /// Report user activity; restores every suspended subscription
    pub async fn update_user_activity(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.state.lock().activity.touch();
        self.inner.apply_activity(ActivityLevel::Active).await;
    }

    /// Suspend low-priority subscriptions
    pub async fn set_background_mode(&self) {
        self.set_level(ActivityLevel::Background).await;
    }

    /// Suspend everything except high-priority subscriptions
    pub async fn set_inactive_mode(&self) {
        self.set_level(ActivityLevel::Inactive).await;
    }

    async fn set_level(&self, level: ActivityLevel) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.apply_activity(level).await;
    }

    pub fn activity_level(&self) -> ActivityLevel {
        self.inner.state.lock().activity.level()
    }

    /// Start the task that demotes the activity level to inactive after
    /// `inactivity_timeout` without reported activity. Returns false if it is
    /// already running or the manager was destroyed.
    pub fn start_activity_monitor(&self) -> bool {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return false;
        }

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.activity_check_interval;
        self.inner.tasks.spawn_if_absent(INACTIVITY_TASK, || {
            BackgroundTask::spawn_interval(INACTIVITY_TASK, period, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.check_inactivity().await;
                    }
                }
            })
        })
    }

    pub fn active_task_count(&self) -> usize {
        self.inner.tasks.active_count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Subscriptions currently attached to a transport channel
    pub fn get_active_subscription_count(&self) -> usize {
        self.inner.state.lock().live_count()
    }

    /// Registered subscriptions, suspended ones included
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    pub fn get_active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.state.lock().infos(|record| !record.suspended)
    }

    pub fn get_metrics(&self) -> RealtimeMetrics {
        let state = self.inner.state.lock();
        let subscriptions = state.infos(|_| true);
        let active = state.live_count();

        RealtimeMetrics {
            activity_level: state.activity.level(),
            total_subscriptions: subscriptions.len(),
            active_subscriptions: active,
            suspended_subscriptions: subscriptions.len() - active,
            channel_count: state.channels.len(),
            events_delivered: subscriptions.iter().map(|s| s.events_delivered).sum(),
            callback_errors: subscriptions.iter().map(|s| s.callback_errors).sum(),
            subscriptions,
        }
    }

    pub fn get_health_status(&self) -> RealtimeHealthStatus {
        let metrics = self.get_metrics();
        let destroyed = self.is_destroyed();
        let mut issues = Vec::new();

        if destroyed {
            issues.push("Subscription manager has been destroyed".to_string());
        }

        let limit = self.inner.config.max_subscriptions;
        if metrics.total_subscriptions as f64 >= limit as f64 * SUBSCRIPTION_PRESSURE_RATIO {
            issues.push(format!(
                "Subscription count near limit: {}/{}",
                metrics.total_subscriptions, limit
            ));
        }

        if metrics.events_delivered >= MIN_EVENTS_FOR_ERROR_RATE {
            let error_rate = metrics.callback_errors as f64 / metrics.events_delivered as f64;
            if error_rate > CALLBACK_ERROR_RATE_THRESHOLD {
                issues.push(format!("High callback error rate: {:.1}%", error_rate * 100.0));
            }
        }

        RealtimeHealthStatus {
            is_healthy: issues.is_empty(),
            issues,
            activity_level: metrics.activity_level,
            active_subscriptions: metrics.active_subscriptions,
            channel_count: metrics.channel_count,
            destroyed,
        }
    }
}
