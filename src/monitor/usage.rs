//! Resource usage metrics and optimization suggestions
//!
//! Collects counters emitted by the connection pool and the subscription
//! manager. It never makes control-flow decisions; callers read snapshots
//! and suggestions.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum number of queries before error-rate suggestions are made
const MIN_QUERIES_FOR_ERROR_RATE: u64 = 10;
/// Subscriptions above which a 1:1 channel mapping is worth flagging
const MULTIPLEX_HINT_SUBSCRIPTIONS: u64 = 5;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub slow_query_threshold: Duration,
    pub high_error_rate: f64,
    pub max_recommended_subscriptions: usize,
    /// Peak connection utilisation that triggers a capacity suggestion
    pub connection_pressure_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_secs(1),
            high_error_rate: 0.05,
            max_recommended_subscriptions: 20,
            connection_pressure_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionCategory {
    Connections,
    Queries,
    Subscriptions,
    Realtime,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationSuggestion {
    pub category: SuggestionCategory,
    pub severity: Severity,
    pub message: String,
}

/// Per-label query statistics
#[derive(Debug, Default)]
pub struct LabelStats {
    count: AtomicU64,
    failures: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LabelStats {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn average_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.total_ms.load(Ordering::SeqCst) as f64 / count as f64
        }
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub uptime_seconds: u64,
    pub queries_total: u64,
    pub queries_failed: u64,
    pub slow_queries: u64,
    pub average_query_ms: f64,
    pub error_rate: f64,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub max_connections: u64,
    pub queue_rejections: u64,
    pub active_subscriptions: u64,
    pub peak_subscriptions: u64,
    pub realtime_channels: u64,
    pub realtime_events: u64,
    pub callback_errors: u64,
}

/// Usage collector shared by the pool and the subscription manager
pub struct ResourceUsageMonitor {
    config: MonitorConfig,
    queries_total: AtomicU64,
    queries_failed: AtomicU64,
    slow_queries: AtomicU64,
    query_time_ms: AtomicU64,
    queries_by_label: DashMap<String, LabelStats>,
    active_connections: AtomicU64,
    peak_connections: AtomicU64,
    max_connections: AtomicU64,
    queue_rejections: AtomicU64,
    active_subscriptions: AtomicU64,
    peak_subscriptions: AtomicU64,
    realtime_channels: AtomicU64,
    realtime_events: AtomicU64,
    callback_errors: AtomicU64,
    start_time: Instant,
}

impl ResourceUsageMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            queries_total: AtomicU64::new(0),
            queries_failed: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            query_time_ms: AtomicU64::new(0),
            queries_by_label: DashMap::new(),
            active_connections: AtomicU64::new(0),
            peak_connections: AtomicU64::new(0),
            max_connections: AtomicU64::new(0),
            queue_rejections: AtomicU64::new(0),
            active_subscriptions: AtomicU64::new(0),
            peak_subscriptions: AtomicU64::new(0),
            realtime_channels: AtomicU64::new(0),
            realtime_events: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record one finished pool operation
    pub fn record_query(&self, label: &str, duration: Duration, success: bool) {
        let ms = duration.as_millis() as u64;
        self.queries_total.fetch_add(1, Ordering::SeqCst);
        self.query_time_ms.fetch_add(ms, Ordering::SeqCst);
        if !success {
            self.queries_failed.fetch_add(1, Ordering::SeqCst);
        }
        if duration >= self.config.slow_query_threshold {
            self.slow_queries.fetch_add(1, Ordering::SeqCst);
        }

        let stats = self.queries_by_label.entry(label.to_string()).or_default();
        stats.count.fetch_add(1, Ordering::SeqCst);
        stats.total_ms.fetch_add(ms, Ordering::SeqCst);
        stats.max_ms.fetch_max(ms, Ordering::SeqCst);
        if !success {
            stats.failures.fetch_add(1, Ordering::SeqCst);
        }

        debug!("Query recorded: label={}, duration={}ms, success={}", label, ms, success);
    }

    pub fn set_active_connections(&self, active: usize, max: usize) {
        self.active_connections.store(active as u64, Ordering::SeqCst);
        self.max_connections.store(max as u64, Ordering::SeqCst);
        self.peak_connections.fetch_max(active as u64, Ordering::SeqCst);
    }

    pub fn record_queue_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_subscription_counts(&self, subscriptions: usize, channels: usize) {
        self.active_subscriptions.store(subscriptions as u64, Ordering::SeqCst);
        self.realtime_channels.store(channels as u64, Ordering::SeqCst);
        self.peak_subscriptions.fetch_max(subscriptions as u64, Ordering::SeqCst);
    }

    pub fn record_realtime_event(&self) {
        self.realtime_events.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_callback_error(&self) {
        self.callback_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Statistics for one query label, if any were recorded
    pub fn label_stats(&self, label: &str) -> Option<(u64, u64, f64)> {
        self.queries_by_label
            .get(label)
            .map(|s| (s.count(), s.failures(), s.average_ms()))
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let queries_total = self.queries_total.load(Ordering::SeqCst);
        let queries_failed = self.queries_failed.load(Ordering::SeqCst);
        let query_time_ms = self.query_time_ms.load(Ordering::SeqCst);

        UsageSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            queries_total,
            queries_failed,
            slow_queries: self.slow_queries.load(Ordering::SeqCst),
            average_query_ms: if queries_total == 0 {
                0.0
            } else {
                query_time_ms as f64 / queries_total as f64
            },
            error_rate: if queries_total == 0 {
                0.0
            } else {
                queries_failed as f64 / queries_total as f64
            },
            active_connections: self.active_connections.load(Ordering::SeqCst),
            peak_connections: self.peak_connections.load(Ordering::SeqCst),
            max_connections: self.max_connections.load(Ordering::SeqCst),
            queue_rejections: self.queue_rejections.load(Ordering::SeqCst),
            active_subscriptions: self.active_subscriptions.load(Ordering::SeqCst),
            peak_subscriptions: self.peak_subscriptions.load(Ordering::SeqCst),
            realtime_channels: self.realtime_channels.load(Ordering::SeqCst),
            realtime_events: self.realtime_events.load(Ordering::SeqCst),
            callback_errors: self.callback_errors.load(Ordering::SeqCst),
        }
    }

    /// Suggestions ordered from most to least severe
    pub fn optimization_suggestions(&self) -> Vec<OptimizationSuggestion> {
        let snap = self.snapshot();
        let mut suggestions = Vec::new();

        if snap.max_connections > 0 {
            let peak_ratio = snap.peak_connections as f64 / snap.max_connections as f64;
            if peak_ratio >= self.config.connection_pressure_ratio {
                suggestions.push(OptimizationSuggestion {
                    category: SuggestionCategory::Connections,
                    severity: Severity::Medium,
                    message: format!(
                        "Connection usage peaked at {}/{}; consider raising max_connections or spreading load",
                        snap.peak_connections, snap.max_connections
                    ),
                });
            }
        }

        if snap.queue_rejections > 0 {
            suggestions.push(OptimizationSuggestion {
                category: SuggestionCategory::Connections,
                severity: Severity::High,
                message: format!(
                    "{} requests were rejected because the queue was full; raise max_queue_size or reduce burst load",
                    snap.queue_rejections
                ),
            });
        }

        if snap.queries_total >= MIN_QUERIES_FOR_ERROR_RATE && snap.error_rate > self.config.high_error_rate {
            suggestions.push(OptimizationSuggestion {
                category: SuggestionCategory::Queries,
                severity: Severity::High,
                message: format!(
                    "Query error rate is {:.1}%; check the backend or wrap it in a circuit breaker",
                    snap.error_rate * 100.0
                ),
            });
        }

        let slow_ms = self.config.slow_query_threshold.as_millis() as f64;
        let mut slow_labels: Vec<(String, f64)> = self
            .queries_by_label
            .iter()
            .filter(|e| e.value().average_ms() >= slow_ms)
            .map(|e| (e.key().clone(), e.value().average_ms()))
            .collect();
        slow_labels.sort_by(|a, b| a.0.cmp(&b.0));
        for (label, avg) in slow_labels {
            suggestions.push(OptimizationSuggestion {
                category: SuggestionCategory::Queries,
                severity: Severity::Medium,
                message: format!(
                    "Query '{}' averages {:.0}ms; consider caching, pagination or an index",
                    label, avg
                ),
            });
        }

        if snap.active_subscriptions as usize > self.config.max_recommended_subscriptions {
            suggestions.push(OptimizationSuggestion {
                category: SuggestionCategory::Subscriptions,
                severity: Severity::Medium,
                message: format!(
                    "{} realtime subscriptions are active (recommended at most {}); lower priorities or unsubscribe unused views",
                    snap.active_subscriptions, self.config.max_recommended_subscriptions
                ),
            });
        }

        if snap.active_subscriptions >= MULTIPLEX_HINT_SUBSCRIPTIONS
            && snap.realtime_channels >= snap.active_subscriptions
        {
            suggestions.push(OptimizationSuggestion {
                category: SuggestionCategory::Subscriptions,
                severity: Severity::Low,
                message: "Every subscription holds its own channel; mark subscriptions on the same table as batchable".to_string(),
            });
        }

        if snap.callback_errors > 0 {
            suggestions.push(OptimizationSuggestion {
                category: SuggestionCategory::Realtime,
                severity: Severity::Low,
                message: format!("{} subscription callbacks failed", snap.callback_errors),
            });
        }

        suggestions.sort_by(|a, b| b.severity.cmp(&a.severity));
        suggestions
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        let gauges: [(&str, &str, &str, String); 10] = [
            ("bulwark_queries_total", "counter", "Total pool operations", snap.queries_total.to_string()),
            ("bulwark_queries_failed_total", "counter", "Failed pool operations", snap.queries_failed.to_string()),
            ("bulwark_slow_queries_total", "counter", "Pool operations above the slow threshold", snap.slow_queries.to_string()),
            ("bulwark_query_duration_ms", "gauge", "Average pool operation duration in milliseconds", format!("{:.2}", snap.average_query_ms)),
            ("bulwark_active_connections", "gauge", "Pool slots currently in use", snap.active_connections.to_string()),
            ("bulwark_queue_rejections_total", "counter", "Requests rejected by a full queue", snap.queue_rejections.to_string()),
            ("bulwark_active_subscriptions", "gauge", "Live realtime subscriptions", snap.active_subscriptions.to_string()),
            ("bulwark_realtime_channels", "gauge", "Open transport channels", snap.realtime_channels.to_string()),
            ("bulwark_realtime_events_total", "counter", "Realtime events delivered", snap.realtime_events.to_string()),
            ("bulwark_callback_errors_total", "counter", "Failed subscription callbacks", snap.callback_errors.to_string()),
        ];

        for (name, kind, help, value) in gauges.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} {}\n", name, kind));
            output.push_str(&format!("{} {}\n", name, value));
        }

        output.push_str("# HELP bulwark_queries_by_label Pool operations by label\n");
        output.push_str("# TYPE bulwark_queries_by_label counter\n");
        for entry in self.queries_by_label.iter() {
            output.push_str(&format!(
                "bulwark_queries_by_label{{label=\"{}\"}} {}\n",
                entry.key(),
                entry.value().count()
            ));
        }

        output
    }

    /// Export metrics in JSON format
    pub fn export_json(&self) -> serde_json::Value {
        let mut labels = serde_json::Map::new();
        for entry in self.queries_by_label.iter() {
            labels.insert(
                entry.key().clone(),
                serde_json::json!({
                    "count": entry.value().count(),
                    "failures": entry.value().failures(),
                    "average_ms": entry.value().average_ms(),
                    "max_ms": entry.value().max_ms(),
                }),
            );
        }

        serde_json::json!({
            "usage": self.snapshot(),
            "queries_by_label": labels,
            "suggestions": self.optimization_suggestions(),
        })
    }

    /// Zero every counter; gauges are left as they are
    pub fn reset(&self) {
        for counter in [
            &self.queries_total,
            &self.queries_failed,
            &self.slow_queries,
            &self.query_time_ms,
            &self.queue_rejections,
            &self.realtime_events,
            &self.callback_errors,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.peak_connections
            .store(self.active_connections.load(Ordering::SeqCst), Ordering::SeqCst);
        self.peak_subscriptions
            .store(self.active_subscriptions.load(Ordering::SeqCst), Ordering::SeqCst);
        self.queries_by_label.clear();
    }
}

impl Default for ResourceUsageMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
