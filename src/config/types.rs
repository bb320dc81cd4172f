use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::pool::PoolConfig;
use crate::monitor::MonitorConfig;
use crate::realtime::RealtimeConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, Default)]
pub struct ResilienceConfig {
    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolSettings,
    #[serde(default)]
    #[validate(nested)]
    pub realtime: RealtimeSettings,
    #[serde(default)]
    #[validate(nested)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults applied to every `register` call that does not bring its own
/// configuration, plus the registry's health-check cadence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[validate(range(min = 1))]
    pub recovery_timeout_ms: u64,
    pub fallback_enabled: bool,
    pub expected_error_patterns: Vec<String>,
    #[validate(range(min = 100))]
    pub health_check_interval_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            fallback_enabled: true,
            expected_error_patterns: Vec::new(),
            health_check_interval_ms: 30_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            fallback_enabled: self.fallback_enabled,
            expected_error_patterns: self.expected_error_patterns.clone(),
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct PoolSettings {
    #[validate(range(min = 1))]
    pub max_connections: usize,
    #[validate(range(min = 1))]
    pub idle_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub connection_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_queue_size: usize,
    #[validate(range(min = 100))]
    pub health_check_interval_ms: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub error_rate_threshold: f64,
    #[validate(range(min = 1))]
    pub slow_response_threshold_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout_ms: 300_000,
            connection_timeout_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 100,
            max_queue_size: 100,
            health_check_interval_ms: 30_000,
            error_rate_threshold: 0.1,
            slow_response_threshold_ms: 1_000,
        }
    }
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            retry_attempts: self.retry_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_queue_size: self.max_queue_size,
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            error_rate_threshold: self.error_rate_threshold,
            slow_response_threshold: Duration::from_millis(self.slow_response_threshold_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct RealtimeSettings {
    #[validate(range(min = 1))]
    pub max_subscriptions: usize,
    /// Multiplex batchable subscriptions onto shared channels
    pub batching_enabled: bool,
    #[validate(range(min = 1))]
    pub inactivity_timeout_ms: u64,
    #[validate(range(min = 100))]
    pub activity_check_interval_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            max_subscriptions: 100,
            batching_enabled: true,
            inactivity_timeout_ms: 300_000,
            activity_check_interval_ms: 30_000,
        }
    }
}

impl RealtimeSettings {
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            max_subscriptions: self.max_subscriptions,
            batching_enabled: self.batching_enabled,
            inactivity_timeout: Duration::from_millis(self.inactivity_timeout_ms),
            activity_check_interval: Duration::from_millis(self.activity_check_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct MonitorSettings {
    #[validate(range(min = 1))]
    pub slow_query_threshold_ms: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub high_error_rate: f64,
    #[validate(range(min = 1))]
    pub max_recommended_subscriptions: usize,
    #[validate(range(min = 0.0, max = 1.0))]
    pub connection_pressure_ratio: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 1_000,
            high_error_rate: 0.05,
            max_recommended_subscriptions: 20,
            connection_pressure_ratio: 0.8,
        }
    }
}

impl MonitorSettings {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            slow_query_threshold: Duration::from_millis(self.slow_query_threshold_ms),
            high_error_rate: self.high_error_rate,
            max_recommended_subscriptions: self.max_recommended_subscriptions,
            connection_pressure_ratio: self.connection_pressure_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `bulwark=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::utils::errors::ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(crate::utils::errors::ResilienceError::Config(format!(
                "Unknown log format: {}",
                s
            ))),
        }
    }
}
