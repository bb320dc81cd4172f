//! Bulwark: client-side resilience for unreliable backends
//!
//! Three cooperating components guard calls into remote dependencies:
//!
//! - [`CircuitBreakerRegistry`] fast-fails calls to a dependency that keeps failing
//! - [`ConnectionPoolManager`] bounds in-flight work with a FIFO queue, timeouts and retry
//! - [`SubscriptionManager`] multiplexes push subscriptions and scales them with user activity
//!
//! A [`ResourceUsageMonitor`] passively collects usage from the pool and the
//! subscription manager.

pub mod config;
pub mod core;
pub mod monitor;
pub mod realtime;
pub mod utils;

pub use crate::config::ResilienceConfig;
pub use crate::core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ConnectionPoolManager, ExecutionResult, PoolConfig,
    ServiceRegistration,
};
pub use crate::monitor::ResourceUsageMonitor;
pub use crate::realtime::{RealtimeConfig, SubscriptionConfig, SubscriptionManager};
pub use crate::utils::errors::{ResilienceError, ResilienceResult};
