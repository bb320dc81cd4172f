//! Realtime subscription management
//!
//! Logical push subscriptions are multiplexed onto channels of an injected
//! [`RealtimeTransport`] and scaled down as the host application's activity
//! level drops.

pub mod activity;
pub mod manager;
pub mod transport;

pub use activity::{ActivityLevel, ActivityTracker, Priority};
pub use manager::{
    subscription_callback, RealtimeHealthStatus, RealtimeMetrics, SubscriptionCallback, SubscriptionConfig,
    SubscriptionInfo, SubscriptionManager,
};
pub use transport::{
    ChangeKind, ChannelHandle, ChannelTopic, EventFilter, EventHandler, InMemoryTransport, RealtimeEvent,
    RealtimeTransport,
};

use crate::utils::errors::{ResilienceError, ResilienceResult};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub max_subscriptions: usize,
    /// Share one channel between batchable subscriptions on the same table and event
    pub batching_enabled: bool,
    /// Idle time after which the activity level drops to inactive
    pub inactivity_timeout: Duration,
    pub activity_check_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 100,
            batching_enabled: true,
            inactivity_timeout: Duration::from_secs(300),
            activity_check_interval: Duration::from_secs(30),
        }
    }
}

impl RealtimeConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_subscriptions == 0 {
            return Err(ResilienceError::Config(
                "max_subscriptions must be at least 1".to_string(),
            ));
        }
        if self.inactivity_timeout.is_zero() {
            return Err(ResilienceError::Config(
                "inactivity_timeout must be greater than zero".to_string(),
            ));
        }
        if self.activity_check_interval.is_zero() {
            return Err(ResilienceError::Config(
                "activity_check_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
