//! Retry logic with exponential backoff

use crate::utils::errors::ResilienceResult;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound for a single backoff delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made. The closure receives the
/// 1-based attempt number and must build a fresh future each time.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> ResilienceResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ResilienceResult<T>>,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!("'{}' succeeded on attempt {}/{}", label, attempt, policy.max_attempts);
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                debug!("'{}' failed with non-retryable error: {}", label, e);
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!("'{}' failed after {} attempts: {}", label, attempt, e);
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay_before(attempt);
                warn!(
                    "'{}' failed ({}), retry attempt {} of {} after {:?}",
                    label, e, attempt, policy.max_attempts, delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
