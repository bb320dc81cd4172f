pub mod circuit_breaker;
pub mod pool;
pub mod retry;

pub use circuit_breaker::{
    fallback_fn, CircuitBreakerConfig, CircuitBreakerConfigUpdate, CircuitBreakerRegistry, CircuitState,
    ExecutionResult, FallbackFn, HealthCheckFn, HealthCheckRecord, ServiceRegistration, ServiceStatus,
};
pub use pool::{ConnectionPoolManager, PoolConfig, PoolHealthStatus, PoolMetrics, SlotGuard};
pub use retry::{with_retry, RetryPolicy};
