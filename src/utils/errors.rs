use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("operation failed: {0}")]
    OperationFailure(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("circuit open for service: {0}")]
    CircuitOpen(String),

    #[error("request queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("fallback failed: {0}")]
    FallbackFailure(String),

    #[error("component has been shut down")]
    Shutdown,

    #[error("service not registered: {0}")]
    UnregisteredService(String),

    #[error("subscription callback failed for {id}: {message}")]
    SubscriptionCallback { id: String, message: String },

    #[error("health check failed for {name}: {message}")]
    HealthCheckFailure { name: String, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("subscription limit reached ({0} subscriptions)")]
    SubscriptionLimit(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ResilienceError {
    fn from(e: figment::Error) -> Self {
        ResilienceError::Config(e.to_string())
    }
}

impl From<validator::ValidationErrors> for ResilienceError {
    fn from(e: validator::ValidationErrors) -> Self {
        ResilienceError::Config(e.to_string())
    }
}

/// Message fragments that mark an otherwise opaque operation failure as a
/// network-class fault.
const NETWORK_FAULT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "socket",
    "temporarily unavailable",
    "503",
];

impl ResilienceError {
    /// Shorthand for wrapping a failure raised by a caller-supplied operation.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::OperationFailure(message.into())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::OperationFailure(_) => "OPERATION_FAILURE",
            Self::Timeout(_) => "TIMEOUT",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::FallbackFailure(_) => "FALLBACK_FAILURE",
            Self::Shutdown => "SHUTDOWN",
            Self::UnregisteredService(_) => "UNREGISTERED_SERVICE",
            Self::SubscriptionCallback { .. } => "SUBSCRIPTION_CALLBACK_ERROR",
            Self::HealthCheckFailure { .. } => "HEALTH_CHECK_FAILURE",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::SubscriptionLimit(_) => "SUBSCRIPTION_LIMIT",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether a fresh attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::Transport(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Self::OperationFailure(msg) => {
                let msg = msg.to_lowercase();
                NETWORK_FAULT_MARKERS.iter().any(|m| msg.contains(m))
            }
            // Validation-class and lifecycle errors will fail the same way again.
            Self::Validation(_)
            | Self::Config(_)
            | Self::CircuitOpen(_)
            | Self::QueueFull(_)
            | Self::FallbackFailure(_)
            | Self::Shutdown
            | Self::UnregisteredService(_)
            | Self::SubscriptionCallback { .. }
            | Self::HealthCheckFailure { .. }
            | Self::SubscriptionLimit(_) => false,
        }
    }
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;
