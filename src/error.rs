use thiserror::Error;

/// A single problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Unified error type for the counter stores, the coordinator and bootstrap.
#[derive(Error, Debug, Clone)]
pub enum CounterError {
    /// Key or entity not found. Expected control flow on a cache miss.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entry already exists (duplicate like)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Store unreachable: connection refused, dropped, or I/O failure on the wire
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    TimedOut(String),

    /// Another process holds the populate lock and the unlocked fallback is disabled
    #[error("Lock contended: {0}")]
    LockContended(String),

    /// Store answered but rejected the operation
    #[error("Store error: {0}")]
    Store(String),

    /// I/O error outside the stores (config files)
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Validation error with messages
    #[error("Validation error: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    ValidationError(Vec<ValidationIssue>),

    /// Parse/serialization error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Background task did not stop within its bound
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

impl CounterError {
    /// Check if this error is transient and retryable
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CounterError::Unavailable(_) | CounterError::TimedOut(_) | CounterError::LockContended(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CounterError::NotFound(_))
    }
}

// === Conversion Implementations ===

macro_rules! impl_from_error {
    ($err_type:ty, $arm:pat => $body:expr) => {
        impl From<$err_type> for CounterError {
            fn from(err: $err_type) -> Self {
                match err {
                    $arm => $body,
                }
            }
        }
    };
}

impl_from_error!(std::io::Error, e => match e.kind() {
    std::io::ErrorKind::NotFound => CounterError::NotFound(e.to_string()),
    std::io::ErrorKind::TimedOut => CounterError::TimedOut(e.to_string()),
    std::io::ErrorKind::InvalidInput => CounterError::InvalidArgument(e.to_string()),
    _ => CounterError::IoError(e.to_string()),
});

impl_from_error!(redis::RedisError, e => if e.is_timeout() {
    CounterError::TimedOut(e.to_string())
} else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
    CounterError::Unavailable(e.to_string())
} else {
    CounterError::Store(e.to_string())
});

impl_from_error!(serde_json::Error, e => CounterError::ParseError(e.to_string()));
impl_from_error!(toml::de::Error, e => CounterError::ParseError(e.to_string()));

/// Result type alias for operations that can fail with CounterError.
pub type CounterResult<T> = Result<T, CounterError>;
