//! Error handling for the tick-daemon framework.
//!
//! One `thiserror` enum covers every failure the framework can surface,
//! each variant carrying a structured [`ErrorCode`] for programmatic
//! handling and an optional source error for context. The error kinds map
//! onto the framework's failure taxonomy: environment problems are fatal at
//! startup, transport and worker failures are recoverable and follow the
//! retry policy, timeouts are terminal per call, and fatal runtime errors
//! end (or re-exec) the parent process.

/// Result type alias for tick-daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error code enum for categorizing and identifying errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    // Configuration errors: 1000-1999
    /// Configuration value rejected by validation.
    ConfigInvalid = 1000,
    /// Configuration source could not be parsed.
    ConfigParse = 1001,

    // Environment errors: 2000-2999
    /// One or more environment checks failed before startup.
    EnvironmentCheck = 2000,

    // Lock errors: 3000-3999
    /// Another live instance holds the singleton lease.
    LockHeld = 3000,
    /// The lock backend could not be read or written.
    LockBackend = 3001,

    // Signal errors: 4000-4999
    /// A signal stream could not be registered.
    SignalRegisterFailed = 4000,

    // IO errors: 5000-5999
    /// General I/O failure.
    IoError = 5000,

    // Transport errors: 6000-6999
    /// The transport rejected a frame after exhausting retries.
    TransportFull = 6000,
    /// The transport has been released or disconnected.
    TransportClosed = 6001,

    // Worker errors: 7000-7999
    /// The mediator refused new work under backpressure.
    PoolSaturated = 7000,
    /// A worker method raised or the call failed terminally.
    WorkerFailed = 7001,
    /// The pool was used in an order its lifecycle forbids.
    PoolLifecycle = 7002,

    // Timeout errors: 8000-8999
    /// An operation exceeded its bound.
    TimeoutOperation = 8000,

    // Runtime errors: 9000-9999
    /// Uncaught failure in the parent event loop.
    RuntimeFatal = 9000,
    /// A background member ended abnormally.
    MemberFailed = 9001,

    /// Unclassified error.
    Unknown = 99999,
}

impl ErrorCode {
    /// Convert the error code to its string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ConfigParse => "CONFIG_PARSE",
            Self::EnvironmentCheck => "ENVIRONMENT_CHECK",
            Self::LockHeld => "LOCK_HELD",
            Self::LockBackend => "LOCK_BACKEND",
            Self::SignalRegisterFailed => "SIGNAL_REGISTER_FAILED",
            Self::IoError => "IO_ERROR",
            Self::TransportFull => "TRANSPORT_FULL",
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::PoolSaturated => "POOL_SATURATED",
            Self::WorkerFailed => "WORKER_FAILED",
            Self::PoolLifecycle => "POOL_LIFECYCLE",
            Self::TimeoutOperation => "TIMEOUT_OPERATION",
            Self::RuntimeFatal => "RUNTIME_FATAL",
            Self::MemberFailed => "MEMBER_FAILED",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.as_str(), *self as i32)
    }
}

/// Comprehensive error type for all framework operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error [{code}]: {message}")]
    Config {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
        /// Optional source error for better context.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Aggregated environment-check failures, fatal at startup.
    #[error("Environment check failed [{code}]: {}", messages.join("; "))]
    Environment {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// All collected check failures.
        messages: Vec<String>,
    },

    /// Singleton lock errors.
    #[error("Lock error [{code}]: {message}")]
    Lock {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
        /// Pid of the competing holder, when known.
        holder: Option<u32>,
    },

    /// Signal facility errors.
    #[error("Signal error [{code}]: {message}")]
    Signal {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
        /// Optional source error for better context.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// I/O operation errors.
    #[error("I/O error [{code}]: {message}")]
    Io {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
        /// Optional source error for better context.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Transport (Via) errors.
    #[error("Transport error [{code}]: {message}")]
    Transport {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
    },

    /// The mediator refused new work because the queue is saturated.
    #[error("Pool saturated [{code}]: {queued} frames queued")]
    Saturated {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Number of frames on the transport when the call was refused.
        queued: usize,
    },

    /// Worker call errors.
    #[error("Worker error [{code}] in '{method}': {message}")]
    Worker {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Worker method involved.
        method: String,
        /// Human-readable error message.
        message: String,
    },

    /// Timeout errors.
    #[error("Operation timed out [{code}] after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Operation that timed out.
        operation: String,
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Fatal runtime errors.
    #[error("Runtime error [{code}]: {message}")]
    Runtime {
        /// Error code for structured error handling.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
        /// Optional source error for better context.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            code: ErrorCode::ConfigInvalid,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new environment-check error from the collected messages.
    #[must_use]
    pub fn environment(messages: Vec<String>) -> Self {
        Self::Environment {
            code: ErrorCode::EnvironmentCheck,
            messages,
        }
    }

    /// Create a new lock error.
    pub fn lock<S: Into<String>>(message: S) -> Self {
        Self::Lock {
            code: ErrorCode::LockBackend,
            message: message.into(),
            holder: None,
        }
    }

    /// Create a lock-held error naming the competing pid.
    pub fn lock_held<S: Into<String>>(message: S, holder: u32) -> Self {
        Self::Lock {
            code: ErrorCode::LockHeld,
            message: message.into(),
            holder: Some(holder),
        }
    }

    /// Create a new signal error.
    pub fn signal<S: Into<String>>(message: S) -> Self {
        Self::Signal {
            code: ErrorCode::SignalRegisterFailed,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            code: ErrorCode::IoError,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new I/O error with source error.
    pub fn io_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Io {
            code: ErrorCode::IoError,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new transport error.
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            code: ErrorCode::TransportClosed,
            message: message.into(),
        }
    }

    /// Create a transport-full error after exhausted retries.
    pub fn transport_full<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            code: ErrorCode::TransportFull,
            message: message.into(),
        }
    }

    /// Create a saturation error carrying the current queue depth.
    #[must_use]
    pub fn saturated(queued: usize) -> Self {
        Self::Saturated {
            code: ErrorCode::PoolSaturated,
            queued,
        }
    }

    /// Create a new worker error.
    pub fn worker<M: Into<String>, S: Into<String>>(method: M, message: S) -> Self {
        Self::Worker {
            code: ErrorCode::WorkerFailed,
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a pool-lifecycle error (for example, resizing after setup).
    pub fn pool_lifecycle<M: Into<String>, S: Into<String>>(method: M, message: S) -> Self {
        Self::Worker {
            code: ErrorCode::PoolLifecycle,
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            code: ErrorCode::TimeoutOperation,
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new fatal runtime error.
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            code: ErrorCode::RuntimeFatal,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new runtime error with source error.
    pub fn runtime_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Runtime {
            code: ErrorCode::RuntimeFatal,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable under the transport policy.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Transport { .. } | Self::Saturated { .. }
        )
    }

    /// Check if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is fatal at startup.
    #[must_use]
    pub const fn is_environment(&self) -> bool {
        matches!(self, Self::Environment { .. })
    }

    /// Get the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Environment { .. } => "environment",
            Self::Lock { .. } => "lock",
            Self::Signal { .. } => "signal",
            Self::Io { .. } => "io",
            Self::Transport { .. } => "transport",
            Self::Saturated { .. } => "saturated",
            Self::Worker { .. } => "worker",
            Self::Timeout { .. } => "timeout",
            Self::Runtime { .. } => "runtime",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io_with_source("I/O operation failed", err)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config {
            code: ErrorCode::ConfigParse,
            message: format!("Configuration loading failed: {err}"),
            source: None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::io_with_source("Serialization failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("test message");
        assert_eq!(err.category(), "config");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(Error::transport_full("queue full").is_retryable());
        assert!(Error::saturated(512).is_retryable());
        assert!(!Error::timeout("square", 500).is_retryable());
    }

    #[test]
    fn test_timeout_error() {
        let err = Error::timeout("call square", 5000);
        assert!(err.is_timeout());
        assert_eq!(err.category(), "timeout");
    }

    #[test]
    fn test_environment_aggregation() {
        let err = Error::environment(vec!["no lock dir".into(), "no workers".into()]);
        assert!(err.is_environment());
        assert!(err.to_string().contains("no lock dir; no workers"));
    }

    #[test]
    fn test_lock_held_holder() {
        let err = Error::lock_held("lease owned elsewhere", 4242);
        match err {
            Error::Lock { code, holder, .. } => {
                assert_eq!(code, ErrorCode::LockHeld);
                assert_eq!(holder, Some(4242));
            }
            other => panic!("unexpected variant: {other}"),
        }
    }
}
