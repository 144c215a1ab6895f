use std::fmt;

use thiserror::Error;

/// Boxed underlying cause kept inspectable through `Error::source`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum DagstepError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Backend errors, classified at the backend boundary
    #[error("{operation}: not found: {target}")]
    ResourceNotFound { operation: String, target: String },

    #[error("{operation}: permission denied: {target}")]
    PermissionDenied { operation: String, target: String },

    #[error("{operation}: invalid credentials: {message}")]
    InvalidCredentials { operation: String, message: String },

    #[error("{operation}: network error: {source}")]
    Network {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("{operation}: timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("{operation} failed: {source}")]
    Backend {
        operation: String,
        #[source]
        source: BoxError,
    },

    // Lifecycle
    #[error("Step canceled: {step}")]
    Canceled { step: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DagstepError>;

/// Error taxonomy shared by every backend. The scheduler decides retries from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    ResourceNotFound,
    PermissionDenied,
    InvalidCredentials,
    Network,
    Timeout,
    OperationFailed,
    Canceled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::OperationFailed => "operation_failed",
            ErrorKind::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl DagstepError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn canceled(step: impl Into<String>) -> Self {
        Self::Canceled { step: step.into() }
    }

    pub fn failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap an unclassified library error, keeping it as the source.
    pub fn backend(
        operation: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn network(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Network {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::ConfigNotFound(_) | Self::Json(_) => ErrorKind::Config,
            Self::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::InvalidCredentials { .. } => ErrorKind::InvalidCredentials,
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::OperationFailed { .. } | Self::Backend { .. } => ErrorKind::OperationFailed,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::ResourceNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected => ErrorKind::Network,
                _ => ErrorKind::OperationFailed,
            },
        }
    }

    /// Advice for the scheduler; this layer never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Timeout)
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }
}
