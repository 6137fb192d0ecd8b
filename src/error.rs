//! Error types for Procsi
//!
//! This module defines all error types used throughout the daemon,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Procsi operations
///
/// This enum encompasses all possible errors that can occur during
/// proxy interception, repository access, interceptor execution,
/// replay, and control-plane handling.
#[derive(Error, Debug)]
pub enum ProcsiError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad parameters supplied to the control server or to a query
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Repository errors (database operations, migrations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database schema migration failure; the repository refuses to open
    #[error("Migration error: {0}")]
    Migration(String),

    /// Certificate authority generation or persistence failure
    #[error("CA error: {0}")]
    Ca(String),

    /// Proxy engine errors (bind failures, malformed exchanges)
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Upstream request failed while proxying
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Interceptor script load or validation failure
    #[error("Interceptor load error: {file}: {message}")]
    InterceptorLoad {
        /// Script file the failure originated from
        file: String,
        /// Compile or validation error text
        message: String,
    },

    /// A parked `forward()` was aborted by cleanup or shutdown
    #[error("Forward aborted: {0}")]
    ForwardAborted(String),

    /// Replay transport failure (connection refused, TLS, DNS)
    #[error("Replay transport error: {0}")]
    ReplayTransport(String),

    /// Replay exceeded its clamped timeout
    #[error("Replay timed out after {timeout_ms}ms")]
    ReplayTimeout {
        /// Effective timeout that was exceeded
        timeout_ms: u64,
    },

    /// Control-server framing or dispatch errors
    #[error("Control error: {0}")]
    Control(String),

    /// The daemon cannot start (port bind, pid file, CA)
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite errors
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for Procsi operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = ProcsiError::Validation("limit must be a number".to_string());
        assert_eq!(err.to_string(), "Validation error: limit must be a number");

        let err = ProcsiError::ReplayTimeout { timeout_ms: 10_000 };
        assert_eq!(err.to_string(), "Replay timed out after 10000ms");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ProcsiError = io.into();
        assert!(matches!(err, ProcsiError::Io(_)));
    }
}
