/// Unified error handling for relevo routing
///
/// This module provides the error type system for the routing layer,
/// covering link-level faults, server-reported SQL faults, retry
/// exhaustion, configuration errors, and group management errors,
/// plus the classifier that decides which faults trigger failover.
use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for routing operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Network-level errors on the physical link
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Server-reported faults, passed through unchanged
    #[error("SQL error [{}]: {message}", .sql_state.as_deref().unwrap_or("-----"))]
    Sql {
        message: String,
        sql_state: Option<String>,
    },

    /// Retry budget spent without reaching any candidate host
    #[error("all {attempts} connection attempts failed")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<DriverError>,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection group management errors
    #[error("Connection group error: {message}")]
    Group { message: String },

    /// Host registry errors (unknown host, role conflicts)
    #[error("Topology error: {message}")]
    Topology { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Operation attempted on a closed logical connection
    #[error("logical connection is closed")]
    Closed,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for routing operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Convenience methods for creating specific error types
impl DriverError {
    /// Create a server fault with an optional SQLSTATE
    pub fn sql<S: Into<String>>(message: S, sql_state: Option<&str>) -> Self {
        DriverError::Sql {
            message: message.into(),
            sql_state: sql_state.map(|s| s.to_string()),
        }
    }

    /// Create a group management error
    pub fn group<S: Into<String>>(message: S) -> Self {
        DriverError::Group {
            message: message.into(),
        }
    }

    /// Create a topology error
    pub fn topology<S: Into<String>>(message: S) -> Self {
        DriverError::Topology {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        DriverError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        DriverError::Internal {
            message: message.into(),
        }
    }

    /// Wrap the last transient fault once the retry budget is spent
    pub fn exhausted(attempts: u32, last: DriverError) -> Self {
        DriverError::Exhausted {
            attempts,
            last: Box::new(last),
        }
    }

    /// SQLSTATE reported by the server, if any
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            DriverError::Sql { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DriverError::Config(_) => ErrorSeverity::Critical,
            DriverError::Internal { .. } => ErrorSeverity::Critical,
            DriverError::Network(_) => ErrorSeverity::Warning,
            DriverError::Timeout { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

/// Decides whether a fault means the physical link is unusable.
///
/// Connection-class faults trigger blacklisting and failover; anything
/// else is an application fault and is rethrown unchanged. The SQLSTATE
/// class prefixes are configurable; class `08` (connection exception)
/// is the default.
#[derive(Debug, Clone)]
pub struct FaultClassifier {
    sql_state_prefixes: Vec<String>,
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self {
            sql_state_prefixes: vec!["08".to_string()],
        }
    }
}

impl FaultClassifier {
    pub fn new(sql_state_prefixes: Vec<String>) -> Self {
        Self { sql_state_prefixes }
    }

    /// Add an extra SQLSTATE prefix to treat as connection-class
    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sql_state_prefixes.push(prefix.into());
        self
    }

    /// True when the fault indicates the physical link is unusable
    pub fn is_connection_error(&self, error: &DriverError) -> bool {
        match error {
            DriverError::Network(_) => true,
            DriverError::Timeout { .. } => true,
            DriverError::Sql {
                sql_state: Some(state),
                ..
            } => self
                .sql_state_prefixes
                .iter()
                .any(|prefix| state.starts_with(prefix.as_str())),
            _ => false,
        }
    }
}
