//! Error types for the tiered cache
//!
//! Only construction-time failures ever reach callers of the cache facade.
//! Runtime tier failures are caught at the tier boundary, counted, and
//! degraded to a miss or a no-op.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache tiers
#[derive(Error, Debug)]
pub enum Error {
    /// Remote tier unreachable or the connection was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Remote tier operation exceeded its deadline
    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload could not be encoded or decoded at a tier boundary
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid construction parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure says something about the health of the remote
    /// connection (as opposed to a bad payload or bad input).
    pub fn is_connection(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout { .. } | Error::Io(_) => true,
            Error::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }

    /// Short label used in log fields and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connection(_) => "connection",
            Error::Timeout { .. } => "timeout",
            Error::Redis(_) => "redis",
            Error::Serialization(_) => "serialization",
            Error::Configuration(_) | Error::ConfigParse(_) => "configuration",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
