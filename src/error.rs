//! Error taxonomy for the benchmark driver.
//!
//! Only orchestrator-level failures are represented by [`BenchError`] and
//! propagate to the caller. Per-message failures are [`TransportError`]s that
//! the producer and consumer fold into their statistics instead of raising.

use std::time::Duration;
use thiserror::Error;

/// Errors that abort a platform run or reject a request before it starts.
#[derive(Debug, Error)]
pub enum BenchError {
    /// The platform could not be started or a client could not reach it.
    #[error("connection error for {platform}: {reason}")]
    Connection { platform: String, reason: String },

    /// The platform never reported ready within its bound.
    #[error("{platform} failed to become ready within {}s", .waited.as_secs())]
    ReadinessTimeout { platform: String, waited: Duration },

    /// Invalid numeric configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A platform identifier that is not in the registry.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BenchError {
    /// True for the errors that mean the platform was unreachable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BenchError::Connection { .. } | BenchError::ReadinessTimeout { .. }
        )
    }

    /// True for errors raised before any state transition took place.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            BenchError::Configuration(_) | BenchError::UnknownPlatform(_)
        )
    }
}

/// Failure of a single send, poll, or client setup inside a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("client is not connected")]
    NotConnected,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected record: {0}")]
    Rejected(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("client error: {0}")]
    Client(String),
}

pub type Result<T, E = BenchError> = std::result::Result<T, E>;
