//! Error types for the connection manager
//!
//! Transient broker failures are recovered internally by the reconnect
//! loop; only terminal retry exhaustion, fail-fast disconnection, and
//! shutdown are surfaced to callers.

use crate::broker::state::ConnectionState;
use thiserror::Error;

/// Errors surfaced by manager operations
#[derive(Debug, Error)]
pub enum BrokerError {
    /// One connect attempt failed. Non-terminal; the retry loop handles it.
    #[error("Broker connect attempt failed: {0}")]
    ConnectionFailed(String),

    /// The configured retry budget ran out. Terminal for this connect.
    #[error("Gave up connecting to broker after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },

    /// Operation attempted without a usable connection while blocking is
    /// disabled or before the first successful connect.
    #[error("Not connected to broker (state: {state})")]
    NotConnected { state: ConnectionState },

    /// The manager is closing; no new work is accepted.
    #[error("Connection manager is shutting down")]
    ShuttingDown,

    /// Error reported by the AMQP client.
    #[error("AMQP protocol error: {0}")]
    Protocol(#[from] lapin::Error),

    /// Configuration problem detected before any network activity.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl BrokerError {
    /// Create a non-terminal connect failure
    pub fn connection_failed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed(message.into())
    }
}

/// Result type for manager operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Outcome a consumer handler reports for one delivery
///
/// Never propagated to the caller of `consume`; the façade translates it
/// into the broker-level reject it implies.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing failed; the delivery should be requeued for another try.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The delivery is unusable (e.g. malformed payload); reject it
    /// without requeueing.
    #[error("Message rejected: {0}")]
    Reject(String),
}

impl HandlerError {
    /// Create a requeueing failure
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed(message.into())
    }

    /// Create a permanent reject
    pub fn reject<S: Into<String>>(message: S) -> Self {
        Self::Reject(message.into())
    }
}
