//! Error type shared by every relay component.

use thiserror::Error;

/// Errors raised by the relay engine.
///
/// Only `Dial` and `InvalidConfig` are fatal for the process; every other
/// variant ends the task that hit it and nothing else.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid event format: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to encode event {id}: {reason}")]
    Encode { id: String, reason: String },

    #[error("ingress connection closed")]
    IngressClosed,

    #[error("failed to connect to {endpoint}: {reason}")]
    Dial { endpoint: String, reason: String },

    #[error("failover signal already fired")]
    FailoverAlreadyFired,

    #[error("failover signal already has a waiter")]
    FailoverAlreadyClaimed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}
