//! Session error types.

use thiserror::Error;

/// Errors from session handling.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A session state transition is not valid.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The handshake was rejected; the reset code explains why.
    #[error("session rejected: {code}")]
    Rejected {
        /// Reset code sent to the worker.
        code: String,
    },

    /// The connection is gone; no further frames can be sent.
    #[error("worker transport disconnected")]
    Disconnected,

    /// The referenced worker has no live session.
    #[error("no session for worker {0}")]
    UnknownWorker(String),

    /// An outbound frame exhausted its ack retries.
    #[error("ack retries exhausted for message {0}")]
    AckRetriesExhausted(String),

    /// The send window was reset mid-send.
    #[error(transparent)]
    Window(#[from] lattice_protocol::WindowError),

    /// A payload failed to serialize.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
