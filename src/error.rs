//! Error types for sigstar.
//!
//! Every asynchronous operation reports failure through its own return value;
//! nothing is raised out of band. Malformed inbound messages are logged and
//! dropped by the dispatcher, so [`SignalingError::ProtocolShape`] only ever
//! surfaces from explicit validation calls.

use thiserror::Error;

/// Result type for sigstar operations.
pub type Result<T> = std::result::Result<T, SignalingError>;

#[derive(Debug, Error)]
pub enum SignalingError {
    // ========== Control connection ==========

    /// The signaling server could not be reached.
    #[error("cannot reach signaling server {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The control connection is gone (closed locally or dropped).
    #[error("control connection closed")]
    Closed,

    // ========== Join handshake ==========

    /// The server demanded a challenge but no local identity is configured.
    #[error("cannot prove identity: server sent a crypto challenge but no identity is configured")]
    CannotProveIdentity,

    /// Signing failure, malformed join response, or server-side rejection.
    #[error("join handshake failed: {0}")]
    Handshake(String),

    // ========== Dialing ==========

    /// `dial` was called without a live control connection.
    #[error("not listening")]
    NotListening,

    /// The server rejected or failed to relay a dial.
    #[error("dial {dial_id} rejected: {reason}")]
    DialAcknowledgement { dial_id: String, reason: String },

    /// The caller-supplied dial deadline expired before the acknowledgement.
    #[error("dial {dial_id} timed out waiting for acknowledgement")]
    DialTimeout { dial_id: String },

    /// No listener is registered for the server a dial address points at.
    #[error("no listener for server {0}")]
    NoListenerForServer(String),

    // ========== Protocol ==========

    /// An inbound message did not match its registered argument shape.
    #[error("message {name} failed shape validation: {reason}")]
    ProtocolShape { name: String, reason: String },

    /// An address string is not a rendezvous address.
    #[error("invalid rendezvous address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Frame encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SignalingError {
    pub(crate) fn handshake(reason: impl Into<String>) -> Self {
        SignalingError::Handshake(reason.into())
    }

    pub(crate) fn invalid_address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        SignalingError::InvalidAddress {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for SignalingError {
    fn from(err: bincode::Error) -> Self {
        SignalingError::Codec(err.to_string())
    }
}
