//! Error types for the frame bridge.
//!
//! This module defines stable error codes and the main error type used
//! throughout the bridge. Transport and decode failures are contained by the
//! driver; everything else surfaces to the caller that triggered it.

use crate::config::ConfigError;
use crate::driver::BridgeState;
use crate::envelope::DecodeError;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed envelope
    DecodeError,
    /// Correlation id already pending
    DuplicateId,
    /// Call exceeded its deadline
    Timeout,
    /// Host never acknowledged the handshake
    HandshakeTimeout,
    /// Operation attempted before the handshake completed
    NotReady,
    /// Message from an origin outside the allow-list
    UntrustedOrigin,
    /// Bridge has been closed
    Closed,
    /// Host answered with an error response
    RemoteError,
    /// Posting to the parent frame failed
    TransportError,
    /// Invalid configuration or argument
    InvalidArgument,
    /// Operation not valid in the current state
    InvalidState,
    /// Serialization/deserialization error
    SerializationError,
    /// Inbound request named a method this panel does not serve
    MethodNotFound,
    /// A served request handler failed
    HandlerError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::DecodeError => write!(f, "DECODE_ERROR"),
            ErrorCode::DuplicateId => write!(f, "DUPLICATE_ID"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::HandshakeTimeout => write!(f, "HANDSHAKE_TIMEOUT"),
            ErrorCode::NotReady => write!(f, "NOT_READY"),
            ErrorCode::UntrustedOrigin => write!(f, "UNTRUSTED_ORIGIN"),
            ErrorCode::Closed => write!(f, "CLOSED"),
            ErrorCode::RemoteError => write!(f, "REMOTE_ERROR"),
            ErrorCode::TransportError => write!(f, "TRANSPORT_ERROR"),
            ErrorCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            ErrorCode::InvalidState => write!(f, "INVALID_STATE"),
            ErrorCode::SerializationError => write!(f, "SERIALIZATION_ERROR"),
            ErrorCode::MethodNotFound => write!(f, "METHOD_NOT_FOUND"),
            ErrorCode::HandlerError => write!(f, "HANDLER_ERROR"),
        }
    }
}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Envelope could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A call with this correlation id is already in flight
    #[error("Correlation id '{0}' is already pending")]
    DuplicateId(String),

    /// A call exceeded its deadline
    #[error("Call '{method}' ({id}) timed out after {timeout_ms}ms")]
    Timeout {
        /// Correlation id of the call
        id: String,
        /// Method that was called
        method: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The host did not acknowledge the handshake in time
    #[error("Failed to connect to host: no handshake response within {0}ms")]
    HandshakeTimeout(u64),

    /// The bridge has not completed its handshake
    #[error("Bridge is not ready (state: {0})")]
    NotReady(BridgeState),

    /// Message from a non-allow-listed origin
    #[error("Untrusted origin: {0}")]
    UntrustedOrigin(String),

    /// The bridge was closed
    #[error("Bridge is closed")]
    Closed,

    /// The host answered with an error
    #[error("Host rejected '{method}': {message}")]
    Remote {
        /// Method that was called
        method: String,
        /// Error text carried by the response envelope
        message: String,
    },

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Decode(_) => ErrorCode::DecodeError,
            BridgeError::DuplicateId(_) => ErrorCode::DuplicateId,
            BridgeError::Timeout { .. } => ErrorCode::Timeout,
            BridgeError::HandshakeTimeout(_) => ErrorCode::HandshakeTimeout,
            BridgeError::NotReady(_) => ErrorCode::NotReady,
            BridgeError::UntrustedOrigin(_) => ErrorCode::UntrustedOrigin,
            BridgeError::Closed => ErrorCode::Closed,
            BridgeError::Remote { .. } => ErrorCode::RemoteError,
            BridgeError::Transport(_) => ErrorCode::TransportError,
            BridgeError::Config(_) => ErrorCode::InvalidArgument,
            BridgeError::InvalidState(_) => ErrorCode::InvalidState,
            BridgeError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Whether this is a call or handshake timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. } | BridgeError::HandshakeTimeout(_)
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
