//! Error handling for the chat relay

use std::io;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat relay error types
#[derive(Debug, Error)]
pub enum ChatError {
    /// A datagram could not be decoded into a frame
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// A well-formed command that is invalid for the session's current state
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// Underlying stream or socket failure
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// A listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Startup { addr: String, source: io::Error },
}

impl ChatError {
    /// Build a `MalformedFrame` error
    pub fn malformed(reason: impl Into<String>) -> Self {
        ChatError::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Build a `ProtocolViolation` error
    pub fn violation(reason: impl Into<String>) -> Self {
        ChatError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// The text sent back to the offending client, where one exists
    pub fn client_text(&self) -> Option<&str> {
        match self {
            ChatError::MalformedFrame { .. } => Some("Malformed message"),
            ChatError::ProtocolViolation { reason } => Some(reason),
            _ => None,
        }
    }
}
