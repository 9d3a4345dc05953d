//! Error types surfaced to callers of the client.

use std::io;

use crate::process::SpawnError;

/// Errors returned by [`Client`](crate::Client) operations and response handles.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The peer answered with `success: false`.
    #[error("remote error: {0}")]
    Remote(String),

    /// The connection is closing or closed; no response will arrive.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid command name {0:?}")]
    InvalidCommand(String),

    #[error("failed to encode request payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode response data: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("failed to start peer: {0}")]
    Spawn(#[from] SpawnError),
}

impl ClientError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Peer-supplied message for [`ClientError::Remote`].
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote(message) => Some(message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_keeps_peer_message() {
        let err = ClientError::Remote("Could not find the necessary translation models".into());
        assert_eq!(
            err.remote_message(),
            Some("Could not find the necessary translation models")
        );
        assert_eq!(
            err.to_string(),
            "remote error: Could not find the necessary translation models"
        );
        assert!(!err.is_connection_closed());
    }

    #[test]
    fn connection_closed_is_detectable() {
        assert!(ClientError::ConnectionClosed.is_connection_closed());
        assert_eq!(ClientError::ConnectionClosed.remote_message(), None);
    }
}
