//! Client error types.

use rpcwire_protocol::ProtocolError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    /// The call failed on the server. Holds the response header's error
    /// text unchanged.
    #[error("{0}")]
    Server(String),

    #[error("response has no body")]
    MissingBody,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Protocol(e) => e.is_closed(),
            _ => false,
        }
    }

    /// Returns the server's error text if the call itself failed.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ClientError::Server(message) => Some(message),
            _ => None,
        }
    }
}
