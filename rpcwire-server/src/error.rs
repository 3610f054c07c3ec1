//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] rpcwire_protocol::ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("rpc: method name {0:?} is not of the form \"Service.Method\"")]
    InvalidMethodName(String),

    #[error("rpc: method already registered: {0}")]
    DuplicateMethod(String),
}

impl ServerError {
    /// Returns whether this error comes from setting up the registry.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidMethodName(_) | ServerError::DuplicateMethod(_)
        )
    }
}
