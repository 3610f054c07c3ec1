//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing, reading or writing calls.
///
/// Most variants leave the stream in an unknown position and are fatal to
/// the connection. Payload errors are scoped to a single call: the frame
/// boundaries are intact and the connection can keep serving.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame read error: {0}")]
    FrameRead(#[source] std::io::Error),

    #[error("frame write error: {0}")]
    FrameWrite(#[source] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid frame length prefix")]
    InvalidLength,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: usize },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("payload decode error: {0}")]
    PayloadDecode(String),

    #[error("payload encode error: {0}")]
    PayloadEncode(String),
}

impl ProtocolError {
    /// Returns whether the connection must be closed after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::PayloadDecode(_) | ProtocolError::PayloadEncode(_)
        )
    }

    /// Returns whether this error is the orderly end of a connection.
    pub fn is_closed(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::FrameRead(e) | ProtocolError::FrameWrite(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
