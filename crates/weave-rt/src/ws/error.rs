//! WebSocket error types.

use std::io;

use thiserror::Error;

use super::close::WsCloseCode;
use crate::config::ConfigError;

/// Result type for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors raised by the frame codec, handshake and connection layers.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stream ended in the middle of a frame or request.
    #[error("unexpected end of stream while reading {0}")]
    Truncated(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client frame is not masked")]
    UnmaskedFrame,

    #[error("frame too large: {actual} bytes (max {max})")]
    FrameTooLarge { max: u64, actual: u64 },

    #[error("message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake request exceeds {max} bytes")]
    HandshakeTooLarge { max: usize },

    #[error("read timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WsError {
    /// Classify an I/O error raised while reading `what`.
    pub fn from_read(err: io::Error, what: &'static str) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => WsError::Truncated(what),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => WsError::Timeout,
            _ => WsError::Io(err),
        }
    }

    /// Status code to send in a close frame before dropping the
    /// connection, or `None` if the transport is already unusable.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            WsError::Protocol(_) | WsError::UnmaskedFrame => Some(WsCloseCode::PROTOCOL_ERROR),
            WsError::InvalidUtf8 => Some(WsCloseCode::INVALID_DATA),
            WsError::FrameTooLarge { .. } | WsError::MessageTooLarge { .. } => {
                Some(WsCloseCode::TOO_BIG)
            }
            WsError::Timeout => Some(WsCloseCode::GOING_AWAY),
            WsError::Io(_)
            | WsError::Truncated(_)
            | WsError::Handshake(_)
            | WsError::HandshakeTooLarge { .. }
            | WsError::Closed
            | WsError::Config(_) => None,
        }
    }

    /// Whether this error came from the transport rather than the peer's
    /// protocol behaviour.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            WsError::Io(_) | WsError::Truncated(_) | WsError::Timeout | WsError::Closed
        )
    }
}
