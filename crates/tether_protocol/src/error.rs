//! Protocol error types.

use tether_codec::CodecError;
use thiserror::Error;

/// Errors raised while framing or interpreting protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload was not valid canonical CBOR or had the wrong shape.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Frame carried a tag no message is registered for.
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    /// Frame payload exceeds the protocol maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },

    /// Message decoded but violates a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// Creates an invalid message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
