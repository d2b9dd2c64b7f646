//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing or parsing protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame header declared a length outside `[0, max]`.
    ///
    /// Fatal for the connection: the stream cannot be resynchronized and the
    /// declared size must never drive an allocation.
    #[error("frame length {declared} outside [0, {max}]")]
    InvalidLength {
        /// Length as read from the wire (signed, may be negative)
        declared: i32,
        /// Configured maximum body size
        max: usize,
    },

    /// An outbound body exceeds the maximum frame size.
    #[error("frame body of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Size of the body that was rejected
        size: usize,
        /// Configured maximum body size
        max: usize,
    },

    /// A frame body was not valid JSON.
    ///
    /// Recoverable: only the offending frame is discarded.
    #[error("malformed JSON body: {0}")]
    MalformedJson(String),

    /// A value could not be serialized to JSON.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Returns true if the connection cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidLength { .. })
    }
}
