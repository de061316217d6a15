//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A value cannot be represented as the declared column type.
    #[error("type encode error: {0}")]
    TypeEncode(String),

    /// Wire bytes do not form a valid value of the declared column type.
    #[error("type decode error: {0}")]
    TypeDecode(String),

    /// A frame could not be parsed or decompressed.
    #[error("frame corruption: {0}")]
    FrameCorruption(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Protocol version not supported by this driver.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl Error {
    pub(crate) fn encode(msg: impl Into<String>) -> Self {
        Error::TypeEncode(msg.into())
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Error::TypeDecode(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }
}
