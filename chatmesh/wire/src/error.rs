//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Buffer too short for the structure being decoded
    #[error("truncated buffer")]
    Truncated,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown message type
    #[error("unknown message type {0:#04x}")]
    Kind(u8),

    /// Field or payload exceeds its wire size limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Length field inconsistent with the buffer
    #[error("inconsistent length field")]
    Length,

    /// String field is not valid UTF-8
    #[error("invalid utf-8 in string field")]
    Utf8,

    /// Encrypted flag and content fields disagree
    #[error("encrypted content fields inconsistent")]
    Encryption,

    /// Payload matched neither the compact nor the fallback message format
    #[error("unrecognized message payload")]
    Message,
}
