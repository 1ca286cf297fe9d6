//! # Frame Errors
//!
//! Failures raised while encoding a command or decoding a response frame.
//! Every decode failure leaves the underlying stream mid-frame, so callers
//! must treat the connection as unusable afterwards.

/// Result alias for framing operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The command is longer than the header width can represent.
    #[error("command too long ({len} bytes, header allows at most {max})")]
    BodyTooLong { len: usize, max: usize },

    /// The command contains non-ASCII characters.
    #[error("command is not ASCII")]
    NonAscii,

    /// The response header is not hexadecimal ASCII.
    #[error("bad frame header {header:?}")]
    BadHeader { header: String },

    /// The response header decoded to a zero or oversized body length.
    #[error("invalid message length: {length}")]
    InvalidLength { length: usize },

    /// The stream ended before the full frame arrived.
    #[error("truncated frame (expected {expected} bytes, read {read})")]
    Truncated { expected: usize, read: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Returns true for errors caused by the command itself rather than
    /// by the wire.
    pub fn is_encoding(&self) -> bool {
        matches!(self, FrameError::BodyTooLong { .. } | FrameError::NonAscii)
    }
}
