//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// Message failed to encode.
    #[error("encode failed: {0}")]
    Encode(#[source] postcard::Error),

    /// Frame payload failed to decode.
    #[error("decode failed: {0}")]
    Decode(#[source] postcard::Error),

    /// Peer announced a frame larger than the protocol allows.
    #[error("frame of {got} bytes exceeds maximum of {max}")]
    FrameTooLarge { got: usize, max: usize },

    /// No protocol version is supported by both sides.
    #[error("no common protocol version: ours {ours_min}..={ours_max}, theirs {theirs_min}..={theirs_max}")]
    VersionMismatch {
        ours_min: u16,
        ours_max: u16,
        theirs_min: u16,
        theirs_max: u16,
    },
}
