//! Codec error types.

use thiserror::Error;

/// Codec result type.
pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors produced while encoding or decoding chat frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame header declares {total_len} bytes, below the {header_len}-byte header")]
    TruncatedHeader { total_len: usize, header_len: usize },

    #[error("unsupported header length {0}, expected 16")]
    BadHeaderLen(u16),

    #[error("payload decompression failed: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("integer payload must be 4 bytes, got {0}")]
    BadIntPayload(usize),

    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),
}
