// Layer 1: Standard library imports
use std::io;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Transport-level protocol failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket I/O failure
    #[error("socket i/o error: {0}")]
    Io(#[from] io::Error),

    /// A frame length prefix exceeded the configured bound
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame payload could not be serialized
    #[error("frame serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether this failure is the oversize-frame case, which closes the
    /// session with `payload_too_large` rather than `frame_error`.
    pub fn is_oversize(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. })
    }
}
