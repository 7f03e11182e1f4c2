// Layer 1: Standard library imports
use std::io;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Failures of the persistence layer.
///
/// Variants carry rendered detail strings rather than source errors so a
/// single failure can be fanned out to every waiter of a batched write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Disk I/O failed
    #[error("storage i/o failure: {detail}")]
    Io { detail: String },

    /// A record could not be encoded or decoded
    #[error("record encoding failed: {detail}")]
    Encode { detail: String },

    /// The journal file is not a valid journal or has a corrupt body
    #[error("journal corrupted: {detail}")]
    Corrupted { detail: String },

    /// A previous flush failed and has not yet been retried successfully;
    /// new writes are refused until the backlog drains
    #[error("storage degraded: {detail}")]
    Degraded { detail: String },

    /// The adapter has been closed
    #[error("storage is closed")]
    Closed,
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            detail: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode {
            detail: err.to_string(),
        }
    }
}
