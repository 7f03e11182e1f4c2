// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use crate::storage::StorageError;

/// Failures of the dead-letter queue adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DlqError {
    /// No entry with the given id
    #[error("dead letter entry {id} not found")]
    NotFound { id: String },

    /// The backing store failed
    #[error("dead letter store failure: {0}")]
    Backend(#[from] StorageError),
}
