//! Persistence layer: batched durable append of envelopes with status
//! transitions, history queries, and retention.
//!
//! The broker depends on [`StorageAdapter`]; backends are selected at
//! startup. [`JournalStorage`] persists to an append-only journal file,
//! [`MemoryStorage`] keeps everything in memory.

mod error;
mod journal;
mod log;
mod memory;
mod traits;

pub use error::StorageError;
pub use journal::{Journal, JournalRecord};
pub use log::{BatchConfig, JournalStorage};
pub use memory::MemoryStorage;
pub use traits::{HistoryQuery, SortOrder, StorageAdapter, DEFAULT_HISTORY_LIMIT};
