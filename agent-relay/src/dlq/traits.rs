// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;

// Layer 3: Internal module imports
use super::error::DlqError;
use super::types::{DeadLetter, DlqQuery, DlqStats};
use crate::util::AgentName;

/// Terminal store for deliveries that failed after retries.
///
/// Mirrors the storage adapter seam: the broker depends on the interface and
/// a backend is chosen at startup. Invariants: an acknowledged entry never
/// reverts, `retry_count` is monotone, and stats are derived live.
#[async_trait]
pub trait DlqAdapter: Send + Sync {
    /// Insert a quarantined entry.
    async fn add(&self, entry: DeadLetter) -> Result<(), DlqError>;

    /// Fetch an entry by entry id.
    async fn get(&self, id: &str) -> Result<Option<DeadLetter>, DlqError>;

    /// Query entries with filters, ordering, and pagination.
    async fn query(&self, query: DlqQuery) -> Result<Vec<DeadLetter>, DlqError>;

    /// Mark an entry acknowledged.
    ///
    /// Idempotent: returns `Ok(false)` if the entry was already
    /// acknowledged. Fails with `NotFound` for unknown ids.
    async fn acknowledge(&self, id: &str, by: Option<AgentName>) -> Result<bool, DlqError>;

    /// Acknowledge a batch; returns how many entries newly transitioned.
    async fn acknowledge_many(
        &self,
        ids: &[String],
        by: Option<AgentName>,
    ) -> Result<usize, DlqError>;

    /// Record one replay attempt; returns the new count.
    async fn increment_retry(&self, id: &str) -> Result<u32, DlqError>;

    /// Delete an entry; returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, DlqError>;

    /// Derive live statistics over the queue.
    async fn stats(&self) -> Result<DlqStats, DlqError>;

    /// Remove acknowledged entries older than `retention`, then enforce
    /// `max_entries`: acknowledged entries are evicted first, oldest first
    /// within a class. Returns the number removed.
    async fn cleanup(&self, retention: Duration, max_entries: usize) -> Result<usize, DlqError>;

    /// Unacknowledged entries with fewer than `max_retries` replay attempts,
    /// oldest first.
    async fn get_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, DlqError>;

    /// Force buffered writes to disk.
    async fn flush(&self) -> Result<(), DlqError>;

    /// Drain pending writes and release the backing store.
    async fn close(&self) -> Result<(), DlqError>;
}
