//! In-memory dead-letter queue backend.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

// Layer 3: Internal module imports
use super::error::DlqError;
use super::traits::DlqAdapter;
use super::types::{DeadLetter, DlqQuery, DlqStats};
use crate::storage::StorageError;
use crate::util::{now_ms, AgentName};

/// Volatile dead-letter store.
#[derive(Clone, Default)]
pub struct MemoryDlq {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, DeadLetter>,
    closed: bool,
}

impl MemoryDlq {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn ensure_open(&self) -> Result<(), DlqError> {
        if self.closed {
            Err(DlqError::Backend(StorageError::Closed))
        } else {
            Ok(())
        }
    }
}

/// Shared acknowledge transition; true when the entry newly transitioned.
pub(super) fn apply_ack(entry: &mut DeadLetter, by: Option<AgentName>) -> bool {
    if entry.acknowledged {
        return false;
    }
    entry.acknowledged = true;
    entry.acknowledged_by = by;
    entry.acknowledged_ts = Some(now_ms());
    true
}

/// Shared cleanup policy: acknowledged-and-stale first, then enforce the cap
/// (acknowledged before unacknowledged, oldest first within a class).
/// Returns the removed entry ids.
pub(super) fn cleanup_victims(
    entries: &HashMap<String, DeadLetter>,
    retention: Duration,
    max_entries: usize,
) -> Vec<String> {
    let horizon = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d));

    let mut victims: Vec<String> = entries
        .values()
        .filter(|e| e.acknowledged && horizon.is_none_or(|h| e.dlq_ts < h))
        .map(|e| e.id.clone())
        .collect();

    let remaining = entries.len() - victims.len();
    if remaining > max_entries {
        let mut survivors: Vec<&DeadLetter> = entries
            .values()
            .filter(|e| !victims.contains(&e.id))
            .collect();
        // Acknowledged entries are evicted before unacknowledged ones.
        survivors.sort_by(|a, b| {
            b.acknowledged
                .cmp(&a.acknowledged)
                .then_with(|| a.dlq_ts.cmp(&b.dlq_ts))
        });
        victims.extend(
            survivors
                .into_iter()
                .take(remaining - max_entries)
                .map(|e| e.id.clone()),
        );
    }
    victims
}

/// Shared retryable selection: unacknowledged, under the retry budget,
/// oldest first.
pub(super) fn select_retryable(
    entries: &HashMap<String, DeadLetter>,
    max_retries: u32,
    limit: usize,
) -> Vec<DeadLetter> {
    let mut retryable: Vec<DeadLetter> = entries
        .values()
        .filter(|e| !e.acknowledged && e.retry_count < max_retries)
        .cloned()
        .collect();
    retryable.sort_by(|a, b| a.dlq_ts.cmp(&b.dlq_ts).then_with(|| a.id.cmp(&b.id)));
    retryable.truncate(limit);
    retryable
}

#[async_trait]
impl DlqAdapter for MemoryDlq {
    async fn add(&self, entry: DeadLetter) -> Result<(), DlqError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetter>, DlqError> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        Ok(inner.entries.get(id).cloned())
    }

    async fn query(&self, query: DlqQuery) -> Result<Vec<DeadLetter>, DlqError> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        Ok(query.apply(inner.entries.values().cloned()))
    }

    async fn acknowledge(&self, id: &str, by: Option<AgentName>) -> Result<bool, DlqError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        match inner.entries.get_mut(id) {
            Some(entry) => Ok(apply_ack(entry, by)),
            None => Err(DlqError::NotFound { id: id.to_string() }),
        }
    }

    async fn acknowledge_many(
        &self,
        ids: &[String],
        by: Option<AgentName>,
    ) -> Result<usize, DlqError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let mut transitioned = 0;
        for id in ids {
            if let Some(entry) = inner.entries.get_mut(id) {
                if apply_ack(entry, by.clone()) {
                    transitioned += 1;
                }
            }
        }
        Ok(transitioned)
    }

    async fn increment_retry(&self, id: &str) -> Result<u32, DlqError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        match inner.entries.get_mut(id) {
            Some(entry) => {
                entry.retry_count = entry.retry_count.saturating_add(1);
                Ok(entry.retry_count)
            }
            None => Err(DlqError::NotFound { id: id.to_string() }),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        Ok(inner.entries.remove(id).is_some())
    }

    async fn stats(&self) -> Result<DlqStats, DlqError> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        Ok(DlqStats::derive(inner.entries.values()))
    }

    async fn cleanup(&self, retention: Duration, max_entries: usize) -> Result<usize, DlqError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let victims = cleanup_victims(&inner.entries, retention, max_entries);
        for id in &victims {
            inner.entries.remove(id);
        }
        Ok(victims.len())
    }

    async fn get_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, DlqError> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        Ok(select_retryable(&inner.entries, max_retries, limit))
    }

    async fn flush(&self) -> Result<(), DlqError> {
        self.inner.read().ensure_open()
    }

    async fn close(&self) -> Result<(), DlqError> {
        self.inner.write().closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dlq::types::DlqReason;
    use crate::message::{Envelope, Recipient};

    fn entry(recipient: &str, reason: DlqReason) -> DeadLetter {
        let envelope = Envelope::new(
            AgentName::parse("Alice").unwrap(),
            Recipient::parse(recipient).unwrap(),
            "body".to_string(),
        );
        DeadLetter::new(envelope, AgentName::parse(recipient).unwrap(), reason, None)
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let dlq = MemoryDlq::new();
        let e = entry("Bob", DlqReason::MaxRetriesExceeded);
        let id = e.id.clone();
        dlq.add(e.clone()).await.unwrap();
        assert_eq!(dlq.get(&id).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_acknowledge_idempotent() {
        let dlq = MemoryDlq::new();
        let e = entry("Bob", DlqReason::TtlExpired);
        let id = e.id.clone();
        dlq.add(e).await.unwrap();

        let by = AgentName::parse("operator").unwrap();
        assert!(dlq.acknowledge(&id, Some(by.clone())).await.unwrap());
        // Second acknowledgement reports no transition.
        assert!(!dlq.acknowledge(&id, Some(by)).await.unwrap());

        let stored = dlq.get(&id).await.unwrap().unwrap();
        assert!(stored.acknowledged);
        assert!(stored.acknowledged_ts.is_some());
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_id() {
        let dlq = MemoryDlq::new();
        let err = dlq.acknowledge("missing", None).await.unwrap_err();
        assert!(matches!(err, DlqError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_acknowledge_many_counts_transitions() {
        let dlq = MemoryDlq::new();
        let a = entry("Bob", DlqReason::Unknown);
        let b = entry("Bob", DlqReason::Unknown);
        let ids = vec![a.id.clone(), b.id.clone(), "missing".to_string()];
        dlq.add(a).await.unwrap();
        dlq.add(b).await.unwrap();

        assert_eq!(dlq.acknowledge_many(&ids, None).await.unwrap(), 2);
        assert_eq!(dlq.acknowledge_many(&ids, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_retry_monotone() {
        let dlq = MemoryDlq::new();
        let e = entry("Bob", DlqReason::ConnectionLost);
        let id = e.id.clone();
        dlq.add(e).await.unwrap();

        assert_eq!(dlq.increment_retry(&id).await.unwrap(), 1);
        assert_eq!(dlq.increment_retry(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let dlq = MemoryDlq::new();
        let e = entry("Bob", DlqReason::Unknown);
        let id = e.id.clone();
        dlq.add(e).await.unwrap();

        assert!(dlq.remove(&id).await.unwrap());
        assert!(!dlq.remove(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_follow_mutations() {
        let dlq = MemoryDlq::new();
        let e = entry("Bob", DlqReason::TtlExpired);
        let id = e.id.clone();
        dlq.add(e).await.unwrap();

        assert_eq!(dlq.stats().await.unwrap().unacknowledged, 1);
        dlq.acknowledge(&id, None).await.unwrap();
        // Stats are derived, never cached stale across mutations.
        assert_eq!(dlq.stats().await.unwrap().unacknowledged, 0);
        assert_eq!(dlq.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_cleanup_prefers_acknowledged() {
        let dlq = MemoryDlq::new();
        let acked = entry("Bob", DlqReason::Unknown);
        let acked_id = acked.id.clone();
        let open = entry("Bob", DlqReason::Unknown);
        let open_id = open.id.clone();
        dlq.add(acked).await.unwrap();
        dlq.add(open).await.unwrap();
        dlq.acknowledge(&acked_id, None).await.unwrap();

        // Cap of one: the acknowledged entry is evicted first.
        let removed = dlq.cleanup(Duration::from_secs(3600), 1).await.unwrap();
        assert_eq!(removed, 1);
        assert!(dlq.get(&acked_id).await.unwrap().is_none());
        assert!(dlq.get(&open_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_retention_only_hits_acknowledged() {
        let dlq = MemoryDlq::new();
        let mut old_open = entry("Bob", DlqReason::Unknown);
        old_open.dlq_ts = Utc::now() - chrono::Duration::hours(48);
        let mut old_acked = entry("Bob", DlqReason::Unknown);
        old_acked.dlq_ts = Utc::now() - chrono::Duration::hours(48);
        old_acked.acknowledged = true;
        let open_id = old_open.id.clone();
        dlq.add(old_open).await.unwrap();
        dlq.add(old_acked).await.unwrap();

        let removed = dlq.cleanup(Duration::from_secs(3600), 100).await.unwrap();
        assert_eq!(removed, 1);
        assert!(dlq.get(&open_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_retryable() {
        let dlq = MemoryDlq::new();
        let fresh = entry("Bob", DlqReason::Unknown);
        let fresh_id = fresh.id.clone();
        let exhausted = entry("Bob", DlqReason::Unknown);
        let exhausted_id = exhausted.id.clone();
        let acked = entry("Bob", DlqReason::Unknown);
        let acked_id = acked.id.clone();
        dlq.add(fresh).await.unwrap();
        dlq.add(exhausted).await.unwrap();
        dlq.add(acked).await.unwrap();

        for _ in 0..3 {
            dlq.increment_retry(&exhausted_id).await.unwrap();
        }
        dlq.acknowledge(&acked_id, None).await.unwrap();

        let retryable = dlq.get_retryable(3, 10).await.unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].id, fresh_id);
    }

    #[tokio::test]
    async fn test_query_by_recipient() {
        let dlq = MemoryDlq::new();
        dlq.add(entry("Bob", DlqReason::Unknown)).await.unwrap();
        dlq.add(entry("Carol", DlqReason::Unknown)).await.unwrap();

        let page = dlq
            .query(DlqQuery {
                to: Some(AgentName::parse("Carol").unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].recipient.as_str(), "Carol");
    }
}
