//! In-memory storage backend.
//!
//! Used by tests and by brokers running without a state directory.

// Layer 1: Standard library imports
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

// Layer 3: Internal module imports
use super::error::StorageError;
use super::traits::{HistoryQuery, StorageAdapter};
use crate::message::{Envelope, MessageStatus};
use crate::util::MessageId;

/// Volatile envelope store ordered by id.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    envelopes: BTreeMap<MessageId, Envelope>,
    closed: bool,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn append(&self, envelope: Envelope) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner.envelopes.insert(envelope.id.clone(), envelope);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        match inner.envelopes.get_mut(id) {
            Some(envelope) if envelope.status.can_transition_to(status) => {
                envelope.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_attempts(&self, id: &MessageId) -> Result<u32, StorageError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        match inner.envelopes.get_mut(id) {
            Some(envelope) => {
                envelope.attempts = envelope.attempts.saturating_add(1);
                Ok(envelope.attempts)
            }
            None => Ok(0),
        }
    }

    async fn get_by_id(&self, id: &MessageId) -> Result<Option<Envelope>, StorageError> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        Ok(inner.envelopes.get(id).cloned())
    }

    async fn list_history(&self, query: HistoryQuery) -> Result<Vec<Envelope>, StorageError> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        Ok(query.apply(inner.envelopes.values().cloned()))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        Ok(inner.envelopes.len())
    }

    async fn prune(&self, retention: Duration, max_entries: usize) -> Result<usize, StorageError> {
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        let horizon = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        let before = inner.envelopes.len();

        // Terminal envelopes past the horizon go first.
        inner.envelopes.retain(|_, e| {
            e.status == MessageStatus::Pending || horizon.is_none_or(|h| e.ts >= h)
        });

        // Enforce the cap oldest-first, terminal before pending.
        while inner.envelopes.len() > max_entries {
            let victim = inner
                .envelopes
                .iter()
                .find(|(_, e)| e.status != MessageStatus::Pending)
                .or_else(|| inner.envelopes.iter().next())
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    inner.envelopes.remove(&id);
                }
                None => break,
            }
        }

        Ok(before - inner.envelopes.len())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.inner.read().ensure_open()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.write().closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Recipient;
    use crate::storage::SortOrder;
    use crate::util::AgentName;

    fn envelope(from: &str, to: &str, body: &str) -> Envelope {
        Envelope::new(
            AgentName::parse(from).unwrap(),
            Recipient::parse(to).unwrap(),
            body.to_string(),
        )
    }

    #[tokio::test]
    async fn test_append_then_get() {
        let storage = MemoryStorage::new();
        let e = envelope("Alice", "Bob", "hi");
        let id = e.id.clone();

        storage.append(e.clone()).await.unwrap();
        assert_eq!(storage.get_by_id(&id).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let storage = MemoryStorage::new();
        let id = MessageId::from_string("nope");
        assert_eq!(storage.get_by_id(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_transition_forward() {
        let storage = MemoryStorage::new();
        let e = envelope("Alice", "Bob", "hi");
        let id = e.id.clone();
        storage.append(e).await.unwrap();

        assert!(storage
            .update_status(&id, MessageStatus::Delivered)
            .await
            .unwrap());
        assert_eq!(
            storage.get_by_id(&id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_status_non_monotone_rejected() {
        let storage = MemoryStorage::new();
        let e = envelope("Alice", "Bob", "hi");
        let id = e.id.clone();
        storage.append(e).await.unwrap();

        storage
            .update_status(&id, MessageStatus::Delivered)
            .await
            .unwrap();
        // Terminal status never moves again.
        assert!(!storage
            .update_status(&id, MessageStatus::DeadLettered)
            .await
            .unwrap());
        assert_eq!(
            storage.get_by_id(&id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_increment_attempts() {
        let storage = MemoryStorage::new();
        let e = envelope("Alice", "Bob", "hi");
        let id = e.id.clone();
        storage.append(e).await.unwrap();

        assert_eq!(storage.increment_attempts(&id).await.unwrap(), 1);
        assert_eq!(storage.increment_attempts(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_history_default_is_newest_first() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage
                .append(envelope("Alice", "Bob", &format!("m{i}")))
                .await
                .unwrap();
        }

        let history = storage.list_history(HistoryQuery::default()).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].body, "m4");
        assert_eq!(history[4].body, "m0");
    }

    #[tokio::test]
    async fn test_history_filters_and_limit() {
        let storage = MemoryStorage::new();
        storage.append(envelope("Alice", "Bob", "a1")).await.unwrap();
        storage.append(envelope("Carol", "Bob", "c1")).await.unwrap();
        storage.append(envelope("Alice", "Bob", "a2")).await.unwrap();

        let query = HistoryQuery {
            from: Some(AgentName::parse("Alice").unwrap()),
            order: SortOrder::Ascending,
            limit: 1,
            ..Default::default()
        };
        let history = storage.list_history(query).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "a1");
    }

    #[tokio::test]
    async fn test_prune_respects_pending() {
        let storage = MemoryStorage::new();
        let delivered = envelope("Alice", "Bob", "old-delivered");
        let delivered_id = delivered.id.clone();
        let pending = envelope("Alice", "Bob", "old-pending");
        let pending_id = pending.id.clone();
        storage.append(delivered).await.unwrap();
        storage.append(pending).await.unwrap();
        storage
            .update_status(&delivered_id, MessageStatus::Delivered)
            .await
            .unwrap();

        // Zero retention: terminal entries are eligible immediately.
        let removed = storage.prune(Duration::from_secs(0), 100).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get_by_id(&pending_id).await.unwrap().is_some());
        assert!(storage.get_by_id(&delivered_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_enforces_cap() {
        let storage = MemoryStorage::new();
        for i in 0..10 {
            storage
                .append(envelope("Alice", "Bob", &format!("m{i}")))
                .await
                .unwrap();
        }

        let removed = storage.prune(Duration::from_secs(3600), 4).await.unwrap();
        assert_eq!(removed, 6);
        assert_eq!(storage.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_closed_rejects_operations() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();
        let err = storage.append(envelope("A", "B", "x")).await.unwrap_err();
        assert_eq!(err, StorageError::Closed);
    }
}
