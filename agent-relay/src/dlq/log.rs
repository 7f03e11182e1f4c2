//! Durable journal-backed dead-letter queue.
//!
//! Entries and their mutations are log-structured: an entry record followed
//! by ack/retry/remove records. Mutations are rare compared to message
//! traffic, so every write commits synchronously. Cleanup compacts the
//! journal by rewriting the surviving entries.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use super::error::DlqError;
use super::memory::{apply_ack, cleanup_victims, select_retryable};
use super::traits::DlqAdapter;
use super::types::{DeadLetter, DlqQuery, DlqStats};
use crate::storage::{Journal, StorageError};
use crate::util::AgentName;

/// Record kind: a full dead-letter entry.
const REC_ENTRY: u8 = 1;
/// Record kind: an acknowledgement of an earlier entry.
const REC_ACK: u8 = 2;
/// Record kind: a retry-count increment.
const REC_RETRY: u8 = 3;
/// Record kind: an entry removal.
const REC_REMOVE: u8 = 4;

#[derive(Debug, Serialize, Deserialize)]
struct AckRecord {
    id: String,
    by: Option<AgentName>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    ts: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetryRecord {
    id: String,
    count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoveRecord {
    id: String,
}

/// Journal-backed dead-letter queue.
#[derive(Clone)]
pub struct JournalDlq {
    inner: Arc<Inner>,
}

struct Inner {
    entries: RwLock<HashMap<String, DeadLetter>>,
    journal: Arc<Mutex<Journal>>,
    closed: AtomicBool,
}

impl JournalDlq {
    /// Open (or create) the queue journal at `path` and replay it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DlqError> {
        let path = path.into();
        let (journal, records) = task::spawn_blocking(move || {
            let mut journal = Journal::open(path)?;
            let records = journal.replay()?;
            Ok::<_, StorageError>((journal, records))
        })
        .await
        .map_err(|e| StorageError::Io {
            detail: e.to_string(),
        })?
        .map_err(DlqError::Backend)?;

        let mut entries: HashMap<String, DeadLetter> = HashMap::new();
        for record in records {
            match record.kind {
                REC_ENTRY => match serde_json::from_slice::<DeadLetter>(&record.payload) {
                    Ok(entry) => {
                        entries.insert(entry.id.clone(), entry);
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable dead letter record"),
                },
                REC_ACK => {
                    if let Ok(ack) = serde_json::from_slice::<AckRecord>(&record.payload) {
                        if let Some(entry) = entries.get_mut(&ack.id) {
                            if !entry.acknowledged {
                                entry.acknowledged = true;
                                entry.acknowledged_by = ack.by;
                                entry.acknowledged_ts = Some(ack.ts);
                            }
                        }
                    }
                }
                REC_RETRY => {
                    if let Ok(retry) = serde_json::from_slice::<RetryRecord>(&record.payload) {
                        if let Some(entry) = entries.get_mut(&retry.id) {
                            entry.retry_count = entry.retry_count.max(retry.count);
                        }
                    }
                }
                REC_REMOVE => {
                    if let Ok(remove) = serde_json::from_slice::<RemoveRecord>(&record.payload) {
                        entries.remove(&remove.id);
                    }
                }
                other => warn!(kind = other, "skipping unknown dead letter record kind"),
            }
        }
        debug!(entries = entries.len(), "dead letter journal replayed");

        Ok(Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(entries),
                journal: Arc::new(Mutex::new(journal)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<(), DlqError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(DlqError::Backend(StorageError::Closed))
        } else {
            Ok(())
        }
    }

    async fn append_now(&self, kind: u8, payload: Vec<u8>) -> Result<(), DlqError> {
        let journal = Arc::clone(&self.inner.journal);
        task::spawn_blocking(move || {
            let mut journal = journal.lock();
            journal.append(kind, &payload)?;
            journal.sync()
        })
        .await
        .map_err(|e| StorageError::Io {
            detail: e.to_string(),
        })?
        .map_err(DlqError::Backend)
    }
}

#[async_trait]
impl DlqAdapter for JournalDlq {
    async fn add(&self, entry: DeadLetter) -> Result<(), DlqError> {
        self.ensure_open()?;
        let payload = serde_json::to_vec(&entry).map_err(StorageError::from)?;
        self.inner
            .entries
            .write()
            .insert(entry.id.clone(), entry);
        self.append_now(REC_ENTRY, payload).await
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetter>, DlqError> {
        self.ensure_open()?;
        Ok(self.inner.entries.read().get(id).cloned())
    }

    async fn query(&self, query: DlqQuery) -> Result<Vec<DeadLetter>, DlqError> {
        self.ensure_open()?;
        Ok(query.apply(self.inner.entries.read().values().cloned()))
    }

    async fn acknowledge(&self, id: &str, by: Option<AgentName>) -> Result<bool, DlqError> {
        self.ensure_open()?;
        let record = {
            let mut entries = self.inner.entries.write();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| DlqError::NotFound { id: id.to_string() })?;
            if !apply_ack(entry, by) {
                return Ok(false);
            }
            AckRecord {
                id: id.to_string(),
                by: entry.acknowledged_by.clone(),
                ts: entry.acknowledged_ts.unwrap_or_else(Utc::now),
            }
        };

        let payload = serde_json::to_vec(&record).map_err(StorageError::from)?;
        self.append_now(REC_ACK, payload).await?;
        Ok(true)
    }

    async fn acknowledge_many(
        &self,
        ids: &[String],
        by: Option<AgentName>,
    ) -> Result<usize, DlqError> {
        self.ensure_open()?;
        let mut transitioned = 0;
        for id in ids {
            match self.acknowledge(id, by.clone()).await {
                Ok(true) => transitioned += 1,
                Ok(false) | Err(DlqError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(transitioned)
    }

    async fn increment_retry(&self, id: &str) -> Result<u32, DlqError> {
        self.ensure_open()?;
        let record = {
            let mut entries = self.inner.entries.write();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| DlqError::NotFound { id: id.to_string() })?;
            entry.retry_count = entry.retry_count.saturating_add(1);
            RetryRecord {
                id: id.to_string(),
                count: entry.retry_count,
            }
        };

        let count = record.count;
        let payload = serde_json::to_vec(&record).map_err(StorageError::from)?;
        self.append_now(REC_RETRY, payload).await?;
        Ok(count)
    }

    async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        self.ensure_open()?;
        if self.inner.entries.write().remove(id).is_none() {
            return Ok(false);
        }
        let payload = serde_json::to_vec(&RemoveRecord { id: id.to_string() })
            .map_err(StorageError::from)?;
        self.append_now(REC_REMOVE, payload).await?;
        Ok(true)
    }

    async fn stats(&self) -> Result<DlqStats, DlqError> {
        self.ensure_open()?;
        Ok(DlqStats::derive(self.inner.entries.read().values()))
    }

    async fn cleanup(&self, retention: Duration, max_entries: usize) -> Result<usize, DlqError> {
        self.ensure_open()?;
        let survivors = {
            let mut entries = self.inner.entries.write();
            let victims = cleanup_victims(&entries, retention, max_entries);
            if victims.is_empty() {
                return Ok(0);
            }
            for id in &victims {
                entries.remove(id);
            }
            let survivors: Vec<Vec<u8>> = entries
                .values()
                .map(serde_json::to_vec)
                .collect::<Result<_, _>>()
                .map_err(StorageError::from)?;
            (victims.len(), survivors)
        };

        let (removed, payloads) = survivors;
        let journal = Arc::clone(&self.inner.journal);
        task::spawn_blocking(move || {
            journal
                .lock()
                .rewrite(payloads.iter().map(|p| (REC_ENTRY, p.as_slice())))
        })
        .await
        .map_err(|e| StorageError::Io {
            detail: e.to_string(),
        })?
        .map_err(DlqError::Backend)?;
        Ok(removed)
    }

    async fn get_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, DlqError> {
        self.ensure_open()?;
        Ok(select_retryable(
            &self.inner.entries.read(),
            max_retries,
            limit,
        ))
    }

    async fn flush(&self) -> Result<(), DlqError> {
        self.ensure_open()?;
        let journal = Arc::clone(&self.inner.journal);
        task::spawn_blocking(move || journal.lock().sync())
            .await
            .map_err(|e| StorageError::Io {
                detail: e.to_string(),
            })?
            .map_err(DlqError::Backend)
    }

    async fn close(&self) -> Result<(), DlqError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let journal = Arc::clone(&self.inner.journal);
        task::spawn_blocking(move || journal.lock().sync())
            .await
            .map_err(|e| StorageError::Io {
                detail: e.to_string(),
            })?
            .map_err(DlqError::Backend)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dlq::types::DlqReason;
    use crate::message::{Envelope, Recipient};
    use tempfile::tempdir;

    fn entry(recipient: &str, reason: DlqReason) -> DeadLetter {
        let envelope = Envelope::new(
            AgentName::parse("Alice").unwrap(),
            Recipient::parse(recipient).unwrap(),
            "body".to_string(),
        );
        DeadLetter::new(envelope, AgentName::parse(recipient).unwrap(), reason, None)
    }

    async fn open(dir: &tempfile::TempDir) -> JournalDlq {
        JournalDlq::open(dir.path().join("dlq.db")).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let dir = tempdir().unwrap();
        let dlq = open(&dir).await;
        let e = entry("Bob", DlqReason::MaxRetriesExceeded);
        let id = e.id.clone();
        dlq.add(e.clone()).await.unwrap();
        assert_eq!(dlq.get(&id).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_mutations_survive_reopen() {
        let dir = tempdir().unwrap();
        let e = entry("Bob", DlqReason::ConnectionLost);
        let id = e.id.clone();
        let removed = entry("Bob", DlqReason::Unknown);
        let removed_id = removed.id.clone();

        {
            let dlq = open(&dir).await;
            dlq.add(e).await.unwrap();
            dlq.add(removed).await.unwrap();
            dlq.acknowledge(&id, Some(AgentName::parse("operator").unwrap()))
                .await
                .unwrap();
            dlq.increment_retry(&id).await.unwrap();
            dlq.increment_retry(&id).await.unwrap();
            dlq.remove(&removed_id).await.unwrap();
            dlq.close().await.unwrap();
        }

        let dlq = open(&dir).await;
        let restored = dlq.get(&id).await.unwrap().unwrap();
        assert!(restored.acknowledged);
        assert_eq!(
            restored.acknowledged_by.as_ref().map(|a| a.as_str()),
            Some("operator")
        );
        assert_eq!(restored.retry_count, 2);
        assert!(dlq.get(&removed_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_idempotent_across_reopen() {
        let dir = tempdir().unwrap();
        let e = entry("Bob", DlqReason::TtlExpired);
        let id = e.id.clone();

        {
            let dlq = open(&dir).await;
            dlq.add(e).await.unwrap();
            assert!(dlq.acknowledge(&id, None).await.unwrap());
            dlq.close().await.unwrap();
        }

        let dlq = open(&dir).await;
        assert!(!dlq.acknowledge(&id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_compacts_journal() {
        let dir = tempdir().unwrap();
        let dlq = open(&dir).await;
        let acked = entry("Bob", DlqReason::Unknown);
        let acked_id = acked.id.clone();
        let kept = entry("Bob", DlqReason::Unknown);
        let kept_id = kept.id.clone();
        dlq.add(acked).await.unwrap();
        dlq.add(kept).await.unwrap();
        dlq.acknowledge(&acked_id, None).await.unwrap();

        let removed = dlq.cleanup(Duration::from_secs(0), 100).await.unwrap();
        assert_eq!(removed, 1);
        dlq.close().await.unwrap();

        let dlq = open(&dir).await;
        assert!(dlq.get(&acked_id).await.unwrap().is_none());
        assert!(dlq.get(&kept_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_derived_live() {
        let dir = tempdir().unwrap();
        let dlq = open(&dir).await;
        let e = entry("Bob", DlqReason::RateLimited);
        let id = e.id.clone();
        dlq.add(e).await.unwrap();

        assert_eq!(dlq.stats().await.unwrap().unacknowledged, 1);
        dlq.acknowledge(&id, None).await.unwrap();
        assert_eq!(dlq.stats().await.unwrap().unacknowledged, 0);
    }
}
