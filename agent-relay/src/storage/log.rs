//! Durable journal-backed storage adapter.
//!
//! Envelopes are buffered and flushed in batches; a batch is written when it
//! reaches `max_batch_size` records, `max_batch_bytes` bytes, or
//! `max_batch_delay` after its first record, or on explicit flush/close.
//! `append` resolves only after its batch is synced, so a resolved append is
//! a durability acknowledgement. Status updates bypass the batch and commit
//! synchronously as log-structured update records.
//!
//! On flush failure the batch is requeued, the adapter flags itself
//! degraded, and the error surfaces on the next append; a background retry
//! re-attempts the backlog until a write succeeds.

// Layer 1: Standard library imports
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

// Layer 3: Internal module imports
use super::error::StorageError;
use super::journal::Journal;
use super::traits::{HistoryQuery, StorageAdapter};
use crate::message::{Envelope, MessageStatus};
use crate::util::MessageId;

/// Record kind: a full envelope.
const REC_ENVELOPE: u8 = 1;
/// Record kind: a status/attempts update for an earlier envelope.
const REC_STATUS: u8 = 2;

/// Batching knobs for the journal writer.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush when this many records are queued
    pub max_batch_size: usize,
    /// Flush when queued payloads reach this many bytes
    pub max_batch_bytes: usize,
    /// Flush this long after the first queued record
    pub max_batch_delay: Duration,
    /// Re-attempt interval while degraded
    pub retry_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            max_batch_bytes: 256 * 1024,
            max_batch_delay: Duration::from_millis(25),
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusRecord {
    id: MessageId,
    status: MessageStatus,
    attempts: u32,
}

enum Command {
    /// Queue an envelope record for the next batch.
    Append {
        payload: Vec<u8>,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    /// Flush queued records, then write one record synchronously.
    WriteNow {
        kind: u8,
        payload: Vec<u8>,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    /// Flush queued records.
    Flush {
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    /// Flush, sync, and stop the writer.
    Close {
        done: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Journal-backed envelope store with batched writes.
#[derive(Clone)]
pub struct JournalStorage {
    inner: Arc<Inner>,
}

struct Inner {
    index: RwLock<BTreeMap<MessageId, Envelope>>,
    journal: Arc<Mutex<Journal>>,
    tx: mpsc::Sender<Command>,
    degraded_rx: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl JournalStorage {
    /// Open (or create) the journal at `path`, replay it to rebuild the
    /// index, and start the batch writer.
    pub async fn open(
        path: impl Into<PathBuf>,
        config: BatchConfig,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let (journal, records) = task::spawn_blocking(move || {
            let mut journal = Journal::open(path)?;
            let records = journal.replay()?;
            Ok::<_, StorageError>((journal, records))
        })
        .await
        .map_err(|e| StorageError::Io {
            detail: e.to_string(),
        })??;

        let mut index = BTreeMap::new();
        for record in records {
            match record.kind {
                REC_ENVELOPE => match serde_json::from_slice::<Envelope>(&record.payload) {
                    Ok(envelope) => {
                        index.insert(envelope.id.clone(), envelope);
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable envelope record"),
                },
                REC_STATUS => match serde_json::from_slice::<StatusRecord>(&record.payload) {
                    Ok(update) => {
                        if let Some(envelope) = index.get_mut(&update.id) {
                            if envelope.status.can_transition_to(update.status) {
                                envelope.status = update.status;
                            }
                            envelope.attempts = envelope.attempts.max(update.attempts);
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable status record"),
                },
                other => warn!(kind = other, "skipping unknown journal record kind"),
            }
        }
        debug!(envelopes = index.len(), "journal replayed");

        let journal = Arc::new(Mutex::new(journal));
        let (tx, rx) = mpsc::channel(1024);
        let (degraded_tx, degraded_rx) = watch::channel(false);
        tokio::spawn(run_writer(
            Arc::clone(&journal),
            rx,
            config,
            degraded_tx,
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                index: RwLock::new(index),
                journal,
                tx,
                degraded_rx,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    async fn submit(&self, command: Command) -> Result<(), StorageError> {
        self.inner
            .tx
            .send(command)
            .await
            .map_err(|_| StorageError::Closed)
    }

    async fn write_record_now(&self, kind: u8, payload: Vec<u8>) -> Result<(), StorageError> {
        let (done, rx) = oneshot::channel();
        self.submit(Command::WriteNow { kind, payload, done }).await?;
        rx.await.map_err(|_| StorageError::Closed)?
    }
}

#[async_trait]
impl StorageAdapter for JournalStorage {
    async fn append(&self, envelope: Envelope) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.is_degraded() {
            return Err(StorageError::Degraded {
                detail: "journal flush backlog outstanding".to_string(),
            });
        }

        let payload = serde_json::to_vec(&envelope)?;
        self.inner
            .index
            .write()
            .insert(envelope.id.clone(), envelope);

        let (done, rx) = oneshot::channel();
        self.submit(Command::Append { payload, done }).await?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    async fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let record = {
            let mut index = self.inner.index.write();
            match index.get_mut(id) {
                Some(envelope) if envelope.status.can_transition_to(status) => {
                    envelope.status = status;
                    StatusRecord {
                        id: id.clone(),
                        status,
                        attempts: envelope.attempts,
                    }
                }
                _ => return Ok(false),
            }
        };

        self.write_record_now(REC_STATUS, serde_json::to_vec(&record)?)
            .await?;
        Ok(true)
    }

    async fn increment_attempts(&self, id: &MessageId) -> Result<u32, StorageError> {
        self.ensure_open()?;
        let record = {
            let mut index = self.inner.index.write();
            match index.get_mut(id) {
                Some(envelope) => {
                    envelope.attempts = envelope.attempts.saturating_add(1);
                    StatusRecord {
                        id: id.clone(),
                        status: envelope.status,
                        attempts: envelope.attempts,
                    }
                }
                None => return Ok(0),
            }
        };

        let attempts = record.attempts;
        self.write_record_now(REC_STATUS, serde_json::to_vec(&record)?)
            .await?;
        Ok(attempts)
    }

    async fn get_by_id(&self, id: &MessageId) -> Result<Option<Envelope>, StorageError> {
        self.ensure_open()?;
        Ok(self.inner.index.read().get(id).cloned())
    }

    async fn list_history(&self, query: HistoryQuery) -> Result<Vec<Envelope>, StorageError> {
        self.ensure_open()?;
        Ok(query.apply(self.inner.index.read().values().cloned()))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        self.ensure_open()?;
        Ok(self.inner.index.read().len())
    }

    async fn prune(&self, retention: Duration, max_entries: usize) -> Result<usize, StorageError> {
        self.ensure_open()?;

        let (removed, survivors) = {
            let mut index = self.inner.index.write();
            let horizon = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|d| Utc::now().checked_sub_signed(d));
            let before = index.len();

            index.retain(|_, e| {
                e.status == MessageStatus::Pending || horizon.is_none_or(|h| e.ts >= h)
            });
            while index.len() > max_entries {
                let victim = index
                    .iter()
                    .find(|(_, e)| e.status != MessageStatus::Pending)
                    .or_else(|| index.iter().next())
                    .map(|(id, _)| id.clone());
                match victim {
                    Some(id) => {
                        index.remove(&id);
                    }
                    None => break,
                }
            }

            let survivors: Vec<Vec<u8>> = index
                .values()
                .map(serde_json::to_vec)
                .collect::<Result<_, _>>()?;
            (before - index.len(), survivors)
        };

        if removed > 0 {
            let journal = Arc::clone(&self.inner.journal);
            task::spawn_blocking(move || {
                journal
                    .lock()
                    .rewrite(survivors.iter().map(|p| (REC_ENVELOPE, p.as_slice())))
            })
            .await
            .map_err(|e| StorageError::Io {
                detail: e.to_string(),
            })??;
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let (done, rx) = oneshot::channel();
        self.submit(Command::Flush { done }).await?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        // The writer may already be gone; treat both as closed.
        if self.inner.tx.send(Command::Close { done }).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    fn is_degraded(&self) -> bool {
        *self.inner.degraded_rx.borrow()
    }

    fn watch_degraded(&self) -> watch::Receiver<bool> {
        self.inner.degraded_rx.clone()
    }
}

struct QueuedWrite {
    payload: Vec<u8>,
    done: Option<oneshot::Sender<Result<(), StorageError>>>,
}

/// Batch writer loop: owns the flush queue and the degraded flag.
async fn run_writer(
    journal: Arc<Mutex<Journal>>,
    mut rx: mpsc::Receiver<Command>,
    config: BatchConfig,
    degraded_tx: watch::Sender<bool>,
) {
    let mut queue: Vec<QueuedWrite> = Vec::new();
    let mut queued_bytes: usize = 0;
    let mut batch_deadline = Instant::now();

    loop {
        let degraded = *degraded_tx.borrow();
        let wake_at = if !queue.is_empty() {
            Some(if degraded {
                batch_deadline.max(Instant::now() + config.retry_interval)
            } else {
                batch_deadline
            })
        } else if degraded {
            Some(Instant::now() + config.retry_interval)
        } else {
            None
        };

        let command = match wake_at {
            Some(at) => match timeout_at(at, rx.recv()).await {
                Ok(Some(command)) => Some(command),
                Ok(None) => {
                    flush_queue(&journal, &mut queue, &mut queued_bytes, &degraded_tx).await;
                    return;
                }
                Err(_) => None, // deadline fired
            },
            None => match rx.recv().await {
                Some(command) => Some(command),
                None => return,
            },
        };

        match command {
            Some(Command::Append { payload, done }) => {
                if queue.is_empty() {
                    batch_deadline = Instant::now() + config.max_batch_delay;
                }
                queued_bytes += payload.len();
                queue.push(QueuedWrite {
                    payload,
                    done: Some(done),
                });
                if queue.len() >= config.max_batch_size || queued_bytes >= config.max_batch_bytes {
                    flush_queue(&journal, &mut queue, &mut queued_bytes, &degraded_tx).await;
                }
            }
            Some(Command::WriteNow { kind, payload, done }) => {
                // Queued envelopes must hit the journal before any update
                // record that references them.
                let flushed =
                    flush_queue(&journal, &mut queue, &mut queued_bytes, &degraded_tx).await;
                let result = if flushed {
                    write_sync(&journal, vec![(kind, payload)], &degraded_tx).await
                } else {
                    Err(StorageError::Degraded {
                        detail: "journal flush backlog outstanding".to_string(),
                    })
                };
                let _ = done.send(result);
            }
            Some(Command::Flush { done }) => {
                let flushed =
                    flush_queue(&journal, &mut queue, &mut queued_bytes, &degraded_tx).await;
                let result = if flushed {
                    Ok(())
                } else {
                    Err(StorageError::Degraded {
                        detail: "journal flush failed".to_string(),
                    })
                };
                let _ = done.send(result);
            }
            Some(Command::Close { done }) => {
                let flushed =
                    flush_queue(&journal, &mut queue, &mut queued_bytes, &degraded_tx).await;
                let result = if flushed {
                    Ok(())
                } else {
                    Err(StorageError::Degraded {
                        detail: "unflushed records at close".to_string(),
                    })
                };
                let _ = done.send(result);
                return;
            }
            None => {
                // Batch deadline or degraded retry probe.
                if queue.is_empty() {
                    probe(&journal, &degraded_tx).await;
                } else {
                    flush_queue(&journal, &mut queue, &mut queued_bytes, &degraded_tx).await;
                }
            }
        }
    }
}

/// Write and sync the queued batch. Returns true when the queue is clear.
///
/// On failure the queue is retained for the retry pass and only the degraded
/// flag changes; waiters resolve when their records eventually reach disk.
async fn flush_queue(
    journal: &Arc<Mutex<Journal>>,
    queue: &mut Vec<QueuedWrite>,
    queued_bytes: &mut usize,
    degraded_tx: &watch::Sender<bool>,
) -> bool {
    if queue.is_empty() {
        return true;
    }

    let payloads: Vec<(u8, Vec<u8>)> = queue
        .iter()
        .map(|w| (REC_ENVELOPE, w.payload.clone()))
        .collect();
    match write_sync(journal, payloads, degraded_tx).await {
        Ok(()) => {
            for write in queue.drain(..) {
                if let Some(done) = write.done {
                    let _ = done.send(Ok(()));
                }
            }
            *queued_bytes = 0;
            true
        }
        Err(e) => {
            warn!(error = %e, queued = queue.len(), "journal flush failed, batch requeued");
            false
        }
    }
}

async fn write_sync(
    journal: &Arc<Mutex<Journal>>,
    records: Vec<(u8, Vec<u8>)>,
    degraded_tx: &watch::Sender<bool>,
) -> Result<(), StorageError> {
    let journal = Arc::clone(journal);
    let result = task::spawn_blocking(move || {
        let mut journal = journal.lock();
        for (kind, payload) in &records {
            journal.append(*kind, payload)?;
        }
        journal.sync()
    })
    .await
    .map_err(|e| StorageError::Io {
        detail: e.to_string(),
    })
    .and_then(|r| r);

    match &result {
        Ok(()) => {
            if *degraded_tx.borrow() {
                debug!("journal writes recovered");
            }
            let _ = degraded_tx.send(false);
        }
        Err(e) => {
            error!(error = %e, "journal write failed");
            let _ = degraded_tx.send(true);
        }
    }
    result
}

/// Health probe while degraded with nothing queued: a successful sync of the
/// underlying file clears the flag so new appends resume.
async fn probe(journal: &Arc<Mutex<Journal>>, degraded_tx: &watch::Sender<bool>) {
    let journal = Arc::clone(journal);
    let result = task::spawn_blocking(move || journal.lock().sync()).await;
    if matches!(result, Ok(Ok(()))) {
        let _ = degraded_tx.send(false);
    }
}
