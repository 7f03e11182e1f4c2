//! Routing and delivery engine.
//!
//! Each accepted envelope is resolved to a frozen recipient set, then fed
//! through per-recipient FIFO workers: one task drains each recipient's
//! queue serially, which gives first-accepted-first-delivered ordering per
//! `(from, to)` pair while distinct recipients proceed in parallel.
//! Recipients without a session park their envelopes on offline queues;
//! terminal failures land in the dead-letter queue.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Layer 3: Internal module imports
use super::backoff::RetryBackoff;
use super::offline::OfflineQueues;
use super::ratelimit::RateLimiter;
use crate::dlq::{DeadLetter, DlqAdapter, DlqReason};
use crate::hooks::{HookEmitter, HookEvent};
use crate::message::{Envelope, MessageKind, MessageStatus, Recipient};
use crate::metrics::BrokerMetrics;
use crate::protocol::{RejectReason, ServerFrame};
use crate::registry::Registry;
use crate::storage::{HistoryQuery, SortOrder, StorageAdapter};
use crate::util::{AgentName, MessageId};

/// Maximum length of a client-supplied message id.
const MAX_CLIENT_ID_LEN: usize = 256;

/// Delivery knobs, extracted from the broker configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Body byte bound; larger sends are rejected synchronously
    pub max_body_bytes: usize,
    /// Per-recipient acknowledgement deadline
    pub ack_timeout: Duration,
    /// First retry delay
    pub initial_backoff: Duration,
    /// Retry delay cap
    pub max_backoff: Duration,
    /// Per-recipient attempt budget
    pub max_attempts: u32,
    /// Envelope time-to-live; `None` means no limit
    pub ttl: Option<Duration>,
    /// How long a lost recipient may take to reconnect mid-delivery
    pub reconnect_grace: Duration,
    /// Token bucket refill rate per sender (0 disables limiting)
    pub rate_refill_per_sec: f64,
    /// Token bucket capacity per sender
    pub rate_burst: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            ack_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
            ttl: None,
            reconnect_grace: Duration::from_secs(10),
            rate_refill_per_sec: 50.0,
            rate_burst: 100.0,
        }
    }
}

/// The validated fields of a `send` frame.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub id: Option<String>,
    pub to: String,
    pub body: String,
    pub data: Option<Map<String, Value>>,
    pub thread: Option<String>,
    pub kind: Option<String>,
}

enum WorkerJob {
    /// Deliver one envelope to this worker's recipient.
    Deliver(Envelope),
    /// Wake up and drain the recipient's offline backlog.
    DrainParked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientOutcome {
    Delivered,
    DeadLettered,
    Expired,
}

struct FanoutState {
    remaining: usize,
    delivered: usize,
    expired: usize,
}

struct EngineInner {
    config: DeliveryConfig,
    registry: Arc<Registry>,
    storage: Arc<dyn StorageAdapter>,
    dlq: Arc<dyn DlqAdapter>,
    hooks: Arc<HookEmitter>,
    metrics: Arc<BrokerMetrics>,
    backoff: RetryBackoff,
    limiter: RateLimiter,
    offline: OfflineQueues,
    workers: DashMap<AgentName, mpsc::UnboundedSender<WorkerJob>>,
    pending_acks: DashMap<(AgentName, MessageId), oneshot::Sender<()>>,
    fanouts: DashMap<MessageId, Mutex<FanoutState>>,
    online_notify: Notify,
    shutdown: CancellationToken,
}

/// Shared handle to the delivery engine.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

impl DeliveryEngine {
    /// Wire the engine to its collaborators.
    pub fn new(
        config: DeliveryConfig,
        registry: Arc<Registry>,
        storage: Arc<dyn StorageAdapter>,
        dlq: Arc<dyn DlqAdapter>,
        hooks: Arc<HookEmitter>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let backoff = RetryBackoff::new(config.initial_backoff, config.max_backoff);
        let limiter = RateLimiter::new(config.rate_refill_per_sec, config.rate_burst);
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                storage,
                dlq,
                hooks,
                metrics,
                backoff,
                limiter,
                offline: OfflineQueues::new(),
                workers: DashMap::new(),
                pending_acks: DashMap::new(),
                fanouts: DashMap::new(),
                online_notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Broker-wide counters.
    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Validate, persist, and route one send.
    ///
    /// Returns the accepted envelope (for the `ack`) or the synchronous
    /// rejection reason. Persistence completes before this returns, so a
    /// pending ack implies durability.
    pub async fn accept(
        &self,
        from: &AgentName,
        request: SendRequest,
    ) -> Result<Envelope, RejectReason> {
        let inner = &self.inner;

        if request.body.len() > inner.config.max_body_bytes {
            inner.metrics.record_rejected();
            return Err(RejectReason::PayloadTooLarge);
        }

        let to = Recipient::parse(&request.to).map_err(|_| {
            inner.metrics.record_rejected();
            RejectReason::InvalidName
        })?;

        if !inner.limiter.try_acquire(from) {
            inner.metrics.record_rejected();
            return Err(RejectReason::RateLimited);
        }

        if inner.storage.is_degraded() {
            inner.metrics.record_rejected();
            return Err(RejectReason::Backpressure);
        }

        let id = match &request.id {
            Some(raw) => {
                if raw.is_empty() || raw.len() > MAX_CLIENT_ID_LEN {
                    inner.metrics.record_rejected();
                    return Err(RejectReason::InvalidName);
                }
                let id = MessageId::from_string(raw.clone());
                match inner.storage.get_by_id(&id).await {
                    Ok(None) => id,
                    Ok(Some(_)) => {
                        inner.metrics.record_rejected();
                        return Err(RejectReason::DuplicateId);
                    }
                    Err(e) => {
                        warn!(error = %e, "duplicate check failed");
                        inner.metrics.record_rejected();
                        return Err(RejectReason::Backpressure);
                    }
                }
            }
            None => MessageId::generate(),
        };

        let mut envelope = Envelope::new(from.clone(), to.clone(), request.body).with_id(id);
        if let Some(kind) = request.kind {
            envelope = envelope.with_kind(MessageKind::from(kind));
        }
        if let Some(data) = request.data {
            envelope = envelope.with_data(data);
        }
        if let Some(thread) = request.thread {
            envelope = envelope.with_thread(thread);
        }

        inner.hooks.emit(&HookEvent::PreSend {
            envelope: envelope.clone(),
        });

        if let Err(e) = inner.storage.append(envelope.clone()).await {
            warn!(error = %e, id = %envelope.id, "append failed, rejecting send");
            inner.metrics.record_rejected();
            return Err(RejectReason::Backpressure);
        }
        inner.metrics.record_accepted();

        // Recipient set is resolved once, at accept time, and frozen.
        let targets = match &to {
            Recipient::Agent(agent) => vec![agent.clone()],
            Recipient::Broadcast => inner.registry.broadcast_snapshot(from),
            Recipient::Topic(topic) => inner.registry.topic_snapshot(topic),
        };

        if targets.is_empty() && !matches!(to, Recipient::Agent(_)) {
            // Emitted once per send, not per recipient.
            self.dead_letter_now(
                &envelope,
                from.clone(),
                DlqReason::TargetNotFound,
                format!("{to} expanded to zero receivers"),
            )
            .await;
        } else {
            inner.fanouts.insert(
                envelope.id.clone(),
                Mutex::new(FanoutState {
                    remaining: targets.len(),
                    delivered: 0,
                    expired: 0,
                }),
            );
            for target in targets {
                self.enqueue(&target, WorkerJob::Deliver(envelope.clone()));
            }
        }

        inner.hooks.emit(&HookEvent::PostSend {
            envelope: envelope.clone(),
        });
        debug!(id = %envelope.id, from = %envelope.from, to = %envelope.to, "send accepted");
        Ok(envelope)
    }

    /// Route a `delivered` acknowledgement to the waiting attempt.
    pub fn handle_delivered(&self, agent: &AgentName, id: &MessageId) {
        if let Some((_, ack)) = self
            .inner
            .pending_acks
            .remove(&(agent.clone(), id.clone()))
        {
            let _ = ack.send(());
        }
    }

    /// An agent connected: wake its worker to drain the parked backlog.
    pub fn agent_online(&self, agent: &AgentName) {
        if self.inner.offline.has_parked(agent) {
            self.enqueue(agent, WorkerJob::DrainParked);
        }
        self.inner.online_notify.notify_waiters();
    }

    /// An agent disconnected: abandon its in-flight acknowledgement waits.
    ///
    /// The waiting workers observe the dropped channel, wait out the
    /// reconnect grace, and retry or quarantine.
    pub fn agent_offline(&self, agent: &AgentName) {
        self.inner
            .pending_acks
            .retain(|(recipient, _), _| recipient != agent);
        self.inner.limiter.forget(agent);
    }

    /// Re-enqueue an envelope for one recipient (dead-letter replay).
    pub fn requeue(&self, envelope: Envelope, recipient: &AgentName) {
        self.inner.fanouts.insert(
            envelope.id.clone(),
            Mutex::new(FanoutState {
                remaining: 1,
                delivered: 0,
                expired: 0,
            }),
        );
        self.enqueue(recipient, WorkerJob::Deliver(envelope));
    }

    /// Quarantine parked envelopes that outlived the TTL.
    pub async fn expire_parked(&self) {
        let expired = self.inner.offline.take_expired(self.inner.config.ttl);
        for (recipient, envelope) in expired {
            self.inner.metrics.record_expired();
            dead_letter(
                &self.inner,
                &envelope,
                recipient,
                DlqReason::TtlExpired,
                "expired while parked for an offline recipient".to_string(),
            )
            .await;
            complete_recipient(&self.inner, &envelope, RecipientOutcome::Expired).await;
        }
    }

    /// Dead-letter envelopes still pending from a previous broker run.
    ///
    /// Offline queues are in-memory, so a restart cannot resume them; the
    /// persisted envelopes are swept into the queue as `connection_lost`.
    pub async fn sweep_stale_pending(&self) {
        let query = HistoryQuery {
            order: SortOrder::Ascending,
            limit: usize::MAX,
            ..Default::default()
        };
        let envelopes = match self.inner.storage.list_history(query).await {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "stale pending sweep failed");
                return;
            }
        };
        let mut swept = 0usize;
        for envelope in envelopes {
            if envelope.status != MessageStatus::Pending {
                continue;
            }
            let recipient = match &envelope.to {
                Recipient::Agent(agent) => agent.clone(),
                _ => envelope.from.clone(),
            };
            self.dead_letter_now(
                &envelope,
                recipient,
                DlqReason::ConnectionLost,
                "pending at broker restart".to_string(),
            )
            .await;
            swept += 1;
        }
        if swept > 0 {
            info!(swept, "stale pending envelopes quarantined");
        }
    }

    /// Stop the delivery workers.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn enqueue(&self, recipient: &AgentName, job: WorkerJob) {
        let inner = &self.inner;
        let tx = inner
            .workers
            .entry(recipient.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker_inner = Arc::clone(inner);
                let worker_recipient = recipient.clone();
                tokio::spawn(run_worker(worker_inner, worker_recipient, rx));
                tx
            })
            .clone();
        if tx.send(job).is_err() {
            warn!(recipient = %recipient, "delivery worker gone, job dropped");
        }
    }

    async fn dead_letter_now(
        &self,
        envelope: &Envelope,
        recipient: AgentName,
        reason: DlqReason,
        detail: String,
    ) {
        dead_letter(&self.inner, envelope, recipient, reason, detail).await;
        let status = if reason == DlqReason::TtlExpired {
            MessageStatus::Expired
        } else {
            MessageStatus::DeadLettered
        };
        if let Err(e) = self.inner.storage.update_status(&envelope.id, status).await {
            warn!(error = %e, id = %envelope.id, "status update failed");
        }
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("workers", &self.inner.workers.len())
            .field("parked", &self.inner.offline.total_parked())
            .finish()
    }
}

/// One worker per recipient drains that recipient's queue serially.
async fn run_worker(
    inner: Arc<EngineInner>,
    recipient: AgentName,
    mut rx: mpsc::UnboundedReceiver<WorkerJob>,
) {
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };

        // Parked backlog always goes first to preserve accept order.
        if inner.registry.is_online(&recipient) && inner.offline.has_parked(&recipient) {
            for envelope in inner.offline.drain(&recipient) {
                deliver_one(&inner, &recipient, envelope).await;
            }
        }

        match job {
            WorkerJob::Deliver(envelope) => deliver_one(&inner, &recipient, envelope).await,
            WorkerJob::DrainParked => {}
        }
    }
}

/// Deliver one envelope to one recipient, retrying with backoff, until a
/// terminal outcome.
async fn deliver_one(inner: &Arc<EngineInner>, recipient: &AgentName, envelope: Envelope) {
    let mut attempts: u32 = 0;

    loop {
        if inner.shutdown.is_cancelled() {
            // Past the drain boundary; the restart sweep quarantines it.
            return;
        }

        if envelope.is_expired(inner.config.ttl) {
            inner.metrics.record_expired();
            dead_letter(
                inner,
                &envelope,
                recipient.clone(),
                DlqReason::TtlExpired,
                format!("expired after {attempts} attempts"),
            )
            .await;
            complete_recipient(inner, &envelope, RecipientOutcome::Expired).await;
            return;
        }

        let Some(session) = inner.registry.resolve(recipient) else {
            inner.offline.park(recipient, envelope);
            return;
        };

        attempts += 1;
        if let Err(e) = inner.storage.increment_attempts(&envelope.id).await {
            warn!(error = %e, id = %envelope.id, "attempt bookkeeping failed");
        }
        inner.hooks.emit(&HookEvent::PreDeliver {
            envelope: envelope.clone(),
            recipient: recipient.clone(),
            attempt: attempts,
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        inner
            .pending_acks
            .insert((recipient.clone(), envelope.id.clone()), ack_tx);

        let mut outbound = envelope.clone();
        outbound.attempts = attempts;
        let pushed = tokio::select! {
            result = session.push(ServerFrame::Deliver { envelope: outbound }) => result.is_ok(),
            _ = session.closed().cancelled() => false,
        };

        if !pushed {
            inner
                .pending_acks
                .remove(&(recipient.clone(), envelope.id.clone()));
            if wait_for_reconnect(inner, recipient).await {
                continue;
            }
            dead_letter(
                inner,
                &envelope,
                recipient.clone(),
                DlqReason::ConnectionLost,
                format!("session lost during attempt {attempts}"),
            )
            .await;
            complete_recipient(inner, &envelope, RecipientOutcome::DeadLettered).await;
            return;
        }

        match timeout(inner.config.ack_timeout, ack_rx).await {
            Ok(Ok(())) => {
                inner.metrics.record_delivered();
                inner.hooks.emit(&HookEvent::PostDeliver {
                    envelope: envelope.clone(),
                    recipient: recipient.clone(),
                    attempts,
                });
                complete_recipient(inner, &envelope, RecipientOutcome::Delivered).await;
                return;
            }
            Ok(Err(_)) => {
                // The ack sender was dropped: the session went away mid
                // attempt. Give the agent the grace window to come back.
                if wait_for_reconnect(inner, recipient).await {
                    continue;
                }
                dead_letter(
                    inner,
                    &envelope,
                    recipient.clone(),
                    DlqReason::ConnectionLost,
                    format!("no reconnect within grace after attempt {attempts}"),
                )
                .await;
                complete_recipient(inner, &envelope, RecipientOutcome::DeadLettered).await;
                return;
            }
            Err(_) => {
                inner
                    .pending_acks
                    .remove(&(recipient.clone(), envelope.id.clone()));
                if attempts >= inner.config.max_attempts {
                    dead_letter(
                        inner,
                        &envelope,
                        recipient.clone(),
                        DlqReason::MaxRetriesExceeded,
                        format!("no acknowledgement after {attempts} attempts"),
                    )
                    .await;
                    complete_recipient(inner, &envelope, RecipientOutcome::DeadLettered).await;
                    return;
                }
                sleep(inner.backoff.delay_for(attempts)).await;
            }
        }
    }
}

/// Wait up to the reconnect grace for the recipient to come back online.
async fn wait_for_reconnect(inner: &Arc<EngineInner>, recipient: &AgentName) -> bool {
    let deadline = Instant::now() + inner.config.reconnect_grace;
    loop {
        // Arm the notification before checking, so a connect between the
        // check and the wait is not missed.
        let notified = inner.online_notify.notified();
        if inner.registry.is_online(recipient) {
            return true;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(deadline) => {
                return inner.registry.is_online(recipient);
            }
            _ = inner.shutdown.cancelled() => return false,
        }
    }
}

async fn dead_letter(
    inner: &Arc<EngineInner>,
    envelope: &Envelope,
    recipient: AgentName,
    reason: DlqReason,
    detail: String,
) {
    let mut quarantined = envelope.clone();
    if let Ok(Some(stored)) = inner.storage.get_by_id(&envelope.id).await {
        quarantined.attempts = stored.attempts;
    }
    let entry = DeadLetter::new(quarantined, recipient.clone(), reason, Some(detail));
    inner.metrics.record_dead_lettered();
    if let Err(e) = inner.dlq.add(entry.clone()).await {
        warn!(error = %e, id = %envelope.id, "dead letter insert failed");
    }
    inner.hooks.emit(&HookEvent::DeadLetter { entry });
    debug!(id = %envelope.id, recipient = %recipient, reason = %reason, "delivery quarantined");
}

/// Record one recipient's terminal outcome; the last one settles the
/// envelope's status.
async fn complete_recipient(
    inner: &Arc<EngineInner>,
    envelope: &Envelope,
    outcome: RecipientOutcome,
) {
    let final_status = {
        let Some(state) = inner.fanouts.get(&envelope.id) else {
            return;
        };
        let mut state = state.lock();
        state.remaining = state.remaining.saturating_sub(1);
        match outcome {
            RecipientOutcome::Delivered => state.delivered += 1,
            RecipientOutcome::Expired => state.expired += 1,
            RecipientOutcome::DeadLettered => {}
        }
        if state.remaining > 0 {
            None
        } else if state.delivered > 0 {
            Some(MessageStatus::Delivered)
        } else if state.expired > 0 && state.delivered == 0 {
            Some(MessageStatus::Expired)
        } else {
            Some(MessageStatus::DeadLettered)
        }
    };

    if let Some(status) = final_status {
        inner.fanouts.remove(&envelope.id);
        if let Err(e) = inner.storage.update_status(&envelope.id, status).await {
            warn!(error = %e, id = %envelope.id, "status update failed");
        }
    }
}
