//! Per-connection session state.
//!
//! A session is the unit of presence: one agent name bound to one socket,
//! with a bounded outbound frame queue between the broker and the writer
//! task. The queue bound is the backpressure mechanism — producers block
//! when the writer falls behind.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// Layer 3: Internal module imports
use crate::protocol::ServerFrame;
use crate::util::{monotonic_epoch_ms, now_ms, AgentName, SessionId};

/// Shared handle to a live session.
pub type SessionHandle = Arc<Session>;

/// The outbound queue send half failed because the session is gone.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("session closed")]
pub struct SessionClosed;

/// Why a session was closed, carried into presence events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The peer disconnected or the transport failed
    ConnectionLost,
    /// No inbound frame within the idle window
    IdleTimeout,
    /// A newer session claimed the same agent name
    Replaced,
    /// An oversize frame arrived
    PayloadTooLarge,
    /// A malformed frame arrived
    FrameError,
    /// Broker shutdown
    Shutdown,
}

/// Transient state for one connected agent.
pub struct Session {
    id: SessionId,
    agent: AgentName,
    connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    needs_attention: AtomicBool,
    outbound: mpsc::Sender<ServerFrame>,
    closed: CancellationToken,
}

impl Session {
    /// Create a session and the receiver half of its outbound queue.
    ///
    /// The receiver is owned by the connection's writer task; when it drops,
    /// pushes fail and the session counts as closed.
    pub fn new(
        agent: AgentName,
        queue_depth: usize,
    ) -> (SessionHandle, mpsc::Receiver<ServerFrame>) {
        let (outbound, rx) = mpsc::channel(queue_depth);
        let session = Arc::new(Self {
            id: SessionId::new(),
            agent,
            connected_at: now_ms(),
            last_seen_ms: AtomicI64::new(monotonic_epoch_ms()),
            needs_attention: AtomicBool::new(false),
            outbound,
            closed: CancellationToken::new(),
        });
        (session, rx)
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The agent this session belongs to.
    pub fn agent(&self) -> &AgentName {
        &self.agent
    }

    /// When the session connected.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Record inbound activity; every received frame counts as liveness.
    pub fn touch(&self) {
        self.last_seen_ms
            .store(monotonic_epoch_ms(), Ordering::Relaxed);
    }

    /// Last inbound activity.
    pub fn last_seen(&self) -> DateTime<Utc> {
        let ms = self.last_seen_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// Set the needs-attention presence flag.
    pub fn set_needs_attention(&self, value: bool) {
        self.needs_attention.store(value, Ordering::Relaxed);
    }

    /// Current needs-attention flag.
    pub fn needs_attention(&self) -> bool {
        self.needs_attention.load(Ordering::Relaxed)
    }

    /// Queue a frame for the writer, waiting while the queue is full.
    ///
    /// Blocking here is deliberate: it is the backpressure that slows
    /// producers down to the pace of the socket.
    pub async fn push(&self, frame: ServerFrame) -> Result<(), SessionClosed> {
        self.outbound.send(frame).await.map_err(|_| SessionClosed)
    }

    /// Queue a frame without waiting; advisory traffic (events) is dropped
    /// rather than stalling the caller.
    pub fn try_push(&self, frame: ServerFrame) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Frames queued but not yet written; used by the shutdown drain.
    pub fn pending_frames(&self) -> usize {
        self.outbound
            .max_capacity()
            .saturating_sub(self.outbound.capacity())
    }

    /// Mark the session closed and wake everything waiting on it.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Token cancelled when the session closes.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Presence snapshot for admin queries and events.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            agent: self.agent.clone(),
            session_id: self.id,
            connected_at: self.connected_at.timestamp_millis(),
            last_seen: self.last_seen().timestamp_millis(),
            needs_attention: self.needs_attention(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serializable presence snapshot of one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub agent: AgentName,
    pub session_id: SessionId,
    pub connected_at: i64,
    pub last_seen: i64,
    pub needs_attention: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session(depth: usize) -> (SessionHandle, mpsc::Receiver<ServerFrame>) {
        Session::new(AgentName::parse("Alice").unwrap(), depth)
    }

    #[tokio::test]
    async fn test_push_and_receive() {
        let (session, mut rx) = session(4);
        session
            .push(ServerFrame::Pong { now: 1 })
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ServerFrame::Pong { .. })));
    }

    #[tokio::test]
    async fn test_push_after_receiver_dropped() {
        let (session, rx) = session(4);
        drop(rx);
        let err = session.push(ServerFrame::Pong { now: 1 }).await.unwrap_err();
        assert_eq!(err, SessionClosed);
    }

    #[tokio::test]
    async fn test_try_push_drops_when_full() {
        let (session, _rx) = session(1);
        assert!(session.try_push(ServerFrame::Pong { now: 1 }));
        assert!(!session.try_push(ServerFrame::Pong { now: 2 }));
    }

    #[tokio::test]
    async fn test_touch_advances_last_seen() {
        let (session, _rx) = session(1);
        let before = session.last_seen();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        session.touch();
        assert!(session.last_seen() >= before);
    }

    #[tokio::test]
    async fn test_close_is_observable() {
        let (session, _rx) = session(1);
        assert!(!session.is_closed());
        session.close();
        assert!(session.is_closed());
        // Cancelled tokens resolve immediately.
        session.closed().cancelled().await;
    }

    #[tokio::test]
    async fn test_needs_attention_flag() {
        let (session, _rx) = session(1);
        assert!(!session.needs_attention());
        session.set_needs_attention(true);
        assert!(session.needs_attention());
        assert!(session.info().needs_attention);
    }
}
