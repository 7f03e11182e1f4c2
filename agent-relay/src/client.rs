//! Minimal broker client.
//!
//! Used by the integration tests and by wrappers that spawn agent
//! processes: connect, identify, send, receive deliveries, acknowledge.
//! The client is sequential; frames that arrive while waiting for a
//! specific reply are buffered and handed out by later reads.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::io;
use std::path::Path;

// Layer 2: Third-party crate imports
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

// Layer 3: Internal module imports
use crate::message::Envelope;
use crate::protocol::{
    parse_server_frame, AckStatus, ClientFrame, FrameCodec, ProtocolError, RejectReason,
    ServerFrame,
};
use crate::util::{MessageId, SessionId};

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket connect failed
    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),

    /// Transport failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The broker sent something undecodable
    #[error("broker frame undecodable: {0}")]
    Decode(#[from] serde_json::Error),

    /// The broker closed the connection
    #[error("connection closed by broker")]
    Closed,

    /// The broker answered the handshake with an error frame
    #[error("handshake rejected: {code:?}")]
    HandshakeRejected { code: crate::protocol::ErrorCode },

    /// A reply arrived that the protocol does not allow here
    #[error("unexpected frame: {0:?}")]
    Unexpected(Box<ServerFrame>),
}

/// Broker identity returned by the handshake.
#[derive(Debug, Clone)]
pub struct Welcome {
    pub server_version: String,
    pub session_id: SessionId,
    pub now: i64,
}

/// Optional fields of a send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub id: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub thread: Option<String>,
    pub kind: Option<String>,
}

/// Broker verdict on one send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub id: MessageId,
    pub status: AckStatus,
    pub reason: Option<RejectReason>,
}

impl SendOutcome {
    /// Whether the broker accepted and persisted the envelope.
    pub fn is_pending(&self) -> bool {
        self.status == AckStatus::Pending
    }
}

/// A connected, identified broker client.
pub struct RelayClient {
    framed: Framed<UnixStream, FrameCodec>,
    buffered: VecDeque<ServerFrame>,
}

impl RelayClient {
    /// Connect and identify as `agent`.
    pub async fn connect(
        path: impl AsRef<Path>,
        agent: &str,
    ) -> Result<(Self, Welcome), ClientError> {
        Self::connect_with(path, agent, None, Vec::new()).await
    }

    /// Connect with a client version string and initial subscriptions.
    pub async fn connect_with(
        path: impl AsRef<Path>,
        agent: &str,
        version: Option<String>,
        subscriptions: Vec<String>,
    ) -> Result<(Self, Welcome), ClientError> {
        let stream = UnixStream::connect(path).await?;
        let mut framed = Framed::new(stream, FrameCodec::default());

        framed
            .send(ClientFrame::Hello {
                agent: agent.to_string(),
                version,
                subscriptions,
            })
            .await?;

        let mut client = Self {
            framed,
            buffered: VecDeque::new(),
        };
        loop {
            match client.next_raw().await? {
                ServerFrame::Welcome {
                    server_version,
                    session_id,
                    now,
                } => {
                    return Ok((
                        client,
                        Welcome {
                            server_version,
                            session_id,
                            now,
                        },
                    ))
                }
                ServerFrame::Error { code } => {
                    return Err(ClientError::HandshakeRejected { code })
                }
                other => client.buffered.push_back(other),
            }
        }
    }

    /// Send a message and wait for the broker's ack.
    pub async fn send(&mut self, to: &str, body: &str) -> Result<SendOutcome, ClientError> {
        self.send_with(to, body, SendOptions::default()).await
    }

    /// Send with explicit id/data/thread/kind.
    pub async fn send_with(
        &mut self,
        to: &str,
        body: &str,
        options: SendOptions,
    ) -> Result<SendOutcome, ClientError> {
        self.framed
            .send(ClientFrame::Send {
                id: options.id,
                to: to.to_string(),
                body: body.to_string(),
                data: options.data,
                thread: options.thread,
                kind: options.kind,
            })
            .await?;

        loop {
            match self.next_raw().await? {
                ServerFrame::Ack { id, status, reason } => {
                    return Ok(SendOutcome { id, status, reason })
                }
                other => self.buffered.push_back(other),
            }
        }
    }

    /// Next frame from the broker, buffered frames first.
    pub async fn next_frame(&mut self) -> Result<ServerFrame, ClientError> {
        if let Some(frame) = self.buffered.pop_front() {
            return Ok(frame);
        }
        self.next_raw().await
    }

    /// Next delivered envelope, skipping events and pongs.
    pub async fn next_deliver(&mut self) -> Result<Envelope, ClientError> {
        loop {
            if let ServerFrame::Deliver { envelope } = self.next_frame().await? {
                return Ok(envelope);
            }
        }
    }

    /// Next event frame of the given kind.
    pub async fn next_event(&mut self, kind: &str) -> Result<Value, ClientError> {
        loop {
            if let ServerFrame::Event {
                kind: event,
                payload,
            } = self.next_frame().await?
            {
                if event == kind {
                    return Ok(payload);
                }
            }
        }
    }

    /// Acknowledge a delivered envelope.
    pub async fn ack(&mut self, id: &MessageId) -> Result<(), ClientError> {
        self.framed
            .send(ClientFrame::Delivered { id: id.clone() })
            .await?;
        Ok(())
    }

    /// Register a topic subscription.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.framed
            .send(ClientFrame::Subscribe {
                topic: topic.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Remove a topic subscription.
    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.framed
            .send(ClientFrame::Unsubscribe {
                topic: topic.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Update the needs-attention presence flag.
    pub async fn set_needs_attention(&mut self, value: bool) -> Result<(), ClientError> {
        self.framed
            .send(ClientFrame::Status {
                needs_attention: Some(value),
            })
            .await?;
        Ok(())
    }

    /// Round-trip a ping; returns the broker clock.
    pub async fn ping(&mut self) -> Result<i64, ClientError> {
        self.framed.send(ClientFrame::Ping).await?;
        loop {
            match self.next_raw().await? {
                ServerFrame::Pong { now } => return Ok(now),
                other => self.buffered.push_back(other),
            }
        }
    }

    /// Run an admin operation and wait for its result payload.
    pub async fn admin(&mut self, op: &str, args: Value) -> Result<Value, ClientError> {
        self.framed
            .send(ClientFrame::Admin {
                op: op.to_string(),
                args,
            })
            .await?;
        loop {
            match self.next_raw().await? {
                ServerFrame::Event { kind, payload } if kind == "admin_result" => {
                    return Ok(payload)
                }
                other => self.buffered.push_back(other),
            }
        }
    }

    /// Read one frame, answering broker heartbeat pings transparently.
    async fn next_raw(&mut self) -> Result<ServerFrame, ClientError> {
        loop {
            match self.framed.next().await {
                Some(Ok(bytes)) => match parse_server_frame(&bytes)? {
                    ServerFrame::Ping { .. } => {
                        self.framed.send(ClientFrame::Ping).await?;
                    }
                    frame => return Ok(frame),
                },
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::Closed),
            }
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("buffered", &self.buffered.len())
            .finish()
    }
}
