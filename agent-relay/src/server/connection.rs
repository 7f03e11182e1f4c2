//! Per-connection reader/writer pair.
//!
//! Each accepted socket gets one reader task (this function) and one writer
//! task sharing the session's bounded outbound queue. The reader enforces
//! the hello-first handshake and the idle timeout; the writer interleaves
//! queued frames with heartbeat pings.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info};

// Layer 3: Internal module imports
use super::admin;
use super::Shared;
use super::SERVER_VERSION;
use crate::delivery::SendRequest;
use crate::hooks::HookEvent;
use crate::protocol::{
    event_kind, parse_client_frame, ClientFrame, ErrorCode, FrameCodec, FrameParseError,
    AckStatus, ServerFrame,
};
use crate::registry::TopicPattern;
use crate::session::{CloseReason, Session, SessionHandle};
use crate::util::{monotonic_epoch_ms, AgentName, MessageId};

type Writer = SplitSink<Framed<UnixStream, FrameCodec>, ServerFrame>;
type Reader = SplitStream<Framed<UnixStream, FrameCodec>>;

/// Drive one client connection from accept to cleanup.
pub(crate) async fn handle_connection(shared: Shared, stream: UnixStream) {
    let codec = FrameCodec::new(shared.config.max_frame_bytes);
    let mut framed = Framed::new(stream, codec);

    let Some((agent, subscriptions)) = handshake(&shared, &mut framed).await else {
        return;
    };

    let (session, outbound_rx) = Session::new(agent.clone(), shared.config.outbound_queue_depth);
    let (sink, inbound) = framed.split::<ServerFrame>();
    let writer = tokio::spawn(run_writer(
        sink,
        outbound_rx,
        session.clone(),
        shared.config.heartbeat,
    ));

    // Queue the welcome before the session becomes routable, so it is the
    // first frame the client observes.
    let welcome = ServerFrame::Welcome {
        server_version: SERVER_VERSION.to_string(),
        session_id: session.id(),
        now: monotonic_epoch_ms(),
    };
    if session.push(welcome).await.is_err() {
        session.close();
        let _ = writer.await;
        return;
    }

    if let Some(old) = shared.registry.register(session.clone()) {
        info!(agent = %agent, "session replaced by a newer hello");
        old.try_push(ServerFrame::Error {
            code: ErrorCode::Replaced,
        });
        old.close();
    }

    for raw in subscriptions {
        apply_subscribe(&shared, &session, &raw).await;
    }

    announce_presence(&shared, &agent, true);
    shared.engine.agent_online(&agent);
    debug!(agent = %agent, session = %session.id(), "agent connected");

    let reason = read_loop(&shared, &session, inbound).await;

    cleanup(&shared, &session, reason).await;
    let _ = writer.await;
}

/// Wait for a valid `hello` within the connect timeout.
async fn handshake(
    shared: &Shared,
    framed: &mut Framed<UnixStream, FrameCodec>,
) -> Option<(AgentName, Vec<String>)> {
    let first = timeout(shared.config.connect_timeout, framed.next()).await;
    let bytes = match first {
        Ok(Some(Ok(bytes))) => bytes,
        Ok(Some(Err(e))) => {
            let code = if e.is_oversize() {
                ErrorCode::PayloadTooLarge
            } else {
                ErrorCode::FrameError
            };
            let _ = framed.send(ServerFrame::Error { code }).await;
            return None;
        }
        Ok(None) | Err(_) => return None,
    };

    match parse_client_frame(&bytes) {
        Ok(ClientFrame::Hello {
            agent,
            version,
            subscriptions,
        }) => match AgentName::parse(agent) {
            Ok(agent) => {
                debug!(agent = %agent, version = version.as_deref().unwrap_or("-"), "hello");
                Some((agent, subscriptions))
            }
            Err(e) => {
                debug!(error = %e, "hello with invalid agent name");
                let _ = framed
                    .send(ServerFrame::Error {
                        code: ErrorCode::InvalidName,
                    })
                    .await;
                None
            }
        },
        Ok(_) => {
            let _ = framed
                .send(ServerFrame::Error {
                    code: ErrorCode::HelloRequired,
                })
                .await;
            None
        }
        Err(FrameParseError::UnknownType(_)) => {
            let _ = framed
                .send(ServerFrame::Error {
                    code: ErrorCode::UnknownKind,
                })
                .await;
            None
        }
        Err(FrameParseError::Malformed(_)) => {
            let _ = framed
                .send(ServerFrame::Error {
                    code: ErrorCode::FrameError,
                })
                .await;
            None
        }
    }
}

/// Read frames until the session ends; returns why it ended.
async fn read_loop(shared: &Shared, session: &SessionHandle, mut inbound: Reader) -> CloseReason {
    loop {
        let idle_elapsed = (chrono::Utc::now() - session.last_seen())
            .to_std()
            .unwrap_or_default();
        let idle_remaining = shared
            .config
            .idle_timeout
            .saturating_sub(idle_elapsed)
            .max(Duration::from_millis(1));

        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(bytes)) => {
                    session.touch();
                    if let Some(reason) = dispatch(shared, session, &bytes).await {
                        return reason;
                    }
                }
                Some(Err(e)) if e.is_oversize() => {
                    session.try_push(ServerFrame::Error {
                        code: ErrorCode::PayloadTooLarge,
                    });
                    return CloseReason::PayloadTooLarge;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "frame decode failed");
                    session.try_push(ServerFrame::Error {
                        code: ErrorCode::FrameError,
                    });
                    return CloseReason::FrameError;
                }
                None => return CloseReason::ConnectionLost,
            },
            _ = sleep(idle_remaining) => {
                // Re-check: another task may have observed traffic.
                let quiet = (chrono::Utc::now() - session.last_seen())
                    .to_std()
                    .unwrap_or_default();
                if quiet >= shared.config.idle_timeout {
                    session.try_push(ServerFrame::Error {
                        code: ErrorCode::IdleTimeout,
                    });
                    return CloseReason::IdleTimeout;
                }
            },
            _ = session.closed().cancelled() => return CloseReason::Replaced,
            _ = shared.shutdown.cancelled() => return CloseReason::Shutdown,
        }
    }
}

/// Handle one inbound frame. `Some(reason)` closes the session.
async fn dispatch(
    shared: &Shared,
    session: &SessionHandle,
    bytes: &[u8],
) -> Option<CloseReason> {
    let frame = match parse_client_frame(bytes) {
        Ok(frame) => frame,
        Err(FrameParseError::UnknownType(frame_type)) => {
            debug!(frame_type, "unknown frame type");
            session.try_push(ServerFrame::Error {
                code: ErrorCode::UnknownKind,
            });
            return None;
        }
        Err(FrameParseError::Malformed(e)) => {
            debug!(error = %e, "malformed frame");
            session.try_push(ServerFrame::Error {
                code: ErrorCode::FrameError,
            });
            return Some(CloseReason::FrameError);
        }
    };

    match frame {
        ClientFrame::Hello { .. } => {
            // The handshake already happened; a repeat hello is ignored.
            debug!(agent = %session.agent(), "ignoring repeated hello");
        }
        ClientFrame::Send {
            id,
            to,
            body,
            data,
            thread,
            kind,
        } => {
            let request = SendRequest {
                id: id.clone(),
                to,
                body,
                data,
                thread,
                kind,
            };
            let ack = match shared.engine.accept(session.agent(), request).await {
                Ok(envelope) => ServerFrame::Ack {
                    id: envelope.id,
                    status: AckStatus::Pending,
                    reason: None,
                },
                Err(reason) => ServerFrame::Ack {
                    id: id
                        .map(MessageId::from_string)
                        .unwrap_or_else(MessageId::generate),
                    status: AckStatus::Rejected,
                    reason: Some(reason),
                },
            };
            if session.push(ack).await.is_err() {
                return Some(CloseReason::ConnectionLost);
            }
        }
        ClientFrame::Subscribe { topic } => {
            apply_subscribe(shared, session, &topic).await;
        }
        ClientFrame::Unsubscribe { topic } => match TopicPattern::parse(&topic) {
            Ok(pattern) => {
                shared.registry.unsubscribe(session.agent(), &pattern);
                session.try_push(ServerFrame::Event {
                    kind: event_kind::UNSUBSCRIBED.to_string(),
                    payload: json!({ "topic": topic }),
                });
            }
            Err(_) => {
                session.try_push(ServerFrame::Error {
                    code: ErrorCode::InvalidName,
                });
            }
        },
        ClientFrame::Ping => {
            if session
                .push(ServerFrame::Pong {
                    now: monotonic_epoch_ms(),
                })
                .await
                .is_err()
            {
                return Some(CloseReason::ConnectionLost);
            }
        }
        ClientFrame::Status { needs_attention } => {
            if let Some(needs_attention) = needs_attention {
                session.set_needs_attention(needs_attention);
            }
        }
        ClientFrame::Delivered { id } => {
            shared.engine.handle_delivered(session.agent(), &id);
        }
        ClientFrame::Admin { op, args } => {
            let result = admin::handle(shared, session, &op, args).await;
            session.try_push(ServerFrame::Event {
                kind: event_kind::ADMIN_RESULT.to_string(),
                payload: json!({ "op": op, "result": result }),
            });
        }
    }
    None
}

async fn apply_subscribe(shared: &Shared, session: &SessionHandle, raw: &str) {
    match TopicPattern::parse(raw) {
        Ok(pattern) => {
            shared.registry.subscribe(session.agent(), pattern);
            session.try_push(ServerFrame::Event {
                kind: event_kind::SUBSCRIBED.to_string(),
                payload: json!({ "topic": raw }),
            });
        }
        Err(e) => {
            debug!(topic = raw, error = %e, "invalid subscription pattern");
            session.try_push(ServerFrame::Error {
                code: ErrorCode::InvalidName,
            });
        }
    }
}

fn announce_presence(shared: &Shared, agent: &AgentName, online: bool) {
    shared.hooks.emit(&HookEvent::PresenceChange {
        agent: agent.clone(),
        online,
    });
    shared.broadcast_event(
        event_kind::PRESENCE,
        json!({ "agent": agent, "online": online }),
    );
}

async fn cleanup(shared: &Shared, session: &SessionHandle, reason: CloseReason) {
    session.close();
    let agent = session.agent().clone();
    let removed = shared.registry.unregister(&agent, session.id());
    if removed.is_some() {
        shared.engine.agent_offline(&agent);
        announce_presence(shared, &agent, false);
        info!(agent = %agent, reason = ?reason, "agent disconnected");
    } else {
        debug!(agent = %agent, reason = ?reason, "replaced session finished");
    }
}

/// Writer half: queued frames plus heartbeat pings after outbound silence.
async fn run_writer(
    mut sink: Writer,
    mut outbound: mpsc::Receiver<ServerFrame>,
    session: SessionHandle,
    heartbeat: Duration,
) {
    let mut last_write = Instant::now();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                    last_write = Instant::now();
                }
                None => break,
            },
            _ = sleep_until(last_write + heartbeat) => {
                let ping = ServerFrame::Ping {
                    now: monotonic_epoch_ms(),
                };
                if sink.send(ping).await.is_err() {
                    break;
                }
                last_write = Instant::now();
            },
            _ = session.closed().cancelled() => {
                // Best-effort drain of already-queued frames.
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "socket close failed");
    }
    session.close();
}
