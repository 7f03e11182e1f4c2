//! Wire frame grammar.
//!
//! Every frame is one JSON object whose `type` field names the frame. Field
//! keys are lower-camel-case. Unknown keys are ignored; an unknown `type`
//! elicits `error { code: "unknown_kind" }` from the broker. The `kind` key
//! is left to payloads (message kinds, event kinds) and never discriminates
//! frames.

// Layer 1: Standard library imports
use std::fmt::{self, Display};

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// Layer 3: Internal module imports
use crate::message::Envelope;
use crate::util::{MessageId, SessionId};

/// Frames sent by a client to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Identity handshake; must be the first frame on a connection.
    Hello {
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        subscriptions: Vec<String>,
    },

    /// Submit a message for routing.
    Send {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        to: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },

    /// Register a topic subscription for this session.
    Subscribe { topic: String },

    /// Remove a topic subscription from this session.
    Unsubscribe { topic: String },

    /// Liveness probe; any frame counts as liveness, ping forces a reply.
    Ping,

    /// Presence update.
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        needs_attention: Option<bool>,
    },

    /// Acknowledge receipt of a delivered envelope.
    Delivered { id: MessageId },

    /// Administrative operation; authorized by socket permissions only.
    Admin {
        op: String,
        #[serde(default)]
        args: Value,
    },
}

/// Frames pushed by the broker to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Successful handshake reply.
    Welcome {
        server_version: String,
        session_id: SessionId,
        now: i64,
    },

    /// Outcome of a `send` frame.
    Ack {
        id: MessageId,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
    },

    /// An envelope addressed to this session.
    Deliver { envelope: Envelope },

    /// Out-of-band notification: presence, alerts, admin results.
    Event {
        kind: String,
        #[serde(default)]
        payload: Value,
    },

    /// Broker-initiated heartbeat, sent after outbound silence.
    Ping { now: i64 },

    /// Heartbeat reply.
    Pong { now: i64 },

    /// Protocol-level failure.
    Error { code: ErrorCode },
}

/// Ack outcome for a `send` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Accepted and persisted; delivery in progress
    Pending,
    /// Rejected synchronously; no state change
    Rejected,
}

/// Synchronous rejection reasons surfaced in `ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Sender, recipient, or topic name failed validation
    InvalidName,
    /// Body exceeds the configured bound
    PayloadTooLarge,
    /// An envelope with this id is already persisted
    DuplicateId,
    /// Unrecognized frame or field shape
    UnknownKind,
    /// Sender exceeded its token bucket
    RateLimited,
    /// Broker is refusing new sends (degraded storage or saturation)
    Backpressure,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidName => "invalid_name",
            Self::PayloadTooLarge => "payload_too_large",
            Self::DuplicateId => "duplicate_id",
            Self::UnknownKind => "unknown_kind",
            Self::RateLimited => "rate_limited",
            Self::Backpressure => "backpressure",
        };
        write!(f, "{s}")
    }
}

/// Codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame `type` not recognized
    UnknownKind,
    /// Frame could not be decoded; session closes
    FrameError,
    /// No inbound frame within the idle window; session closes
    IdleTimeout,
    /// Frame exceeded the configured byte bound; session closes
    PayloadTooLarge,
    /// A newer session claimed this agent name; session closes
    Replaced,
    /// A frame arrived before `hello`
    HelloRequired,
    /// `hello` carried an invalid agent name
    InvalidName,
}

/// Event kinds emitted in `event` frames.
pub mod event_kind {
    /// Presence change: `{ agent, online }`
    pub const PRESENCE: &str = "presence";
    /// Broker shutdown in progress
    pub const SHUTDOWN: &str = "shutdown";
    /// Storage degraded; new sends are rejected
    pub const DEGRADED: &str = "degraded";
    /// Memory monitor alert
    pub const MEMORY_ALERT: &str = "memory_alert";
    /// Reply to an `admin` frame
    pub const ADMIN_RESULT: &str = "admin_result";
    /// Topic subscription confirmed
    pub const SUBSCRIBED: &str = "subscribed";
    /// Topic subscription removed
    pub const UNSUBSCRIBED: &str = "unsubscribed";
}

const KNOWN_CLIENT_TYPES: &[&str] = &[
    "hello",
    "send",
    "subscribe",
    "unsubscribe",
    "ping",
    "status",
    "delivered",
    "admin",
];

/// Failure modes when parsing an inbound client frame.
#[derive(Debug, Error)]
pub enum FrameParseError {
    /// The frame `type` is not in the grammar; reply `unknown_kind`,
    /// session stays open.
    #[error("unknown frame type {0:?}")]
    UnknownType(String),

    /// The payload is not a valid frame; session closes with `frame_error`.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse one inbound frame body, distinguishing unknown frame types from
/// malformed payloads so the session layer can keep or close the connection.
pub fn parse_client_frame(bytes: &[u8]) -> Result<ClientFrame, FrameParseError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match serde_json::from_value::<ClientFrame>(value) {
        Ok(frame) => Ok(frame),
        Err(err) => match frame_type {
            Some(t) if !KNOWN_CLIENT_TYPES.contains(&t.as_str()) => {
                Err(FrameParseError::UnknownType(t))
            }
            _ => Err(FrameParseError::Malformed(err)),
        },
    }
}

/// Parse one inbound broker frame (client side).
pub fn parse_server_frame(bytes: &[u8]) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Recipient;
    use crate::util::AgentName;

    #[test]
    fn test_hello_roundtrip() {
        let json = r#"{"type":"hello","agent":"Alice","version":"1.0","subscriptions":["deploys"]}"#;
        let frame = parse_client_frame(json.as_bytes()).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Hello {
                agent: "Alice".to_string(),
                version: Some("1.0".to_string()),
                subscriptions: vec!["deploys".to_string()],
            }
        );
    }

    #[test]
    fn test_send_minimal() {
        let json = r#"{"type":"send","to":"Bob","body":"hi"}"#;
        let frame = parse_client_frame(json.as_bytes()).unwrap();
        match frame {
            ClientFrame::Send { id, to, body, .. } => {
                assert_eq!(id, None);
                assert_eq!(to, "Bob");
                assert_eq!(body, "hi");
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn test_ping_unit_variant() {
        let frame = parse_client_frame(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let json = r#"{"type":"ping","extra":"stuff"}"#;
        assert_eq!(parse_client_frame(json.as_bytes()).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn test_unknown_type_detected() {
        let err = parse_client_frame(br#"{"type":"teleport","to":"Bob"}"#).unwrap_err();
        assert!(matches!(err, FrameParseError::UnknownType(t) if t == "teleport"));
    }

    #[test]
    fn test_malformed_known_type() {
        // `send` without required fields is malformed, not unknown
        let err = parse_client_frame(br#"{"type":"send"}"#).unwrap_err();
        assert!(matches!(err, FrameParseError::Malformed(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = parse_client_frame(b"not json").unwrap_err();
        assert!(matches!(err, FrameParseError::Malformed(_)));
    }

    #[test]
    fn test_needs_attention_camel_case() {
        let json = r#"{"type":"status","needsAttention":true}"#;
        let frame = parse_client_frame(json.as_bytes()).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Status {
                needs_attention: Some(true)
            }
        );
    }

    #[test]
    fn test_ack_reason_wire_form() {
        let frame = ServerFrame::Ack {
            id: MessageId::from_string("m1"),
            status: AckStatus::Rejected,
            reason: Some(RejectReason::DuplicateId),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "duplicate_id");
    }

    #[test]
    fn test_ack_pending_omits_reason() {
        let frame = ServerFrame::Ack {
            id: MessageId::from_string("m1"),
            status: AckStatus::Pending,
            reason: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_welcome_camel_case_keys() {
        let frame = ServerFrame::Welcome {
            server_version: "0.1.0".to_string(),
            session_id: SessionId::new(),
            now: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("serverVersion").is_some());
        assert!(json.get("sessionId").is_some());
    }

    #[test]
    fn test_deliver_roundtrip() {
        let envelope = Envelope::new(
            AgentName::parse("Alice").unwrap(),
            Recipient::parse("Bob").unwrap(),
            "hi".to_string(),
        );
        let frame = ServerFrame::Deliver {
            envelope: envelope.clone(),
        };
        let bytes = serde_json::to_vec(&frame).unwrap();
        let back = parse_server_frame(&bytes).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_error_code_wire_form() {
        let frame = ServerFrame::Error {
            code: ErrorCode::UnknownKind,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["code"], "unknown_kind");
    }
}
