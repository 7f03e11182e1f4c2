// Layer 1: Standard library imports
use std::fmt::{self, Display};
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// Layer 3: Internal module imports
use crate::util::{now_ms, AgentName, InvalidName, MessageId, TopicName};

/// Recipient address of an envelope.
///
/// The wire form is a single string: an agent name, the literal `*` for
/// broadcast, or `topic:<name>` for pub/sub fanout.
///
/// # Example
/// ```rust
/// use agent_relay::message::Recipient;
///
/// assert!(matches!("*".parse::<Recipient>().unwrap(), Recipient::Broadcast));
/// assert!(matches!(
///     "topic:deploys".parse::<Recipient>().unwrap(),
///     Recipient::Topic(_)
/// ));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    /// A single named agent
    Agent(AgentName),
    /// Every non-observer agent online at send time, excluding the sender
    Broadcast,
    /// All current subscribers of a topic
    Topic(TopicName),
}

/// Validation failure for a recipient string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRecipient {
    /// The agent-name portion failed validation
    #[error("invalid agent name: {0}")]
    Agent(InvalidName),
    /// The topic-name portion failed validation
    #[error("invalid topic name: {0}")]
    Topic(InvalidName),
}

impl Recipient {
    /// Parse the wire string form.
    pub fn parse(raw: &str) -> Result<Self, InvalidRecipient> {
        if raw == "*" {
            return Ok(Self::Broadcast);
        }
        if let Some(topic) = raw.strip_prefix("topic:") {
            return TopicName::parse(topic)
                .map(Self::Topic)
                .map_err(InvalidRecipient::Topic);
        }
        AgentName::parse(raw)
            .map(Self::Agent)
            .map_err(InvalidRecipient::Agent)
    }

    /// The topic, when this recipient is a topic address.
    pub fn topic(&self) -> Option<&TopicName> {
        match self {
            Self::Topic(t) => Some(t),
            _ => None,
        }
    }
}

impl std::str::FromStr for Recipient {
    type Err = InvalidRecipient;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Recipient {
    type Error = InvalidRecipient;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        value.to_string()
    }
}

impl Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(name) => write!(f, "{name}"),
            Self::Broadcast => write!(f, "*"),
            Self::Topic(topic) => write!(f, "topic:{topic}"),
        }
    }
}

/// Semantic type of a message.
///
/// The broker routes every kind identically; the closed set exists for
/// consumers. Kinds outside the set are carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Ordinary directed message
    #[default]
    Message,
    /// Threaded reply
    Reply,
    /// Broker-generated notification
    System,
    /// Administrative traffic
    Admin,
    /// Presence change notification
    Presence,
    /// Consumer-defined kind, routed identically
    Other(String),
}

impl MessageKind {
    /// String form used on the wire and in storage.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Reply => "reply",
            Self::System => "system",
            Self::Admin => "admin",
            Self::Presence => "presence",
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "message" => Self::Message,
            "reply" => Self::Reply,
            "system" => Self::System,
            "admin" => Self::Admin,
            "presence" => Self::Presence,
            _ => Self::Other(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(value: MessageKind) -> Self {
        value.as_str().to_string()
    }
}

/// Delivery status of a persisted envelope.
///
/// `Pending` is the only non-terminal state; transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Accepted and persisted, delivery in progress
    #[default]
    Pending,
    /// Delivered to its recipient set
    Delivered,
    /// Quarantined to the dead-letter queue
    DeadLettered,
    /// Expired before delivery
    Expired,
}

impl MessageStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether a transition to `next` is allowed.
    ///
    /// Only `Pending` may advance, and only to a different status.
    pub fn can_transition_to(self, next: Self) -> bool {
        self == Self::Pending && next != Self::Pending
    }
}

impl Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::DeadLettered => "dead_lettered",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// The durable unit of exchange between agents.
///
/// Envelopes are assigned their `id` (unless the client supplied one) and
/// `ts` by the broker at accept time; client timestamps are never trusted.
/// The delivery engine mutates only `status` and `attempts`.
///
/// # Example
/// ```rust
/// use agent_relay::message::{Envelope, MessageStatus, Recipient};
/// use agent_relay::util::AgentName;
///
/// let from = AgentName::parse("Alice").unwrap();
/// let to = Recipient::parse("Bob").unwrap();
/// let envelope = Envelope::new(from, to, "hi".to_string());
///
/// assert_eq!(envelope.status, MessageStatus::Pending);
/// assert_eq!(envelope.attempts, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Globally unique, creation-ordered identifier
    pub id: MessageId,

    /// Sender agent name
    pub from: AgentName,

    /// Recipient address (agent, `*`, or `topic:<name>`)
    pub to: Recipient,

    /// Topic name, present iff `to` is a topic address
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub topic: Option<TopicName>,

    /// Semantic type; routing ignores it
    #[serde(default)]
    pub kind: MessageKind,

    /// UTF-8 payload
    pub body: String,

    /// Optional structured key/value map
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Map<String, Value>>,

    /// Opaque thread identifier grouping related messages
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thread: Option<String>,

    /// Broker-assigned creation time (milliseconds on the wire)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,

    /// Delivery status
    #[serde(default)]
    pub status: MessageStatus,

    /// Delivery attempts made
    #[serde(default)]
    pub attempts: u32,
}

impl Envelope {
    /// Create a new pending envelope stamped with the broker clock.
    pub fn new(from: AgentName, to: Recipient, body: String) -> Self {
        let topic = to.topic().cloned();
        let ts = now_ms();
        Self {
            id: MessageId::generate(),
            from,
            to,
            topic,
            kind: MessageKind::Message,
            body,
            data: None,
            thread: None,
            ts,
            status: MessageStatus::Pending,
            attempts: 0,
        }
    }

    /// Builder method: use a client-supplied id.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Builder method: set the semantic kind.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builder method: attach a structured data map.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    /// Builder method: attach a thread identifier.
    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    /// Age of the envelope relative to the broker clock.
    pub fn age(&self) -> Duration {
        let millis = (Utc::now() - self.ts).num_milliseconds().max(0) as u64;
        Duration::from_millis(millis)
    }

    /// Whether the envelope has outlived `ttl`. `None` means no limit.
    pub fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.age() > ttl,
            None => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn envelope_to(to: &str) -> Envelope {
        Envelope::new(
            AgentName::parse("Alice").unwrap(),
            Recipient::parse(to).unwrap(),
            "hello".to_string(),
        )
    }

    #[test]
    fn test_recipient_parse_agent() {
        let r = Recipient::parse("Bob").unwrap();
        assert!(matches!(r, Recipient::Agent(ref a) if a.as_str() == "Bob"));
    }

    #[test]
    fn test_recipient_parse_broadcast() {
        assert_eq!(Recipient::parse("*").unwrap(), Recipient::Broadcast);
    }

    #[test]
    fn test_recipient_parse_topic() {
        let r = Recipient::parse("topic:deploys").unwrap();
        assert_eq!(r.topic().unwrap().as_str(), "deploys");
    }

    #[test]
    fn test_recipient_rejects_bad_topic() {
        assert!(matches!(
            Recipient::parse("topic:a b"),
            Err(InvalidRecipient::Topic(_))
        ));
    }

    #[test]
    fn test_recipient_wire_roundtrip() {
        for raw in ["Bob", "*", "topic:deploys"] {
            let r = Recipient::parse(raw).unwrap();
            assert_eq!(r.to_string(), raw);
            let json = serde_json::to_string(&r).unwrap();
            let back: Recipient = serde_json::from_str(&json).unwrap();
            assert_eq!(back, r);
        }
    }

    #[test]
    fn test_kind_closed_set() {
        assert_eq!(MessageKind::from("reply".to_string()), MessageKind::Reply);
        assert_eq!(
            MessageKind::from("heartbeat".to_string()),
            MessageKind::Other("heartbeat".to_string())
        );
    }

    #[test]
    fn test_status_transitions_forward_only() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Delivered));
        assert!(Pending.can_transition_to(DeadLettered));
        assert!(Pending.can_transition_to(Expired));
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(DeadLettered));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_envelope_topic_derived() {
        let direct = envelope_to("Bob");
        assert!(direct.topic.is_none());

        let topical = envelope_to("topic:deploys");
        assert_eq!(topical.topic.as_ref().unwrap().as_str(), "deploys");
    }

    #[test]
    fn test_envelope_defaults() {
        let e = envelope_to("Bob");
        assert_eq!(e.status, MessageStatus::Pending);
        assert_eq!(e.attempts, 0);
        assert_eq!(e.kind, MessageKind::Message);
        assert!(e.thread.is_none());
    }

    #[test]
    fn test_envelope_ts_monotone() {
        let a = envelope_to("Bob");
        let b = envelope_to("Bob");
        assert!(b.ts >= a.ts);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let e = envelope_to("Bob").with_thread("t-1");
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("ts").unwrap().is_i64());
        assert_eq!(json.get("status").unwrap(), "pending");
        assert_eq!(json.get("thread").unwrap(), "t-1");
        // absent optionals are omitted, not null
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_envelope_json_roundtrip() {
        let mut data = Map::new();
        data.insert("pr".to_string(), Value::from(42));
        let e = envelope_to("topic:reviews")
            .with_kind(MessageKind::Reply)
            .with_data(data)
            .with_thread("thread-9");

        let json = serde_json::to_string(&e).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut e = envelope_to("Bob");
        assert!(!e.is_expired(None));
        assert!(!e.is_expired(Some(Duration::from_secs(60))));

        e.ts = Utc::now() - chrono::Duration::seconds(120);
        assert!(e.is_expired(Some(Duration::from_secs(60))));
        assert!(!e.is_expired(None));
    }
}
