// Layer 1: Standard library imports
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// Layer 2: Third-party crate imports
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// Layer 3: Internal module imports
// (none)

/// Last issued millisecond timestamp, shared by all id/timestamp producers.
///
/// Guarantees that timestamps handed out by one broker instance never move
/// backwards even if the wall clock steps.
static LAST_EPOCH_MS: AtomicI64 = AtomicI64::new(0);

/// Per-process id sequence, so ids generated within the same millisecond
/// still sort in creation order.
static NEXT_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Current time as milliseconds since the Unix epoch, monotone non-decreasing
/// within this process.
pub fn monotonic_epoch_ms() -> i64 {
    let now = Utc::now().timestamp_millis();
    let prev = LAST_EPOCH_MS.fetch_max(now, Ordering::SeqCst);
    prev.max(now)
}

/// The broker clock as a millisecond-precision `DateTime<Utc>`.
///
/// Millisecond precision keeps timestamps stable across the wire format,
/// which carries epoch milliseconds.
pub fn now_ms() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(monotonic_epoch_ms())
        .single()
        .unwrap_or_else(Utc::now)
}

/// Unique identifier for message envelopes.
///
/// Generated ids are a zero-padded millisecond epoch prefix, a per-process
/// sequence, and a random hex tail, so lexicographic order matches creation
/// order even within one millisecond. Client-supplied ids are opaque
/// strings and are stored verbatim.
///
/// # Example
/// ```rust
/// use agent_relay::util::MessageId;
///
/// let a = MessageId::generate();
/// let b = MessageId::generate();
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new sortable MessageId from the broker clock.
    pub fn generate() -> Self {
        let ms = monotonic_epoch_ms();
        let seq = NEXT_ID_SEQ.fetch_add(1, Ordering::SeqCst) & 0xff_ffff;
        let uuid = Uuid::new_v4();
        let hex = uuid.simple().to_string();
        Self(format!("{ms:013}-{seq:06x}{}", &hex[..6]))
    }

    /// Wrap an existing (client-supplied) id.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond epoch prefix of a generated id, or `None` for
    /// client-supplied ids without one.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.0.split('-').next().and_then(|p| p.parse().ok())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for connection sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum length of an agent or topic name in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Validation failures for agent and topic names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidName {
    /// Name is the empty string
    #[error("name must not be empty")]
    Empty,

    /// Name exceeds MAX_NAME_LEN bytes
    #[error("name length {len} exceeds maximum {MAX_NAME_LEN}")]
    TooLong { len: usize },

    /// Name contains a character outside `[A-Za-z0-9._-]`
    #[error("name contains invalid character {ch:?}")]
    InvalidChar { ch: char },
}

fn validate_name(name: &str) -> Result<(), InvalidName> {
    if name.is_empty() {
        return Err(InvalidName::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(InvalidName::TooLong { len: name.len() });
    }
    for ch in name.chars() {
        if !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-') {
            return Err(InvalidName::InvalidChar { ch });
        }
    }
    Ok(())
}

/// Validated agent name.
///
/// Names are restricted to `[A-Za-z0-9._-]`, which rules out `*`, path
/// separators, and the `topic:` prefix by construction. Names beginning with
/// `__` identify observer sessions: they receive topic traffic they subscribe
/// to but are excluded from `*` fanout.
///
/// # Example
/// ```rust
/// use agent_relay::util::AgentName;
///
/// let alice = AgentName::parse("Alice").unwrap();
/// assert!(!alice.is_observer());
/// assert!(AgentName::parse("no/slashes").is_err());
/// assert!(AgentName::parse("*").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentName(String);

impl AgentName {
    /// Parse and validate an agent name.
    pub fn parse(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is an observer session name (`__` prefix).
    pub fn is_observer(&self) -> bool {
        self.0.starts_with("__")
    }
}

impl TryFrom<String> for AgentName {
    type Error = InvalidName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AgentName> for String {
    fn from(value: AgentName) -> Self {
        value.0
    }
}

impl Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated topic name; shares the agent-name character restrictions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicName(String);

impl TopicName {
    /// Parse and validate a topic name.
    pub fn parse(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TopicName {
    type Error = InvalidName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TopicName> for String {
    fn from(value: TopicName) -> Self {
        value.0
    }
}

impl Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
