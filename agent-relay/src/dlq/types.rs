// Layer 1: Standard library imports
use std::collections::BTreeMap;
use std::fmt::{self, Display};

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Layer 3: Internal module imports
use crate::message::Envelope;
use crate::util::{now_ms, AgentName};

/// Why a delivery was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    /// Retry budget exhausted without an acknowledgement
    MaxRetriesExceeded,
    /// The envelope outlived its TTL before delivery
    TtlExpired,
    /// The recipient session dropped and did not return within the grace
    /// window
    ConnectionLost,
    /// Fanout expansion produced no receivers
    TargetNotFound,
    /// Payload failed signature validation
    SignatureInvalid,
    /// Payload exceeded the configured bound
    PayloadTooLarge,
    /// Sender exceeded its rate budget
    RateLimited,
    /// Catch-all for failures outside the enumerated set
    Unknown,
}

impl DlqReason {
    /// Stable string form used on the wire and in stats keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::TtlExpired => "ttl_expired",
            Self::ConnectionLost => "connection_lost",
            Self::TargetNotFound => "target_not_found",
            Self::SignatureInvalid => "signature_invalid",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A quarantined delivery: the envelope plus failure bookkeeping.
///
/// Entries are per recipient — a broadcast that fails for two receivers
/// produces two independent entries referencing the same envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Unique entry id (distinct from the envelope id)
    pub id: String,

    /// The envelope that failed
    pub envelope: Envelope,

    /// The recipient this entry is about
    pub recipient: AgentName,

    /// Failure classification
    pub reason: DlqReason,

    /// Human-readable failure detail
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,

    /// When the entry was quarantined
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub dlq_ts: DateTime<Utc>,

    /// Number of replay attempts made from the queue
    #[serde(rename = "dlqRetryCount")]
    pub retry_count: u32,

    /// Whether an operator has acknowledged the entry
    pub acknowledged: bool,

    /// Who acknowledged it
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub acknowledged_by: Option<AgentName>,

    /// When it was acknowledged
    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub acknowledged_ts: Option<DateTime<Utc>>,
}

impl DeadLetter {
    /// Quarantine an envelope for one recipient.
    pub fn new(
        envelope: Envelope,
        recipient: AgentName,
        reason: DlqReason,
        error_message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            envelope,
            recipient,
            reason,
            error_message,
            dlq_ts: now_ms(),
            retry_count: 0,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_ts: None,
        }
    }
}

/// Sort key for DLQ queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqOrder {
    /// When the entry was quarantined (default)
    #[default]
    DlqTs,
    /// When the envelope was originally accepted
    OriginalTs,
    /// Number of delivery attempts on the envelope
    AttemptCount,
}

/// Filters and pagination for [`crate::dlq::DlqAdapter::query`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DlqQuery {
    /// Match the failed recipient
    pub to: Option<AgentName>,
    /// Match the original sender
    pub from: Option<AgentName>,
    /// Match the failure reason
    pub reason: Option<DlqReason>,
    /// Match the acknowledged flag
    pub acknowledged: Option<bool>,
    /// Entries quarantined at or after this instant
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub since: Option<DateTime<Utc>>,
    /// Entries quarantined at or before this instant
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub until: Option<DateTime<Utc>>,
    /// Sort key
    pub order_by: DlqOrder,
    /// Newest first when true
    pub descending: bool,
    /// Page size
    pub limit: usize,
    /// Page offset
    pub offset: usize,
}

impl Default for DlqQuery {
    fn default() -> Self {
        Self {
            to: None,
            from: None,
            reason: None,
            acknowledged: None,
            since: None,
            until: None,
            order_by: DlqOrder::default(),
            descending: true,
            limit: 50,
            offset: 0,
        }
    }
}

impl DlqQuery {
    /// Whether an entry satisfies every set filter.
    pub fn matches(&self, entry: &DeadLetter) -> bool {
        if let Some(to) = &self.to {
            if &entry.recipient != to {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if &entry.envelope.from != from {
                return false;
            }
        }
        if let Some(reason) = self.reason {
            if entry.reason != reason {
                return false;
            }
        }
        if let Some(acknowledged) = self.acknowledged {
            if entry.acknowledged != acknowledged {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.dlq_ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.dlq_ts > until {
                return false;
            }
        }
        true
    }

    /// Sort, paginate, and return matching entries from an unordered set.
    pub fn apply(&self, entries: impl Iterator<Item = DeadLetter>) -> Vec<DeadLetter> {
        let mut matching: Vec<DeadLetter> = entries.filter(|e| self.matches(e)).collect();
        matching.sort_by(|a, b| {
            let ordering = match self.order_by {
                DlqOrder::DlqTs => a.dlq_ts.cmp(&b.dlq_ts),
                DlqOrder::OriginalTs => a.envelope.ts.cmp(&b.envelope.ts),
                DlqOrder::AttemptCount => a.envelope.attempts.cmp(&b.envelope.attempts),
            };
            // Entry id breaks ties deterministically.
            ordering.then_with(|| a.id.cmp(&b.id))
        });
        if self.descending {
            matching.reverse();
        }
        matching.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

/// Aggregate queue statistics, derived live from the entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqStats {
    /// Total entries in the queue
    pub total: usize,
    /// Entries not yet acknowledged
    pub unacknowledged: usize,
    /// Entry count per failure reason
    pub by_reason: BTreeMap<String, usize>,
    /// Oldest quarantine time
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub oldest_ts: Option<DateTime<Utc>>,
    /// Newest quarantine time
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub newest_ts: Option<DateTime<Utc>>,
}

impl DlqStats {
    /// Derive statistics from the current entry set.
    pub fn derive<'a>(entries: impl Iterator<Item = &'a DeadLetter>) -> Self {
        let mut stats = Self {
            total: 0,
            unacknowledged: 0,
            by_reason: BTreeMap::new(),
            oldest_ts: None,
            newest_ts: None,
        };
        for entry in entries {
            stats.total += 1;
            if !entry.acknowledged {
                stats.unacknowledged += 1;
            }
            *stats
                .by_reason
                .entry(entry.reason.as_str().to_string())
                .or_insert(0) += 1;
            stats.oldest_ts = match stats.oldest_ts {
                Some(ts) => Some(ts.min(entry.dlq_ts)),
                None => Some(entry.dlq_ts),
            };
            stats.newest_ts = match stats.newest_ts {
                Some(ts) => Some(ts.max(entry.dlq_ts)),
                None => Some(entry.dlq_ts),
            };
        }
        stats
    }
}
