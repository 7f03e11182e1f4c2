// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

// Layer 3: Internal module imports
use super::error::StorageError;
use crate::message::{Envelope, MessageStatus};
use crate::util::{AgentName, MessageId};

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Sort direction for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first
    Ascending,
    /// Newest first (default)
    #[default]
    Descending,
}

/// Filters for [`StorageAdapter::list_history`].
///
/// Every filter is conjunctive; unset filters match everything.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    /// Match the sender
    pub from: Option<AgentName>,
    /// Match the recipient address in its wire string form
    pub to: Option<String>,
    /// Match the thread identifier
    pub thread: Option<String>,
    /// Envelopes accepted at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Envelopes accepted at or before this instant
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of envelopes returned
    pub limit: usize,
    /// Sort direction over acceptance time
    pub order: SortOrder,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            thread: None,
            since: None,
            until: None,
            limit: DEFAULT_HISTORY_LIMIT,
            order: SortOrder::default(),
        }
    }
}

impl HistoryQuery {
    /// Whether an envelope satisfies every set filter.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(from) = &self.from {
            if &envelope.from != from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if &envelope.to.to_string() != to {
                return false;
            }
        }
        if let Some(thread) = &self.thread {
            if envelope.thread.as_deref() != Some(thread.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if envelope.ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if envelope.ts > until {
                return false;
            }
        }
        true
    }

    /// Filter, order by acceptance time, and page an unordered set.
    ///
    /// Client-supplied ids carry no time information, so ordering must come
    /// from `ts`; the id only breaks ties deterministically.
    pub fn apply(&self, envelopes: impl Iterator<Item = Envelope>) -> Vec<Envelope> {
        let mut matching: Vec<Envelope> = envelopes.filter(|e| self.matches(e)).collect();
        matching.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
        if self.order == SortOrder::Descending {
            matching.reverse();
        }
        matching.truncate(self.limit);
        matching
    }
}

/// Durable store of message envelopes.
///
/// The broker depends on this interface; concrete backends are selected in
/// the composition root at startup. Implementations serialize their own
/// writes internally and may be called from any task.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Persist an envelope.
    ///
    /// Resolves only once the envelope is recoverable after a crash; callers
    /// treat the return as the durability acknowledgement.
    async fn append(&self, envelope: Envelope) -> Result<(), StorageError>;

    /// Advance an envelope's status.
    ///
    /// Idempotent: a non-monotone transition leaves the stored status
    /// unchanged and returns `Ok(false)`. Status writes bypass batching and
    /// commit synchronously.
    async fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<bool, StorageError>;

    /// Record one more delivery attempt; returns the new count.
    async fn increment_attempts(&self, id: &MessageId) -> Result<u32, StorageError>;

    /// Fetch an envelope by id.
    async fn get_by_id(&self, id: &MessageId) -> Result<Option<Envelope>, StorageError>;

    /// Query persisted envelopes.
    async fn list_history(&self, query: HistoryQuery) -> Result<Vec<Envelope>, StorageError>;

    /// Number of persisted envelopes.
    async fn count(&self) -> Result<usize, StorageError>;

    /// Trim terminal envelopes older than `retention`, then enforce
    /// `max_entries` oldest-first. Pending envelopes are trimmed only as a
    /// last resort when the cap cannot otherwise be met. Returns the number
    /// of envelopes removed.
    async fn prune(&self, retention: Duration, max_entries: usize) -> Result<usize, StorageError>;

    /// Force any buffered writes to disk.
    async fn flush(&self) -> Result<(), StorageError>;

    /// Drain pending writes and release the backing store.
    async fn close(&self) -> Result<(), StorageError>;

    /// Whether the adapter is currently refusing new appends.
    fn is_degraded(&self) -> bool {
        false
    }

    /// Observe degraded-mode transitions. The default receiver never changes.
    fn watch_degraded(&self) -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Recipient;

    fn envelope(from: &str, to: &str) -> Envelope {
        Envelope::new(
            AgentName::parse(from).unwrap(),
            Recipient::parse(to).unwrap(),
            "body".to_string(),
        )
    }

    #[test]
    fn test_empty_query_matches_all() {
        let q = HistoryQuery::default();
        assert!(q.matches(&envelope("Alice", "Bob")));
        assert!(q.matches(&envelope("Bob", "*")));
    }

    #[test]
    fn test_from_filter() {
        let q = HistoryQuery {
            from: Some(AgentName::parse("Alice").unwrap()),
            ..Default::default()
        };
        assert!(q.matches(&envelope("Alice", "Bob")));
        assert!(!q.matches(&envelope("Carol", "Bob")));
    }

    #[test]
    fn test_to_filter_uses_wire_form() {
        let q = HistoryQuery {
            to: Some("topic:deploys".to_string()),
            ..Default::default()
        };
        assert!(q.matches(&envelope("Alice", "topic:deploys")));
        assert!(!q.matches(&envelope("Alice", "Bob")));
    }

    #[test]
    fn test_thread_filter() {
        let q = HistoryQuery {
            thread: Some("t-1".to_string()),
            ..Default::default()
        };
        let with_thread = envelope("Alice", "Bob").with_thread("t-1");
        assert!(q.matches(&with_thread));
        assert!(!q.matches(&envelope("Alice", "Bob")));
    }

    #[test]
    fn test_apply_orders_by_acceptance_time_not_id() {
        // Client-supplied ids sort lexicographically against acceptance
        // order; ts must win.
        let mut first = envelope("Alice", "Bob");
        first.id = MessageId::from_string("b");
        let mut second = envelope("Alice", "Bob");
        second.id = MessageId::from_string("a");
        second.ts = first.ts + chrono::Duration::milliseconds(5);

        let q = HistoryQuery {
            order: SortOrder::Ascending,
            ..Default::default()
        };
        let oldest_first = q.apply(vec![second.clone(), first.clone()].into_iter());
        assert_eq!(oldest_first[0].id.as_str(), "b");
        assert_eq!(oldest_first[1].id.as_str(), "a");

        let newest_first = HistoryQuery::default().apply(vec![first, second].into_iter());
        assert_eq!(newest_first[0].id.as_str(), "a");
    }

    #[test]
    fn test_apply_limit() {
        let envelopes: Vec<Envelope> = (0..5).map(|_| envelope("Alice", "Bob")).collect();
        let q = HistoryQuery {
            limit: 2,
            ..Default::default()
        };
        assert_eq!(q.apply(envelopes.into_iter()).len(), 2);
    }

    #[test]
    fn test_time_window() {
        let e = envelope("Alice", "Bob");
        let earlier = e.ts - chrono::Duration::seconds(10);
        let later = e.ts + chrono::Duration::seconds(10);

        let q = HistoryQuery {
            since: Some(earlier),
            until: Some(later),
            ..Default::default()
        };
        assert!(q.matches(&e));

        let q = HistoryQuery {
            since: Some(later),
            ..Default::default()
        };
        assert!(!q.matches(&e));

        let q = HistoryQuery {
            until: Some(earlier),
            ..Default::default()
        };
        assert!(!q.matches(&e));
    }
}
