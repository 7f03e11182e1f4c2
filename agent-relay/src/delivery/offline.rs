//! Per-agent parking queues for envelopes awaiting reconnection.
//!
//! Partitioned by agent: each queue has its own lock, so parking for one
//! recipient never contends with another.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use dashmap::DashMap;
use parking_lot::Mutex;

// Layer 3: Internal module imports
use crate::message::Envelope;
use crate::util::AgentName;

/// Offline queues keyed by recipient, FIFO within each queue.
#[derive(Debug, Default)]
pub struct OfflineQueues {
    queues: DashMap<AgentName, Arc<Mutex<VecDeque<Envelope>>>>,
}

impl OfflineQueues {
    /// Create an empty queue set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an envelope at the tail of the recipient's queue.
    pub fn park(&self, recipient: &AgentName, envelope: Envelope) {
        let queue = self
            .queues
            .entry(recipient.clone())
            .or_default()
            .clone();
        queue.lock().push_back(envelope);
    }

    /// Take the recipient's parked envelopes in park order.
    pub fn drain(&self, recipient: &AgentName) -> Vec<Envelope> {
        match self.queues.get(recipient) {
            Some(queue) => queue.lock().drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Whether the recipient has parked envelopes.
    pub fn has_parked(&self, recipient: &AgentName) -> bool {
        self.queues
            .get(recipient)
            .is_some_and(|q| !q.lock().is_empty())
    }

    /// Number of envelopes parked for a recipient.
    pub fn parked_count(&self, recipient: &AgentName) -> usize {
        self.queues.get(recipient).map_or(0, |q| q.lock().len())
    }

    /// Total parked envelopes across all recipients.
    pub fn total_parked(&self) -> usize {
        self.queues.iter().map(|q| q.lock().len()).sum()
    }

    /// Remove and return envelopes that outlived `ttl`, with the recipient
    /// they were parked for. `None` disables expiry.
    pub fn take_expired(&self, ttl: Option<Duration>) -> Vec<(AgentName, Envelope)> {
        let Some(ttl) = ttl else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        for entry in self.queues.iter() {
            let recipient = entry.key().clone();
            let mut queue = entry.lock();
            let mut survivors = VecDeque::with_capacity(queue.len());
            for envelope in queue.drain(..) {
                if envelope.is_expired(Some(ttl)) {
                    expired.push((recipient.clone(), envelope));
                } else {
                    survivors.push_back(envelope);
                }
            }
            *queue = survivors;
        }
        expired
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Recipient;

    fn agent(name: &str) -> AgentName {
        AgentName::parse(name).unwrap()
    }

    fn envelope(body: &str) -> Envelope {
        Envelope::new(
            agent("Alice"),
            Recipient::parse("Bob").unwrap(),
            body.to_string(),
        )
    }

    #[test]
    fn test_park_then_drain_in_order() {
        let queues = OfflineQueues::new();
        let bob = agent("Bob");
        queues.park(&bob, envelope("first"));
        queues.park(&bob, envelope("second"));

        let drained = queues.drain(&bob);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body, "first");
        assert_eq!(drained[1].body, "second");
        assert!(!queues.has_parked(&bob));
    }

    #[test]
    fn test_queues_are_partitioned() {
        let queues = OfflineQueues::new();
        queues.park(&agent("Bob"), envelope("for-bob"));
        queues.park(&agent("Carol"), envelope("for-carol"));

        assert_eq!(queues.parked_count(&agent("Bob")), 1);
        assert_eq!(queues.parked_count(&agent("Carol")), 1);
        assert_eq!(queues.total_parked(), 2);

        let drained = queues.drain(&agent("Bob"));
        assert_eq!(drained[0].body, "for-bob");
        assert_eq!(queues.total_parked(), 1);
    }

    #[test]
    fn test_drain_empty() {
        let queues = OfflineQueues::new();
        assert!(queues.drain(&agent("Ghost")).is_empty());
    }

    #[test]
    fn test_take_expired() {
        let queues = OfflineQueues::new();
        let bob = agent("Bob");

        let mut old = envelope("old");
        old.ts = chrono::Utc::now() - chrono::Duration::seconds(120);
        queues.park(&bob, old);
        queues.park(&bob, envelope("fresh"));

        let expired = queues.take_expired(Some(Duration::from_secs(60)));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1.body, "old");
        assert_eq!(queues.parked_count(&bob), 1);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let queues = OfflineQueues::new();
        let mut old = envelope("old");
        old.ts = chrono::Utc::now() - chrono::Duration::days(30);
        queues.park(&agent("Bob"), old);

        assert!(queues.take_expired(None).is_empty());
        assert_eq!(queues.total_parked(), 1);
    }
}
