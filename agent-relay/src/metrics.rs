//! Broker-wide counters, kept as atomics and surfaced via the admin status
//! operation.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, Ordering};

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::Serialize;

// Layer 3: Internal module imports
use crate::util::now_ms;

/// Lifetime counters for one broker instance.
#[derive(Debug)]
pub struct BrokerMetrics {
    started_at: DateTime<Utc>,
    accepted: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
}

impl BrokerMetrics {
    /// Counters start at zero at broker start.
    pub fn new() -> Self {
        Self {
            started_at: now_ms(),
            accepted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// An envelope passed validation and was persisted.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A recipient acknowledged a delivery.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// A per-recipient delivery was quarantined.
    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery expired before reaching its recipient.
    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// A send was rejected synchronously.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot for the admin surface.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_ms: (Utc::now() - self.started_at).num_milliseconds().max(0),
            accepted: self.accepted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable counter snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_ms: i64,
    pub accepted: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub expired: u64,
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = BrokerMetrics::new();
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_delivered();
        metrics.record_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(snapshot.rejected, 1);
        assert!(snapshot.uptime_ms >= 0);
    }
}
