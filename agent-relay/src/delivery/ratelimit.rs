//! Per-sender token bucket rate limiting.

// Layer 1: Standard library imports
use std::time::Instant;

// Layer 2: Third-party crate imports
use dashmap::DashMap;

// Layer 3: Internal module imports
use crate::util::AgentName;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token buckets keyed by sender.
///
/// Each send costs one token; buckets refill continuously at
/// `refill_per_sec` up to `burst`. A refill rate of zero disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    refill_per_sec: f64,
    burst: f64,
    buckets: DashMap<AgentName, Bucket>,
}

impl RateLimiter {
    /// Build a limiter; `refill_per_sec == 0` means unlimited.
    pub fn new(refill_per_sec: f64, burst: f64) -> Self {
        Self {
            refill_per_sec,
            burst: burst.max(1.0),
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `sender`; false means the send is rejected with
    /// `rate_limited`.
    pub fn try_acquire(&self, sender: &AgentName) -> bool {
        if self.refill_per_sec <= 0.0 {
            return true;
        }

        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(sender.clone())
            .or_insert_with(|| Bucket {
                tokens: self.burst,
                refilled_at: now,
            });

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop a sender's bucket (disconnect cleanup).
    pub fn forget(&self, sender: &AgentName) {
        self.buckets.remove(sender);
    }
}
