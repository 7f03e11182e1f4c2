//! Delivery engine: routing decisions, per-recipient FIFO workers, retry
//! scheduling, TTL enforcement, offline parking, and dead-letter hand-off.

mod backoff;
mod engine;
mod offline;
mod ratelimit;

pub use backoff::RetryBackoff;
pub use engine::{DeliveryConfig, DeliveryEngine, SendRequest};
pub use offline::OfflineQueues;
pub use ratelimit::RateLimiter;
