//! Shared utilities: identifiers, name validation, serde helpers.

mod ids;
pub mod serde_helpers;

pub use ids::{
    monotonic_epoch_ms, now_ms, AgentName, InvalidName, MessageId, SessionId, TopicName,
    MAX_NAME_LEN,
};
