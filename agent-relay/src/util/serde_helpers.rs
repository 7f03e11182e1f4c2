//! Serialization helpers for common types.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serde module for Duration as milliseconds.
///
/// Configuration and wire timestamps are expressed in milliseconds, so the
/// millisecond form keeps files and frames consistent.
pub mod duration_millis {
    use super::*;

    /// Serializes Duration as milliseconds (u64).
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    /// Deserializes Duration from milliseconds (u64).
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde module for `Option<Duration>` as optional milliseconds.
///
/// `None` serializes as JSON null and means "no limit".
pub mod opt_duration_millis {
    use super::*;

    /// Serializes `Option<Duration>` as milliseconds or null.
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    /// Deserializes `Option<Duration>` from milliseconds or null.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
