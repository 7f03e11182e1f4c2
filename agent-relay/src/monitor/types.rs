//! Memory monitor data types and configuration.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::util::serde_helpers::duration_millis;
use crate::util::AgentName;

/// One sampled observation of a monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    /// When the sample was taken
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    /// Resident set size in bytes
    pub resident_bytes: u64,
    /// Best-effort heap-in-use figure (data segment on Linux)
    pub heap_used: u64,
    /// Best-effort heap ceiling figure (virtual size on Linux)
    pub heap_total: u64,
    /// Best-effort off-heap figure; zero when unavailable
    pub external_bytes: u64,
    /// CPU usage over the previous sampling interval, percent of one core
    pub cpu_percent: f64,
}

/// Direction of recent memory movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Gaining more than the growth threshold
    Growing,
    /// Within the stable band
    Stable,
    /// Losing more than the shrink threshold
    Shrinking,
    /// Not enough samples yet
    #[default]
    Unknown,
}

/// Severity ladder for memory alerts. Ordered so escalation compares.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Below every threshold
    #[default]
    Normal,
    /// Crossed the warning threshold
    Warning,
    /// Crossed the critical threshold
    Critical,
    /// Crossed the out-of-memory threshold
    OomImminent,
}

/// What a memory alert announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Upward crossing into warning
    Warning,
    /// Upward crossing into critical
    Critical,
    /// Upward crossing into oom-imminent
    OomImminent,
    /// Return to normal from any alerting level
    Recovered,
    /// Sustained growth above the configured rate
    TrendWarning,
}

/// An emitted memory alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAlert {
    /// The monitored agent
    pub agent: AgentName,
    /// What happened
    pub kind: AlertKind,
    /// Level after the transition
    pub level: AlertLevel,
    /// Resident bytes at the triggering sample
    pub resident_bytes: u64,
    /// Recent growth rate in bytes per minute
    pub rate_per_minute: f64,
    /// When the alert fired
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
}

/// Operator-facing explanation of a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashCause {
    /// Last observation was at or past the oom-imminent threshold
    Oom,
    /// Memory was growing faster than the warning rate
    MemoryLeak,
    /// The final step jumped by more than the spike threshold
    SuddenSpike,
    /// Nothing in the history explains it
    Unknown,
}

/// Reconstructed context for a vanished or crashed process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashContext {
    pub agent: AgentName,
    pub pid: u32,
    pub last_snapshot: Option<MemorySnapshot>,
    pub high_watermark: u64,
    pub low_watermark: u64,
    pub average_rss: u64,
    pub trend: Trend,
    pub rate_per_minute: f64,
    pub likely_cause: CrashCause,
    /// Recent-history window for operator review
    pub recent: Vec<MemorySnapshot>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub captured_at: DateTime<Utc>,
}

/// Monitor thresholds and retention.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Sampling period
    #[serde(with = "duration_millis")]
    pub sample_interval: Duration,
    /// Ring retention by count
    pub max_samples: usize,
    /// Ring retention by age
    #[serde(with = "duration_millis")]
    pub max_sample_age: Duration,
    /// Warning threshold in resident bytes
    pub warning_bytes: u64,
    /// Critical threshold in resident bytes
    pub critical_bytes: u64,
    /// Out-of-memory threshold in resident bytes
    pub oom_imminent_bytes: u64,
    /// Growth rate (bytes/minute) that fires a trend warning
    pub trend_growth_rate_warning: f64,
    /// Minimum spacing between non-escalating alerts per agent
    #[serde(with = "duration_millis")]
    pub alert_cooldown: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            max_samples: 360,
            max_sample_age: Duration::from_secs(3600),
            warning_bytes: 512 * 1024 * 1024,
            critical_bytes: 1024 * 1024 * 1024,
            oom_imminent_bytes: 1536 * 1024 * 1024,
            trend_growth_rate_warning: 10.0 * 1024.0 * 1024.0,
            alert_cooldown: Duration::from_secs(60),
        }
    }
}

/// Number of samples the trend window looks at.
pub const TREND_WINDOW: usize = 6;

/// Growth/shrink band for trend classification, bytes per minute.
pub const TREND_BAND_BYTES_PER_MINUTE: f64 = 1024.0 * 1024.0;

/// Jump size classified as a sudden spike, bytes.
pub const SPIKE_DELTA_BYTES: u64 = 100 * 1024 * 1024;

/// Per-process monitoring state.
#[derive(Debug, Clone)]
pub struct MemoryMetrics {
    /// Monitored process id
    pub pid: u32,
    /// When monitoring began
    pub started_at: DateTime<Utc>,
    /// Process start time in clock ticks, used to detect pid reuse
    pub start_ticks: Option<u64>,
    /// Bounded sample history, oldest first
    pub snapshots: VecDeque<MemorySnapshot>,
    /// Highest resident size ever observed (monotone)
    pub high_watermark: u64,
    /// Lowest resident size ever observed
    pub low_watermark: u64,
    /// Current trend over the recent window
    pub trend: Trend,
    /// Growth rate over the recent window, bytes per minute
    pub rate_per_minute: f64,
    /// Current alert level
    pub alert_level: AlertLevel,
    /// When the last alert fired
    pub last_alert: Option<DateTime<Utc>>,
    /// Level announced by the last alert
    pub last_alert_level: Option<AlertLevel>,
    /// CPU accounting from the previous probe: (ticks, at)
    pub cpu_basis: Option<(u64, DateTime<Utc>)>,
}

impl MemoryMetrics {
    /// Fresh state for a newly registered process.
    pub fn new(pid: u32, start_ticks: Option<u64>) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            start_ticks,
            snapshots: VecDeque::new(),
            high_watermark: 0,
            low_watermark: u64::MAX,
            trend: Trend::Unknown,
            rate_per_minute: 0.0,
            alert_level: AlertLevel::Normal,
            last_alert: None,
            last_alert_level: None,
            cpu_basis: None,
        }
    }

    /// Latest sample, if any.
    pub fn last_snapshot(&self) -> Option<&MemorySnapshot> {
        self.snapshots.back()
    }

    /// Mean resident size over retained samples.
    pub fn average_rss(&self) -> u64 {
        if self.snapshots.is_empty() {
            return 0;
        }
        let sum: u128 = self
            .snapshots
            .iter()
            .map(|s| s.resident_bytes as u128)
            .sum();
        (sum / self.snapshots.len() as u128) as u64
    }

    /// Low watermark, or zero before any sample.
    pub fn low_watermark_or_zero(&self) -> u64 {
        if self.low_watermark == u64::MAX {
            0
        } else {
            self.low_watermark
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Warning > AlertLevel::Normal);
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert!(AlertLevel::OomImminent > AlertLevel::Critical);
    }

    #[test]
    fn test_average_rss() {
        let mut metrics = MemoryMetrics::new(1, None);
        for rss in [100u64, 200, 300] {
            metrics.snapshots.push_back(MemorySnapshot {
                ts: Utc::now(),
                resident_bytes: rss,
                heap_used: 0,
                heap_total: 0,
                external_bytes: 0,
                cpu_percent: 0.0,
            });
        }
        assert_eq!(metrics.average_rss(), 200);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = MemoryMetrics::new(1, None);
        assert_eq!(metrics.average_rss(), 0);
        assert_eq!(metrics.low_watermark_or_zero(), 0);
        assert_eq!(metrics.trend, Trend::Unknown);
        assert!(metrics.last_snapshot().is_none());
    }

    #[test]
    fn test_config_thresholds_ordered() {
        let config = MonitorConfig::default();
        assert!(config.warning_bytes < config.critical_bytes);
        assert!(config.critical_bytes < config.oom_imminent_bytes);
    }
}
