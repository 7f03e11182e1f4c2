//! Memory monitor: periodic sampling of peer agent processes, trend
//! analysis, an alert state machine with cooldown, and crash-context
//! reconstruction.
//!
//! The monitor runs independently of message routing and surfaces alerts
//! through the hook emitter and a broadcast channel the server forwards to
//! sessions. Sampling failures are silently absorbed; a process that
//! disappears (or whose pid was reused by a different program) is
//! unregistered with its final metrics preserved for crash context.

mod sampler;
mod types;

pub use sampler::{clock_ticks_per_sec, probe, ProcessProbe};
pub use types::{
    AlertKind, AlertLevel, CrashCause, CrashContext, MemoryAlert, MemoryMetrics, MemorySnapshot,
    MonitorConfig, Trend, SPIKE_DELTA_BYTES, TREND_BAND_BYTES_PER_MINUTE, TREND_WINDOW,
};

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Layer 3: Internal module imports
use crate::hooks::{HookEmitter, HookEvent};
use crate::util::{now_ms, AgentName};

/// Capacity of the alert broadcast channel.
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Recent-history window handed to crash context consumers.
const CRASH_RECENT_SAMPLES: usize = 20;

struct MonitorInner {
    config: MonitorConfig,
    hooks: Arc<HookEmitter>,
    active: RwLock<HashMap<AgentName, MemoryMetrics>>,
    departed: RwLock<HashMap<AgentName, MemoryMetrics>>,
    alerts: broadcast::Sender<MemoryAlert>,
}

/// Shared handle to the memory monitor.
#[derive(Clone)]
pub struct MemoryMonitor {
    inner: Arc<MonitorInner>,
}

/// One row of the admin memory summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummaryEntry {
    pub agent: AgentName,
    pub pid: u32,
    pub resident_bytes: u64,
    pub high_watermark: u64,
    pub average_rss: u64,
    pub trend: Trend,
    pub rate_per_minute: f64,
    pub alert_level: AlertLevel,
    pub samples: usize,
}

impl MemoryMonitor {
    /// Build a monitor; constructed once in the broker's composition root.
    pub fn new(config: MonitorConfig, hooks: Arc<HookEmitter>) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                hooks,
                active: RwLock::new(HashMap::new()),
                departed: RwLock::new(HashMap::new()),
                alerts,
            }),
        }
    }

    /// Subscribe to emitted alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryAlert> {
        self.inner.alerts.subscribe()
    }

    /// Start monitoring a process under an agent's name.
    ///
    /// The process start time is captured so a later pid reuse by an
    /// unrelated program reads as process-gone, not as its memory.
    pub fn register(&self, agent: AgentName, pid: u32) {
        let start_ticks = sampler::probe(pid).map(|p| p.start_ticks);
        debug!(agent = %agent, pid, "memory monitor registered");
        self.inner
            .active
            .write()
            .insert(agent, MemoryMetrics::new(pid, start_ticks));
    }

    /// Stop monitoring; final metrics move to the crash-context shelf.
    pub fn unregister(&self, agent: &AgentName) {
        let removed = self.inner.active.write().remove(agent);
        if let Some(metrics) = removed {
            debug!(agent = %agent, pid = metrics.pid, "memory monitor unregistered");
            self.inner.departed.write().insert(agent.clone(), metrics);
        }
    }

    /// Whether an agent is being monitored.
    pub fn is_registered(&self, agent: &AgentName) -> bool {
        self.inner.active.read().contains_key(agent)
    }

    /// Sample every registered process once.
    ///
    /// Probe failures and pid-reuse detections unregister the agent with
    /// its metrics preserved; nothing is surfaced to callers.
    pub fn sample_all(&self) {
        let agents: Vec<AgentName> = self.inner.active.read().keys().cloned().collect();
        for agent in agents {
            self.sample_one(&agent);
        }
    }

    fn sample_one(&self, agent: &AgentName) {
        let (pid, start_ticks, cpu_basis) = {
            let active = self.inner.active.read();
            match active.get(agent) {
                Some(m) => (m.pid, m.start_ticks, m.cpu_basis),
                None => return,
            }
        };

        let now = now_ms();
        let Some(probe) = sampler::probe(pid) else {
            info!(agent = %agent, pid, "monitored process gone");
            self.unregister(agent);
            return;
        };
        if let Some(expected) = start_ticks {
            if probe.start_ticks != expected {
                // Same pid, different program: treat as process-gone.
                info!(agent = %agent, pid, "monitored pid reused, unregistering");
                self.unregister(agent);
                return;
            }
        }

        let cpu_percent = match cpu_basis {
            Some((prev_ticks, prev_at)) => {
                let wall = (now - prev_at).num_milliseconds().max(1) as f64 / 1000.0;
                let ticks = probe.cpu_ticks.saturating_sub(prev_ticks) as f64;
                (ticks / sampler::clock_ticks_per_sec() as f64) / wall * 100.0
            }
            None => 0.0,
        };

        let snapshot = MemorySnapshot {
            ts: now,
            resident_bytes: probe.resident_bytes,
            heap_used: probe.data_bytes,
            heap_total: probe.virtual_bytes,
            external_bytes: 0,
            cpu_percent,
        };

        {
            let mut active = self.inner.active.write();
            if let Some(metrics) = active.get_mut(agent) {
                metrics.cpu_basis = Some((probe.cpu_ticks, now));
            }
        }
        self.record_sample(agent, snapshot);
    }

    /// Ingest one sample for an agent.
    ///
    /// Public so wrappers with runtime introspection can push richer
    /// heap figures than procfs can see.
    pub fn record_sample(&self, agent: &AgentName, snapshot: MemorySnapshot) {
        let alerts = {
            let mut active = self.inner.active.write();
            let Some(metrics) = active.get_mut(agent) else {
                return;
            };
            apply_sample(metrics, snapshot, &self.inner.config);
            evaluate_alerts(metrics, agent, snapshot, &self.inner.config)
        };

        for alert in alerts {
            info!(
                agent = %alert.agent,
                kind = ?alert.kind,
                resident_bytes = alert.resident_bytes,
                "memory alert"
            );
            self.inner.hooks.emit(&HookEvent::MemoryAlert {
                alert: alert.clone(),
            });
            let _ = self.inner.alerts.send(alert);
        }
    }

    /// Current metrics for one agent (active or departed).
    pub fn metrics(&self, agent: &AgentName) -> Option<MemoryMetrics> {
        self.inner
            .active
            .read()
            .get(agent)
            .cloned()
            .or_else(|| self.inner.departed.read().get(agent).cloned())
    }

    /// Reconstruct crash context for an agent.
    pub fn crash_context(&self, agent: &AgentName) -> Option<CrashContext> {
        let metrics = self.metrics(agent)?;
        let last = metrics.last_snapshot().copied();
        let config = &self.inner.config;

        let likely_cause = match last {
            Some(snapshot) if snapshot.resident_bytes >= config.oom_imminent_bytes => {
                CrashCause::Oom
            }
            _ if metrics.trend == Trend::Growing
                && metrics.rate_per_minute > config.trend_growth_rate_warning =>
            {
                CrashCause::MemoryLeak
            }
            _ if last_step_delta(&metrics) > SPIKE_DELTA_BYTES => CrashCause::SuddenSpike,
            _ => CrashCause::Unknown,
        };

        let recent: Vec<MemorySnapshot> = metrics
            .snapshots
            .iter()
            .rev()
            .take(CRASH_RECENT_SAMPLES)
            .rev()
            .copied()
            .collect();

        Some(CrashContext {
            agent: agent.clone(),
            pid: metrics.pid,
            last_snapshot: last,
            high_watermark: metrics.high_watermark,
            low_watermark: metrics.low_watermark_or_zero(),
            average_rss: metrics.average_rss(),
            trend: metrics.trend,
            rate_per_minute: metrics.rate_per_minute,
            likely_cause,
            recent,
            captured_at: now_ms(),
        })
    }

    /// Drop a departed agent's preserved metrics.
    pub fn clear_crash_context(&self, agent: &AgentName) {
        self.inner.departed.write().remove(agent);
    }

    /// Admin summary over the active set.
    pub fn summary(&self) -> Vec<MemorySummaryEntry> {
        let active = self.inner.active.read();
        let mut entries: Vec<MemorySummaryEntry> = active
            .iter()
            .map(|(agent, metrics)| MemorySummaryEntry {
                agent: agent.clone(),
                pid: metrics.pid,
                resident_bytes: metrics
                    .last_snapshot()
                    .map_or(0, |s| s.resident_bytes),
                high_watermark: metrics.high_watermark,
                average_rss: metrics.average_rss(),
                trend: metrics.trend,
                rate_per_minute: metrics.rate_per_minute,
                alert_level: metrics.alert_level,
                samples: metrics.snapshots.len(),
            })
            .collect();
        entries.sort_by(|a, b| a.agent.cmp(&b.agent));
        entries
    }

    /// Run the sampling loop until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample_all(),
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("active", &self.inner.active.read().len())
            .field("departed", &self.inner.departed.read().len())
            .finish()
    }
}

/// Push a snapshot into the ring and refresh watermarks and trend.
fn apply_sample(metrics: &mut MemoryMetrics, snapshot: MemorySnapshot, config: &MonitorConfig) {
    metrics.snapshots.push_back(snapshot);

    // Retention by count and by age.
    while metrics.snapshots.len() > config.max_samples {
        metrics.snapshots.pop_front();
    }
    if let Ok(max_age) = chrono::Duration::from_std(config.max_sample_age) {
        let horizon = snapshot.ts - max_age;
        while metrics
            .snapshots
            .front()
            .is_some_and(|s| s.ts < horizon)
        {
            metrics.snapshots.pop_front();
        }
    }

    // High watermark is monotone; low only moves down.
    metrics.high_watermark = metrics.high_watermark.max(snapshot.resident_bytes);
    metrics.low_watermark = metrics.low_watermark.min(snapshot.resident_bytes);

    (metrics.trend, metrics.rate_per_minute) = compute_trend(&metrics.snapshots);
}

/// Trend over the most recent window; `Unknown` until the window fills.
fn compute_trend(
    snapshots: &std::collections::VecDeque<MemorySnapshot>,
) -> (Trend, f64) {
    if snapshots.len() < TREND_WINDOW {
        return (Trend::Unknown, 0.0);
    }
    let window: Vec<&MemorySnapshot> = snapshots
        .iter()
        .rev()
        .take(TREND_WINDOW)
        .rev()
        .collect();
    let first = window[0];
    let last = window[window.len() - 1];
    let minutes = (last.ts - first.ts).num_milliseconds().max(1) as f64 / 60_000.0;
    let delta = last.resident_bytes as f64 - first.resident_bytes as f64;
    let rate = delta / minutes;

    let trend = if rate > TREND_BAND_BYTES_PER_MINUTE {
        Trend::Growing
    } else if rate < -TREND_BAND_BYTES_PER_MINUTE {
        Trend::Shrinking
    } else {
        Trend::Stable
    };
    (trend, rate)
}

fn last_step_delta(metrics: &MemoryMetrics) -> u64 {
    let len = metrics.snapshots.len();
    if len < 2 {
        return 0;
    }
    let last = metrics.snapshots[len - 1].resident_bytes;
    let prev = metrics.snapshots[len - 2].resident_bytes;
    last.saturating_sub(prev)
}

/// Threshold state machine.
///
/// Escalations fire regardless of the cooldown; repeats at or below the
/// last announced level are debounced; recovery always fires.
fn evaluate_alerts(
    metrics: &mut MemoryMetrics,
    agent: &AgentName,
    snapshot: MemorySnapshot,
    config: &MonitorConfig,
) -> Vec<MemoryAlert> {
    let rss = snapshot.resident_bytes;
    let new_level = if rss >= config.oom_imminent_bytes {
        AlertLevel::OomImminent
    } else if rss >= config.critical_bytes {
        AlertLevel::Critical
    } else if rss >= config.warning_bytes {
        AlertLevel::Warning
    } else {
        AlertLevel::Normal
    };

    let now = snapshot.ts;
    let cooled = |last: Option<DateTime<Utc>>| {
        last.is_none_or(|t| {
            (now - t).to_std().unwrap_or_default() >= config.alert_cooldown
        })
    };

    let mut alerts = Vec::new();
    let mut push = |metrics: &MemoryMetrics, kind: AlertKind, level: AlertLevel| {
        alerts.push(MemoryAlert {
            agent: agent.clone(),
            kind,
            level,
            resident_bytes: rss,
            rate_per_minute: metrics.rate_per_minute,
            ts: now,
        });
    };

    if new_level > metrics.alert_level {
        // `last_alert_level` remembers the highest level announced within
        // the cooldown window; a strictly higher crossing bypasses the
        // cooldown, a repeat of an announced level waits it out.
        let escalates = metrics
            .last_alert_level
            .is_none_or(|announced| new_level > announced);
        if escalates || cooled(metrics.last_alert) {
            let kind = match new_level {
                AlertLevel::Warning => AlertKind::Warning,
                AlertLevel::Critical => AlertKind::Critical,
                AlertLevel::OomImminent => AlertKind::OomImminent,
                AlertLevel::Normal => unreachable!("normal is never above another level"),
            };
            push(metrics, kind, new_level);
            metrics.last_alert = Some(now);
            metrics.last_alert_level = Some(new_level);
        }
    } else if new_level == AlertLevel::Normal && metrics.alert_level != AlertLevel::Normal {
        // Recovery always fires and does not consume the cooldown window;
        // the announced level stays put so a relapse inside the window is
        // still debounced.
        push(metrics, AlertKind::Recovered, AlertLevel::Normal);
    }
    metrics.alert_level = new_level;

    if metrics.trend == Trend::Growing
        && metrics.rate_per_minute > config.trend_growth_rate_warning
        && cooled(metrics.last_alert)
    {
        push(metrics, AlertKind::TrendWarning, new_level);
        metrics.last_alert = Some(now);
    }

    alerts
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn agent(name: &str) -> AgentName {
        AgentName::parse(name).unwrap()
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            warning_bytes: 100 * MIB,
            critical_bytes: 200 * MIB,
            oom_imminent_bytes: 300 * MIB,
            alert_cooldown: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn monitor() -> MemoryMonitor {
        MemoryMonitor::new(test_config(), Arc::new(HookEmitter::new()))
    }

    fn snapshot_at(ts: DateTime<Utc>, rss: u64) -> MemorySnapshot {
        MemorySnapshot {
            ts,
            resident_bytes: rss,
            heap_used: 0,
            heap_total: 0,
            external_bytes: 0,
            cpu_percent: 0.0,
        }
    }

    /// Register an agent without requiring a live process.
    fn register_synthetic(monitor: &MemoryMonitor, name: &str) {
        monitor
            .inner
            .active
            .write()
            .insert(agent(name), MemoryMetrics::new(4242, None));
    }

    #[test]
    fn test_alert_transitions_warning_critical_recovered() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let mut rx = monitor.subscribe();

        let base = Utc::now();
        for (offset, rss) in [(0, 50 * MIB), (10, 150 * MIB), (20, 250 * MIB), (30, 50 * MIB)]
        {
            let ts = base + chrono::Duration::seconds(offset);
            monitor.record_sample(&agent("X"), snapshot_at(ts, rss));
        }

        // Escalations bypass the cooldown; recovery always fires.
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::Warning);
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::Critical);
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::Recovered);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cooldown_debounces_repeats() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let mut rx = monitor.subscribe();

        let base = Utc::now();
        // warning, recover, warning again within the cooldown
        monitor.record_sample(&agent("X"), snapshot_at(base, 150 * MIB));
        monitor.record_sample(
            &agent("X"),
            snapshot_at(base + chrono::Duration::seconds(10), 50 * MIB),
        );
        monitor.record_sample(
            &agent("X"),
            snapshot_at(base + chrono::Duration::seconds(20), 150 * MIB),
        );

        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::Warning);
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::Recovered);
        // The relapse repeats an already-announced level inside the
        // cooldown window, so it is debounced.
        assert!(rx.try_recv().is_err());

        // Once the cooldown has passed, the same crossing fires again.
        monitor.record_sample(
            &agent("X"),
            snapshot_at(base + chrono::Duration::seconds(100), 40 * MIB),
        );
        monitor.record_sample(
            &agent("X"),
            snapshot_at(base + chrono::Duration::seconds(110), 150 * MIB),
        );
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::Recovered);
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::Warning);
    }

    #[test]
    fn test_oom_imminent_level() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        monitor.record_sample(&agent("X"), snapshot_at(Utc::now(), 350 * MIB));
        let metrics = monitor.metrics(&agent("X")).unwrap();
        assert_eq!(metrics.alert_level, AlertLevel::OomImminent);
    }

    #[test]
    fn test_watermarks() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let base = Utc::now();
        for (i, rss) in [50 * MIB, 80 * MIB, 30 * MIB, 60 * MIB].into_iter().enumerate() {
            monitor.record_sample(
                &agent("X"),
                snapshot_at(base + chrono::Duration::seconds(i as i64), rss),
            );
        }

        let metrics = monitor.metrics(&agent("X")).unwrap();
        assert_eq!(metrics.high_watermark, 80 * MIB);
        assert_eq!(metrics.low_watermark, 30 * MIB);
        assert_eq!(metrics.average_rss(), 55 * MIB);
    }

    #[test]
    fn test_trend_unknown_until_six_samples() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let base = Utc::now();
        for i in 0..5 {
            monitor.record_sample(
                &agent("X"),
                snapshot_at(base + chrono::Duration::seconds(i * 10), 50 * MIB),
            );
        }
        assert_eq!(monitor.metrics(&agent("X")).unwrap().trend, Trend::Unknown);
    }

    #[test]
    fn test_trend_growing() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let base = Utc::now();
        // +5 MiB every 10 seconds = 30 MiB/min, well past the band.
        for i in 0..6u64 {
            monitor.record_sample(
                &agent("X"),
                snapshot_at(
                    base + chrono::Duration::seconds(i as i64 * 10),
                    40 * MIB + i * 5 * MIB,
                ),
            );
        }
        let metrics = monitor.metrics(&agent("X")).unwrap();
        assert_eq!(metrics.trend, Trend::Growing);
        assert!(metrics.rate_per_minute > 0.0);
    }

    #[test]
    fn test_trend_stable_within_band() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let base = Utc::now();
        for i in 0..6 {
            monitor.record_sample(
                &agent("X"),
                snapshot_at(base + chrono::Duration::seconds(i * 10), 50 * MIB),
            );
        }
        assert_eq!(monitor.metrics(&agent("X")).unwrap().trend, Trend::Stable);
    }

    #[test]
    fn test_trend_shrinking() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let base = Utc::now();
        for i in 0..6u64 {
            monitor.record_sample(
                &agent("X"),
                snapshot_at(
                    base + chrono::Duration::seconds(i as i64 * 10),
                    100 * MIB - i * 5 * MIB,
                ),
            );
        }
        assert_eq!(monitor.metrics(&agent("X")).unwrap().trend, Trend::Shrinking);
    }

    #[test]
    fn test_ring_bounded_by_count() {
        let mut config = test_config();
        config.max_samples = 10;
        let monitor = MemoryMonitor::new(config, Arc::new(HookEmitter::new()));
        register_synthetic(&monitor, "X");

        let base = Utc::now();
        for i in 0..50 {
            monitor.record_sample(
                &agent("X"),
                snapshot_at(base + chrono::Duration::seconds(i), 50 * MIB),
            );
        }
        assert_eq!(monitor.metrics(&agent("X")).unwrap().snapshots.len(), 10);
    }

    #[test]
    fn test_crash_context_oom() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        monitor.record_sample(&agent("X"), snapshot_at(Utc::now(), 350 * MIB));

        let context = monitor.crash_context(&agent("X")).unwrap();
        assert_eq!(context.likely_cause, CrashCause::Oom);
        assert_eq!(context.last_snapshot.unwrap().resident_bytes, 350 * MIB);
    }

    #[test]
    fn test_crash_context_sudden_spike() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        let base = Utc::now();
        monitor.record_sample(&agent("X"), snapshot_at(base, 20 * MIB));
        monitor.record_sample(
            &agent("X"),
            snapshot_at(base + chrono::Duration::seconds(10), 150 * MIB),
        );

        let context = monitor.crash_context(&agent("X")).unwrap();
        assert_eq!(context.likely_cause, CrashCause::SuddenSpike);
    }

    #[test]
    fn test_crash_context_survives_unregister() {
        let monitor = monitor();
        register_synthetic(&monitor, "X");
        monitor.record_sample(&agent("X"), snapshot_at(Utc::now(), 75 * MIB));

        monitor.unregister(&agent("X"));
        assert!(!monitor.is_registered(&agent("X")));
        // Final metrics preserved until cleared.
        let context = monitor.crash_context(&agent("X")).unwrap();
        assert_eq!(context.high_watermark, 75 * MIB);

        monitor.clear_crash_context(&agent("X"));
        assert!(monitor.crash_context(&agent("X")).is_none());
    }

    #[test]
    fn test_summary() {
        let monitor = monitor();
        register_synthetic(&monitor, "B");
        register_synthetic(&monitor, "A");
        monitor.record_sample(&agent("A"), snapshot_at(Utc::now(), 10 * MIB));

        let summary = monitor.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].agent.as_str(), "A");
        assert_eq!(summary[0].resident_bytes, 10 * MIB);
    }

    #[test]
    fn test_sample_for_unregistered_agent_is_ignored() {
        let monitor = monitor();
        monitor.record_sample(&agent("Ghost"), snapshot_at(Utc::now(), 10 * MIB));
        assert!(monitor.metrics(&agent("Ghost")).is_none());
    }
}
