//! Broker configuration with sensible defaults.

// Layer 1: Standard library imports
use std::path::{Path, PathBuf};
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use crate::delivery::DeliveryConfig;
use crate::monitor::MonitorConfig;
use crate::storage::BatchConfig;

/// Environment variable overriding the socket path.
pub const ENV_SOCKET: &str = "AGENT_RELAY_SOCKET";
/// Environment variable overriding the state directory.
pub const ENV_STATE_DIR: &str = "AGENT_RELAY_STATE_DIR";
/// Environment variable consumed by the CLI's log filter.
pub const ENV_LOG_LEVEL: &str = "AGENT_RELAY_LOG_LEVEL";

/// Socket filename inside the state directory.
pub const SOCKET_FILENAME: &str = "agent-relay.sock";
/// Message journal filename inside the state directory.
pub const MESSAGES_FILENAME: &str = "messages.db";
/// Dead-letter journal filename inside the state directory.
pub const DLQ_FILENAME: &str = "dlq.db";

/// Configuration validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Broker-wide configuration.
///
/// Defaults cover a local per-project deployment; use the builder for
/// overrides and [`RelayConfig::apply_env`] for environment variables.
///
/// # Examples
///
/// ```rust
/// use agent_relay::system::RelayConfig;
/// use std::time::Duration;
///
/// let config = RelayConfig::builder()
///     .with_state_dir("/tmp/my-project/.relay")
///     .with_ack_timeout(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// assert!(config.socket_path.ends_with("agent-relay.sock"));
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Unix socket the broker listens on
    pub socket_path: PathBuf,
    /// State directory for journals; `None` keeps everything in memory
    pub state_dir: Option<PathBuf>,

    /// Frame byte bound; larger frames disconnect the sender
    pub max_frame_bytes: usize,
    /// Body byte bound; larger sends are rejected
    pub max_body_bytes: usize,

    /// Handshake deadline for the first (`hello`) frame
    pub connect_timeout: Duration,
    /// Outbound silence before the broker pings a session
    pub heartbeat: Duration,
    /// Inbound silence before a session is closed
    pub idle_timeout: Duration,
    /// Per-recipient acknowledgement deadline
    pub ack_timeout: Duration,
    /// First retry delay
    pub initial_backoff: Duration,
    /// Retry delay cap
    pub max_backoff: Duration,
    /// Per-recipient attempt budget
    pub max_attempts: u32,
    /// Envelope time-to-live; `None` means no limit
    pub ttl: Option<Duration>,
    /// Reconnect window for a recipient lost mid-delivery
    pub reconnect_grace: Duration,
    /// Outbound queue drain budget at shutdown
    pub shutdown_drain: Duration,
    /// Outbound frame queue depth per session (the backpressure bound)
    pub outbound_queue_depth: usize,

    /// Sender token refill per second; 0 disables rate limiting
    pub rate_refill_per_sec: f64,
    /// Sender token bucket capacity
    pub rate_burst: f64,

    /// Storage batch flush trigger: record count
    pub max_batch_size: usize,
    /// Storage batch flush trigger: payload bytes
    pub max_batch_bytes: usize,
    /// Storage batch flush trigger: delay after first record
    pub max_batch_delay: Duration,
    /// Re-attempt interval while storage is degraded
    pub storage_retry: Duration,

    /// Message retention horizon
    pub retention: Duration,
    /// Message row cap
    pub max_entries: usize,
    /// Dead-letter retention horizon (acknowledged entries)
    pub dlq_retention: Duration,
    /// Dead-letter row cap
    pub dlq_max_entries: usize,
    /// Period of the retention/cleanup/TTL maintenance task
    pub cleanup_interval: Duration,

    /// Memory monitor thresholds and retention
    pub monitor: MonitorConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_FILENAME),
            state_dir: None,
            max_frame_bytes: 2 * 1024 * 1024,
            max_body_bytes: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
            ttl: None,
            reconnect_grace: Duration::from_secs(10),
            shutdown_drain: Duration::from_secs(5),
            outbound_queue_depth: 256,
            rate_refill_per_sec: 50.0,
            rate_burst: 100.0,
            max_batch_size: 64,
            max_batch_bytes: 256 * 1024,
            max_batch_delay: Duration::from_millis(25),
            storage_retry: Duration::from_secs(1),
            retention: Duration::from_secs(7 * 24 * 3600),
            max_entries: 100_000,
            dlq_retention: Duration::from_secs(72 * 3600),
            dlq_max_entries: 10_000,
            cleanup_interval: Duration::from_secs(300),
            monitor: MonitorConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Start building a configuration.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Configuration rooted in a project state directory: socket and
    /// journals live inside it.
    pub fn for_state_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            socket_path: dir.join(SOCKET_FILENAME),
            state_dir: Some(dir),
            ..Default::default()
        }
    }

    /// Apply `AGENT_RELAY_STATE_DIR` and `AGENT_RELAY_SOCKET`.
    ///
    /// The state directory is applied first, so an explicit socket
    /// override wins over the derived socket location.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            if !dir.is_empty() {
                let dir = PathBuf::from(dir);
                self.socket_path = dir.join(SOCKET_FILENAME);
                self.state_dir = Some(dir);
            }
        }
        if let Ok(socket) = std::env::var(ENV_SOCKET) {
            if !socket.is_empty() {
                self.socket_path = PathBuf::from(socket);
            }
        }
    }

    /// PID file path: the socket path with `.pid` appended.
    pub fn pid_path(&self) -> PathBuf {
        let mut name = self.socket_path.as_os_str().to_owned();
        name.push(".pid");
        PathBuf::from(name)
    }

    /// Message journal path, when running with a state directory.
    pub fn messages_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(MESSAGES_FILENAME))
    }

    /// Dead-letter journal path, when running with a state directory.
    pub fn dlq_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(DLQ_FILENAME))
    }

    /// Delivery engine view of this configuration.
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_body_bytes: self.max_body_bytes,
            ack_timeout: self.ack_timeout,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            max_attempts: self.max_attempts,
            ttl: self.ttl,
            reconnect_grace: self.reconnect_grace,
            rate_refill_per_sec: self.rate_refill_per_sec,
            rate_burst: self.rate_burst,
        }
    }

    /// Storage batch writer view of this configuration.
    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_batch_bytes: self.max_batch_bytes,
            max_batch_delay: self.max_batch_delay,
            retry_interval: self.storage_retry,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(invalid("socket_path", "must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be > 0"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("max_batch_size", "must be > 0"));
        }
        if self.max_batch_bytes == 0 {
            return Err(invalid("max_batch_bytes", "must be > 0"));
        }
        if self.outbound_queue_depth == 0 {
            return Err(invalid("outbound_queue_depth", "must be > 0"));
        }
        if self.max_body_bytes > self.max_frame_bytes {
            return Err(invalid(
                "max_body_bytes",
                "must not exceed max_frame_bytes",
            ));
        }
        if self.heartbeat >= self.idle_timeout {
            return Err(invalid(
                "heartbeat",
                "must be shorter than idle_timeout",
            ));
        }
        if self.initial_backoff.is_zero() {
            return Err(invalid("initial_backoff", "must be > 0"));
        }
        if self.monitor.warning_bytes >= self.monitor.critical_bytes
            || self.monitor.critical_bytes >= self.monitor.oom_imminent_bytes
        {
            return Err(invalid(
                "monitor",
                "thresholds must be warning < critical < oom_imminent",
            ));
        }
        Ok(())
    }
}

/// Builder for [`RelayConfig`] with a fluent API.
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Root the broker in a project state directory.
    pub fn with_state_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        self.config.socket_path = dir.join(SOCKET_FILENAME);
        self.config.state_dir = Some(dir);
        self
    }

    /// Listen on an explicit socket path.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// Set the per-recipient acknowledgement deadline.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Set the retry budget per recipient.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the envelope time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = Some(ttl);
        self
    }

    /// Set the heartbeat and idle windows.
    pub fn with_liveness(mut self, heartbeat: Duration, idle_timeout: Duration) -> Self {
        self.config.heartbeat = heartbeat;
        self.config.idle_timeout = idle_timeout;
        self
    }

    /// Set the memory monitor configuration.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    /// Mutate any remaining field directly.
    pub fn tune(mut self, f: impl FnOnce(&mut RelayConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<RelayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
