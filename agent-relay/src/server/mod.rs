//! Broker server: socket lifecycle, per-connection tasks, background
//! maintenance, and coordinated shutdown.

mod admin;
mod connection;
mod error;

pub use error::ServerError;

// Layer 1: Standard library imports
use std::fs;
use std::path::Path;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use serde_json::json;
use tokio::net::UnixListener;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Layer 3: Internal module imports
use crate::delivery::DeliveryEngine;
use crate::dlq::{DlqAdapter, JournalDlq, MemoryDlq};
use crate::hooks::HookEmitter;
use crate::metrics::BrokerMetrics;
use crate::monitor::MemoryMonitor;
use crate::protocol::{event_kind, ServerFrame};
use crate::registry::Registry;
use crate::storage::{JournalStorage, MemoryStorage, StorageAdapter};
use crate::system::RelayConfig;

/// Version string reported in `welcome` frames and admin status.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared collaborators handed to every connection task.
#[derive(Clone)]
pub(crate) struct Shared {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<Registry>,
    pub storage: Arc<dyn StorageAdapter>,
    pub dlq: Arc<dyn DlqAdapter>,
    pub engine: DeliveryEngine,
    pub hooks: Arc<HookEmitter>,
    pub monitor: MemoryMonitor,
    pub metrics: Arc<BrokerMetrics>,
    pub shutdown: CancellationToken,
}

impl Shared {
    /// Push an event frame to every connected session, best effort.
    pub fn broadcast_event(&self, kind: &str, payload: serde_json::Value) {
        let frame = ServerFrame::Event {
            kind: kind.to_string(),
            payload,
        };
        for session in self.registry.sessions() {
            session.try_push(frame.clone());
        }
    }
}

/// Handle for requesting shutdown from outside the server task.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    shutdown: CancellationToken,
}

impl BrokerHandle {
    /// Begin the cooperative shutdown sequence.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// The broker: owns the listening socket and all background tasks.
pub struct BrokerServer {
    shared: Shared,
    listener: UnixListener,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer").finish_non_exhaustive()
    }
}

impl BrokerServer {
    /// Validate configuration, claim the socket and PID file, initialize
    /// storage, and prepare to accept connections.
    pub async fn start(config: RelayConfig) -> Result<Self, ServerError> {
        config.validate()?;

        if let Some(dir) = &config.state_dir {
            fs::create_dir_all(dir)?;
        }
        if let Some(parent) = config.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let pid_path = config.pid_path();
        check_stale_instance(&pid_path, &config.socket_path)?;

        let storage: Arc<dyn StorageAdapter> = match config.messages_path() {
            Some(path) => Arc::new(JournalStorage::open(path, config.batch()).await?),
            None => Arc::new(MemoryStorage::new()),
        };
        let dlq: Arc<dyn DlqAdapter> = match config.dlq_path() {
            Some(path) => Arc::new(JournalDlq::open(path).await?),
            None => Arc::new(MemoryDlq::new()),
        };

        let listener = UnixListener::bind(&config.socket_path).map_err(|source| {
            ServerError::Bind {
                path: config.socket_path.clone(),
                source,
            }
        })?;
        fs::write(&pid_path, format!("{}\n", std::process::id()))?;

        let registry = Arc::new(Registry::new());
        let hooks = Arc::new(HookEmitter::new());
        let metrics = Arc::new(BrokerMetrics::new());
        let monitor = MemoryMonitor::new(config.monitor.clone(), Arc::clone(&hooks));
        let engine = DeliveryEngine::new(
            config.delivery(),
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&dlq),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
        );

        // Envelopes still pending from a previous run cannot resume
        // (offline queues are in-memory); quarantine them up front.
        engine.sweep_stale_pending().await;

        info!(socket = %config.socket_path.display(), "broker listening");
        Ok(Self {
            shared: Shared {
                config: Arc::new(config),
                registry,
                storage,
                dlq,
                engine,
                hooks,
                monitor,
                metrics,
                shutdown: CancellationToken::new(),
            },
            listener,
        })
    }

    /// Handle for requesting shutdown (signal handlers, embedders).
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            shutdown: self.shared.shutdown.clone(),
        }
    }

    /// Hook registration point for embedders.
    pub fn hooks(&self) -> Arc<HookEmitter> {
        Arc::clone(&self.shared.hooks)
    }

    /// The memory monitor, for registering peer processes.
    pub fn monitor(&self) -> MemoryMonitor {
        self.shared.monitor.clone()
    }

    /// Socket path the broker is listening on.
    pub fn socket_path(&self) -> &Path {
        &self.shared.config.socket_path
    }

    /// Accept connections until shutdown, then drain and clean up.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self { shared, listener } = self;

        let monitor_task = tokio::spawn(
            shared
                .monitor
                .clone()
                .run(shared.shutdown.child_token()),
        );
        tokio::spawn(forward_alerts(shared.clone()));
        tokio::spawn(watch_degraded(shared.clone()));
        tokio::spawn(run_maintenance(shared.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let shared = shared.clone();
                        tokio::spawn(connection::handle_connection(shared, stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = shared.shutdown.cancelled() => break,
            }
        }

        info!("broker shutting down");
        shutdown_sequence(&shared).await;
        let _ = monitor_task.await;
        Ok(())
    }
}

/// Refuse to start when a live broker owns the PID file; clear stale
/// leftovers from a crashed one.
fn check_stale_instance(pid_path: &Path, socket_path: &Path) -> Result<(), ServerError> {
    if let Ok(contents) = fs::read_to_string(pid_path) {
        if let Ok(pid) = contents.trim().parse::<i32>() {
            if process_alive(pid) {
                return Err(ServerError::AlreadyRunning { pid });
            }
        }
        debug!(path = %pid_path.display(), "removing stale pid file");
        let _ = fs::remove_file(pid_path);
    }
    if socket_path.exists() {
        debug!(path = %socket_path.display(), "removing stale socket");
        let _ = fs::remove_file(socket_path);
    }
    Ok(())
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 probes existence; EPERM still means the process exists.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Forward memory alerts to sessions as event frames.
async fn forward_alerts(shared: Shared) {
    let mut alerts = shared.monitor.subscribe();
    loop {
        tokio::select! {
            alert = alerts.recv() => match alert {
                Ok(alert) => {
                    let payload = serde_json::to_value(&alert).unwrap_or(serde_json::Value::Null);
                    shared.broadcast_event(event_kind::MEMORY_ALERT, payload);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "memory alert forwarder lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = shared.shutdown.cancelled() => break,
        }
    }
}

/// Announce storage degradation transitions to every session.
async fn watch_degraded(shared: Shared) {
    let mut watch = shared.storage.watch_degraded();
    loop {
        tokio::select! {
            changed = watch.changed() => {
                if changed.is_err() {
                    break;
                }
                let degraded = *watch.borrow();
                if degraded {
                    warn!("storage degraded, refusing new sends");
                    shared.broadcast_event(event_kind::DEGRADED, json!({ "degraded": true }));
                } else {
                    info!("storage recovered");
                    shared.broadcast_event(event_kind::DEGRADED, json!({ "degraded": false }));
                }
            },
            _ = shared.shutdown.cancelled() => break,
        }
    }
}

/// Periodic retention pruning, dead-letter cleanup, and TTL sweeps.
async fn run_maintenance(shared: Shared) {
    let config = &shared.config;
    let mut ticker = tokio::time::interval(config.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.engine.expire_parked().await;
                match shared.storage.prune(config.retention, config.max_entries).await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "message retention pruned"),
                    Err(e) => warn!(error = %e, "message retention prune failed"),
                }
                match shared
                    .dlq
                    .cleanup(config.dlq_retention, config.dlq_max_entries)
                    .await
                {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "dead letter cleanup removed entries"),
                    Err(e) => warn!(error = %e, "dead letter cleanup failed"),
                }
            },
            _ = shared.shutdown.cancelled() => break,
        }
    }
}

/// Cooperative shutdown: notify, drain, close, flush, remove files.
async fn shutdown_sequence(shared: &Shared) {
    shared.broadcast_event(event_kind::SHUTDOWN, json!({}));

    // Let writers drain their queues, bounded by the configured budget.
    let deadline = Instant::now() + shared.config.shutdown_drain;
    while Instant::now() < deadline {
        let outstanding: usize = shared
            .registry
            .sessions()
            .iter()
            .map(|s| s.pending_frames())
            .sum();
        if outstanding == 0 {
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }

    for session in shared.registry.sessions() {
        session.close();
    }
    shared.engine.shutdown();

    if let Err(e) = shared.storage.flush().await {
        warn!(error = %e, "storage flush at shutdown failed");
    }
    if let Err(e) = shared.storage.close().await {
        warn!(error = %e, "storage close failed");
    }
    if let Err(e) = shared.dlq.close().await {
        warn!(error = %e, "dead letter store close failed");
    }

    let _ = fs::remove_file(&shared.config.socket_path);
    let _ = fs::remove_file(shared.config.pid_path());
    info!("broker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_start_writes_pid_file() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::for_state_dir(dir.path());
        let server = BrokerServer::start(config.clone()).await.unwrap();

        let pid_contents = fs::read_to_string(config.pid_path()).unwrap();
        assert_eq!(
            pid_contents.trim().parse::<u32>().unwrap(),
            std::process::id()
        );
        assert!(config.socket_path.exists());
        drop(server);
    }

    #[tokio::test]
    async fn test_second_instance_refused() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::for_state_dir(dir.path());
        let _server = BrokerServer::start(config.clone()).await.unwrap();

        let err = BrokerServer::start(config).await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning { .. }));
        assert_eq!(err.exit_code(), 65);
    }

    #[tokio::test]
    async fn test_stale_pid_file_recovered() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::for_state_dir(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        // A dead pid and a leftover socket from a crashed run.
        fs::write(config.pid_path(), "999999999\n").unwrap();
        fs::write(&config.socket_path, b"").unwrap();

        let server = BrokerServer::start(config.clone()).await.unwrap();
        drop(server);
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::for_state_dir(dir.path());
        let socket = config.socket_path.clone();
        let pid_path = config.pid_path();

        let server = BrokerServer::start(config).await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        task.await.unwrap().unwrap();

        assert!(!socket.exists());
        assert!(!pid_path.exists());
    }
}
