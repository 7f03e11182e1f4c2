//! agent-relay daemon CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agent_relay::server::BrokerServer;
use agent_relay::system::{RelayConfig, ENV_LOG_LEVEL};
use agent_relay::RelayClient;

/// Exit code for client-side command failures (broker not running, etc).
const EXIT_FAILURE: u8 = 1;

/// agent-relay - per-project message broker for terminal coding agents
#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path (overrides state dir and AGENT_RELAY_SOCKET)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker daemon in the foreground
    Run {
        /// State directory for the socket and journals
        #[arg(short = 'd', long)]
        state_dir: Option<PathBuf>,

        /// Keep messages in memory only (no journals)
        #[arg(long)]
        ephemeral: bool,
    },

    /// Query a running broker's status
    Status,

    /// List dead-letter entries from a running broker
    Dlq {
        /// Only unacknowledged entries
        #[arg(long)]
        unacknowledged: bool,

        /// Page size
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_logging() {
    let filter = std::env::var(ENV_LOG_LEVEL)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

fn build_config(cli_socket: Option<PathBuf>, state_dir: Option<PathBuf>, ephemeral: bool) -> RelayConfig {
    let mut config = match &state_dir {
        Some(dir) => RelayConfig::for_state_dir(dir),
        None => RelayConfig::for_state_dir(".agent-relay"),
    };
    if ephemeral {
        config.state_dir = None;
    }
    config.apply_env();
    if let Some(socket) = cli_socket {
        config.socket_path = socket;
    }
    config
}

/// Socket path for client commands: flag, env, or the default state dir.
fn client_socket(cli_socket: Option<PathBuf>) -> PathBuf {
    build_config(cli_socket, None, false).socket_path
}

async fn run_broker(config: RelayConfig) -> Result<(), agent_relay::ServerError> {
    let server = BrokerServer::start(config).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = sigterm.recv() => info!("termination requested"),
        }
        handle.shutdown();
    });

    server.run().await
}

async fn show_status(socket: PathBuf) -> Result<(), String> {
    let (mut client, _welcome) = RelayClient::connect(&socket, "__cli__")
        .await
        .map_err(|e| format!("cannot reach broker at {}: {e}", socket.display()))?;
    let status = client
        .admin("status", json!({}))
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
    Ok(())
}

async fn show_dlq(socket: PathBuf, unacknowledged: bool, limit: usize) -> Result<(), String> {
    let (mut client, _welcome) = RelayClient::connect(&socket, "__cli__")
        .await
        .map_err(|e| format!("cannot reach broker at {}: {e}", socket.display()))?;
    let mut args = json!({ "limit": limit });
    if unacknowledged {
        args["acknowledged"] = json!(false);
    }
    let entries = client
        .admin("dlq_query", args)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Run {
            state_dir,
            ephemeral,
        } => {
            let config = build_config(cli.socket, state_dir, ephemeral);
            match run_broker(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "broker failed");
                    ExitCode::from(e.exit_code().clamp(0, 255) as u8)
                }
            }
        }
        Commands::Status => match show_status(client_socket(cli.socket)).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
        Commands::Dlq {
            unacknowledged,
            limit,
        } => match show_dlq(client_socket(cli.socket), unacknowledged, limit).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
    }
}
