// Layer 1: Standard library imports
use std::io;
use std::path::PathBuf;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use crate::dlq::DlqError;
use crate::storage::StorageError;
use crate::system::ConfigError;

/// Fatal broker failures, mapped to process exit codes by the CLI.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration failed validation (exit 64)
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A live broker already owns the socket (exit 65)
    #[error("broker already running with pid {pid}")]
    AlreadyRunning { pid: i32 },

    /// Storage could not be initialized (exit 70)
    #[error("storage initialization failed: {0}")]
    StorageInit(#[from] StorageError),

    /// Dead-letter store could not be initialized (exit 70)
    #[error("dead letter store initialization failed: {0}")]
    DlqInit(#[from] DlqError),

    /// The listening socket could not be bound (exit 74)
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Other I/O failure during startup or shutdown
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 64,
            Self::AlreadyRunning { .. } => 65,
            Self::StorageInit(_) | Self::DlqInit(_) | Self::Io(_) => 70,
            Self::Bind { .. } => 74,
        }
    }
}
