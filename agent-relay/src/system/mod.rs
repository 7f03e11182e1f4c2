//! Broker configuration and composition.

mod config;

pub use config::{
    ConfigError, RelayConfig, RelayConfigBuilder, DLQ_FILENAME, ENV_LOG_LEVEL, ENV_SOCKET,
    ENV_STATE_DIR, MESSAGES_FILENAME, SOCKET_FILENAME,
};
