//! # agent-relay - Local Message Broker for Coding Agents
//!
//! A per-project messaging broker connecting terminal-resident AI coding
//! agents over a Unix domain socket: directed messages, broadcasts, topic
//! fanout, and threaded replies, with at-least-once delivery backed by a
//! durable journal and a dead-letter queue.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use agent_relay::server::BrokerServer;
//! use agent_relay::system::RelayConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = RelayConfig::for_state_dir(".relay");
//!     config.apply_env();
//!
//!     let server = BrokerServer::start(config).await?;
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.shutdown();
//!     });
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery Contract
//!
//! - **Durability before ack**: a send acknowledged `pending` is already
//!   recoverable from the journal.
//! - **At-least-once**: unacknowledged deliveries are retried with
//!   exponential backoff, then quarantined to the dead-letter queue.
//! - **FIFO per pair**: between one sender and one recipient, envelopes
//!   are delivered in acceptance order.
//! - **Frozen fanout**: a broadcast's recipient set is resolved once, at
//!   accept time; late joiners do not receive it.
//!
//! # Module Organization
//!
//! ## Core Broker
//! - [`message`] - Envelope record, recipients, kinds, status transitions
//! - [`protocol`] - Wire frames and the length-prefixed JSON codec
//! - [`registry`] - Presence and subscriptions behind one read-mostly lock
//! - [`session`] - Per-connection state and the bounded outbound queue
//! - [`delivery`] - Routing, per-recipient FIFO workers, retry, offline
//!   parking
//!
//! ## Persistence
//! - [`storage`] - Batched durable envelope store over an append journal
//! - [`dlq`] - Dead-letter queue with query/acknowledge/retry bookkeeping
//!
//! ## Observation
//! - [`hooks`] - Ordered synchronous observers with stop propagation
//! - [`monitor`] - Memory sampling, trend analysis, alerts, crash context
//! - [`metrics`] - Broker-wide counters
//!
//! ## Infrastructure
//! - [`server`] - Socket lifecycle, connection tasks, shutdown
//! - [`client`] - Minimal client for wrappers and tests
//! - [`system`] - Configuration
//! - [`util`] - Identifiers and shared helpers

pub mod client;
pub mod delivery;
pub mod dlq;
pub mod hooks;
pub mod message;
pub mod metrics;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod system;
pub mod util;

pub use client::{RelayClient, SendOptions, SendOutcome};
pub use message::{Envelope, MessageKind, MessageStatus, Recipient};
pub use server::{BrokerHandle, BrokerServer, ServerError};
pub use system::RelayConfig;
