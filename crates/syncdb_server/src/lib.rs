//! # SyncDB Server
//!
//! Local IPC server for SyncDB.
//!
//! This crate provides:
//! - The server context owning tables, clients and the NSF replicator
//! - Command dispatch with one synchronous reply per request
//! - Change notification to subscribed clients
//! - A client registry with liveness sweeps
//! - The event loop on a current-thread tokio runtime
//! - A blocking client library
//!
//! # Architecture
//!
//! Everything runs on one thread. The event loop waits on:
//! - the shared command socket, where clients send requests
//! - the agent socket, where NSF messages from the peer manager arrive
//! - a 1 Hz timer driving NSF retransmission and the liveness sweep
//! - SIGHUP (state dump) and SIGINT/SIGTERM (shutdown)
//!
//! Each event is handled to completion before the next. Change masks,
//! notifications and replication flags are settled before a reply is sent.
//!
//! ```rust,ignore
//! use syncdb_server::{Daemon, ServerConfig};
//!
//! let config = ServerConfig::new("/run/syncdb");
//! Daemon::bind(config)?.serve()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod api;
mod client;
mod config;
mod error;
mod handler;
mod notify;
mod rundir;
mod runtime;
mod server;

pub use api::{SyncDbClient, DEFAULT_REPLY_TIMEOUT};
pub use client::{ClientEntry, ClientRegistry};
pub use config::{ServerConfig, AGENT_PEER_SOCKET, AGENT_SOCKET, COMMAND_SOCKET};
pub use error::{ServerError, ServerResult};
pub use notify::notify;
pub use rundir::RunDir;
pub use runtime::{shutdown_signal, Daemon, ServerHandle};
pub use server::{ReplyTo, Server, ServerStats};
