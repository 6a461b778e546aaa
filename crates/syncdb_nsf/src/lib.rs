//! # SyncDB NSF
//!
//! Non-stop forwarding: replication of NSF tables from the Manager server to
//! the Backup server through the SyncDB agent.
//!
//! ## Architecture
//!
//! The replicator is a plain state machine driven by its owner:
//!
//! 1. [`NsfReplicator::tick`] runs periodically. It applies a requested role
//!    change, and as Manager sends dirty data or runs the ACK and idle timers.
//! 2. [`NsfReplicator::handle_message`] is called for every message the agent
//!    delivers.
//!
//! Outbound messages go through an [`AgentTransport`], so the same code runs
//! against a Unix socket in the server and against [`RecordingTransport`] in
//! tests.
//!
//! ## Key Invariants
//!
//! - At most `window` messages are unacknowledged at any time
//! - A record is never split across two bursts
//! - The backup applies Data messages strictly in sequence order
//! - A gap is reported with a single MISS until it is filled

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod receiver;
mod sender;
mod state;
mod transport;

pub use config::NsfConfig;
pub use error::{NsfError, NsfResult};
pub use state::{NsfReplicator, NsfStats, TableChange};
pub use transport::{AgentTransport, RecordingTransport, UnixAgentTransport};
