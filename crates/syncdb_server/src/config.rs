//! Server configuration.

use crate::error::{ServerError, ServerResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use syncdb_core::{PersistConfig, MAX_CLIENTS};
use syncdb_nsf::NsfConfig;

/// Name of the shared command socket inside the run directory.
pub const COMMAND_SOCKET: &str = "syncdb.sock";
/// Name of the socket the agent delivers NSF messages to.
pub const AGENT_SOCKET: &str = "syncdb_nsf.sock";
/// Name of the agent's own socket.
pub const AGENT_PEER_SOCKET: &str = "syncdb_agent.sock";

/// Configuration for the SyncDB server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the lock file and the server sockets.
    pub run_dir: PathBuf,
    /// Shared command socket.
    pub command_socket: PathBuf,
    /// Socket the agent sends NSF messages to.
    pub agent_socket: PathBuf,
    /// Socket of the agent, where outbound NSF messages go.
    pub agent_peer: PathBuf,
    /// Period of the event loop timer driving NSF.
    pub tick_interval: Duration,
    /// Period of the client liveness sweep.
    pub liveness_interval: Duration,
    /// Number of client slots.
    pub max_clients: usize,
    /// Snapshot locations.
    pub persist: PersistConfig,
    /// Replication tuning.
    pub nsf: NsfConfig,
}

impl ServerConfig {
    /// Creates a configuration with every socket inside `run_dir`.
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        let run_dir = run_dir.into();
        Self {
            command_socket: run_dir.join(COMMAND_SOCKET),
            agent_socket: run_dir.join(AGENT_SOCKET),
            agent_peer: run_dir.join(AGENT_PEER_SOCKET),
            run_dir,
            tick_interval: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(5),
            max_clients: MAX_CLIENTS,
            persist: PersistConfig::default(),
            nsf: NsfConfig::default(),
        }
    }

    /// Returns the run directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Sets the agent socket the server listens on.
    pub fn with_agent_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_socket = path.into();
        self
    }

    /// Sets the agent's socket.
    pub fn with_agent_peer(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_peer = path.into();
        self
    }

    /// Sets the timer period.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the liveness sweep period.
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Sets the number of client slots.
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Sets the snapshot locations.
    pub fn with_persist(mut self, persist: PersistConfig) -> Self {
        self.persist = persist;
        self
    }

    /// Sets the replication tuning.
    pub fn with_nsf(mut self, nsf: NsfConfig) -> Self {
        self.nsf = nsf;
        self
    }

    /// Checks the configuration.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(ServerError::config(format!(
                "max clients must be between 1 and {MAX_CLIENTS}, got {}",
                self.max_clients
            )));
        }
        if self.tick_interval.is_zero() || self.liveness_interval.is_zero() {
            return Err(ServerError::config("timer intervals must be non-zero"));
        }
        self.nsf.validate()?;
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("/run/syncdb")
    }
}
