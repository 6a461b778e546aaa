//! Serve command implementation.

use std::path::PathBuf;
use std::time::Duration;
use syncdb_core::PersistConfig;
use syncdb_server::{Daemon, ServerConfig};
use tracing::info;

/// Options of the serve command.
#[derive(Debug)]
pub struct ServeOptions {
    /// Run directory.
    pub run_dir: PathBuf,
    /// Root of the snapshot directories.
    pub data_dir: PathBuf,
    /// NVRAM snapshot directory override.
    pub nvram_dir: Option<PathBuf>,
    /// Archive path.
    pub archive: Option<PathBuf>,
    /// Agent socket override.
    pub agent_peer: Option<PathBuf>,
    /// Client slot override.
    pub max_clients: Option<usize>,
    /// Timer period.
    pub tick_ms: u64,
}

impl ServeOptions {
    /// Maps the options onto a server configuration.
    pub fn config(&self) -> ServerConfig {
        let mut persist = PersistConfig::under(&self.data_dir);
        if let Some(dir) = &self.nvram_dir {
            persist = persist.with_nvram_dir(dir);
        }
        if let Some(archive) = &self.archive {
            persist = persist.with_archive(archive);
        }

        let mut config = ServerConfig::new(&self.run_dir)
            .with_persist(persist)
            .with_tick_interval(Duration::from_millis(self.tick_ms));
        if let Some(peer) = &self.agent_peer {
            config = config.with_agent_peer(peer);
        }
        if let Some(max) = self.max_clients {
            config = config.with_max_clients(max);
        }
        config
    }
}

/// Runs the server until SIGINT or SIGTERM.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.config();
    config.validate()?;
    info!(
        run_dir = %config.run_dir().display(),
        store_dir = %config.persist.store_dir.display(),
        "starting syncdb"
    );
    Daemon::bind(config)?.serve()?;
    Ok(())
}
