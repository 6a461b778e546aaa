//! CLI command implementations.

pub mod debug;
pub mod nsf;
pub mod serve;
pub mod status;
pub mod table_status;

use std::path::Path;
use syncdb_server::{ServerResult, SyncDbClient, COMMAND_SOCKET};

/// Registers a short-lived client with the server in `run_dir`.
pub fn connect(run_dir: &Path) -> ServerResult<SyncDbClient> {
    SyncDbClient::connect(
        run_dir.join(COMMAND_SOCKET),
        std::env::temp_dir(),
        "syncdb-cli",
    )
}
