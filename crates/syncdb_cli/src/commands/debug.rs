//! Debug command implementation.

use std::path::Path;
use syncdb_server::{SyncDbClient, COMMAND_SOCKET};

/// Prints the server's state dump without registering.
pub fn run(run_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let dump = SyncDbClient::debug_dump(run_dir.join(COMMAND_SOCKET), std::env::temp_dir())?;
    print!("{dump}");
    Ok(())
}
