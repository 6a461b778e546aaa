//! NSF command implementation.

use std::path::Path;
use syncdb_protocol::NsfRole;

/// Requests an NSF role change. The server applies it at its next tick.
pub fn run(run_dir: &Path, role: NsfRole) -> Result<(), Box<dyn std::error::Error>> {
    let client = super::connect(run_dir)?;
    client.nsf_enable(role)?;
    println!("NSF role change to {} requested", role.as_str());
    Ok(())
}
