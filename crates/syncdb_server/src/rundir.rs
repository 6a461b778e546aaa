//! Run directory management.
//!
//! ```text
//! <run_dir>/
//! ├─ LOCK                 # held by the running server
//! ├─ syncdb.sock          # command socket
//! └─ syncdb_nsf.sock      # NSF messages from the agent
//! ```
//!
//! The LOCK file ensures only one server uses a run directory at a time, so
//! stale sockets left by a crashed server can be removed safely.

use crate::error::{ServerError, ServerResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";

/// An exclusively locked run directory.
#[derive(Debug)]
pub struct RunDir {
    path: PathBuf,
    _lock_file: File,
}

impl RunDir {
    /// Creates the directory if needed and takes the lock.
    pub fn lock(path: &Path) -> ServerResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(ServerError::config(format!(
                "run path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(ServerError::Locked {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Removes a socket file left behind by a previous run.
pub(crate) fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_lock_fails() {
        let dir = tempdir().unwrap();
        let run = dir.path().join("run");
        let first = RunDir::lock(&run).unwrap();
        assert_eq!(first.path(), run);
        assert!(run.join(LOCK_FILE).exists());

        let second = RunDir::lock(&run);
        assert!(matches!(second, Err(ServerError::Locked { .. })));

        drop(first);
        RunDir::lock(&run).unwrap();
    }

    #[test]
    fn stale_socket_removal_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        remove_stale_socket(&path).unwrap();

        std::fs::write(&path, b"").unwrap();
        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());
    }
}
