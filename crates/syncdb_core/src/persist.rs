//! Table snapshots on disk.
//!
//! A storable table is written to one file per table:
//!
//! ```text
//! <store_dir>/<table>.sdb     # STORABLE tables
//! <nvram_dir>/<table>.sdb     # STORABLE | NVRAM tables
//! ```
//!
//! Files hold a CBOR-encoded [`TableSnapshot`] with the live records only;
//! tombstones are never persisted. When an archive path is configured the
//! store directory is additionally packed into a gzip-compressed tarball
//! after every save, and a missing snapshot is restored from that archive
//! on load.

use crate::error::{CoreError, CoreResult};
use crate::table::Table;
use crate::types::{TableFlags, TableKind, TableName};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;
/// Extension of snapshot files.
const SNAPSHOT_EXT: &str = "sdb";
/// Suffix of in-progress writes.
const TEMP_SUFFIX: &str = "tmp";

/// Where snapshots and the archive live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistConfig {
    /// Directory for STORABLE tables.
    pub store_dir: PathBuf,
    /// Directory for STORABLE tables that also carry the NVRAM flag.
    pub nvram_dir: PathBuf,
    /// Optional `.tar.gz` archive of `store_dir`.
    pub archive_path: Option<PathBuf>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/var/lib/syncdb/store"),
            nvram_dir: PathBuf::from("/var/lib/syncdb/nvram"),
            archive_path: None,
        }
    }
}

impl PersistConfig {
    /// Uses `root/store` and `root/nvram` with no archive.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            store_dir: root.join("store"),
            nvram_dir: root.join("nvram"),
            archive_path: None,
        }
    }

    /// Sets the store directory.
    #[must_use]
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    /// Sets the NVRAM directory.
    #[must_use]
    pub fn with_nvram_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.nvram_dir = dir.into();
        self
    }

    /// Enables archiving to the given path.
    #[must_use]
    pub fn with_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_path = Some(path.into());
        self
    }
}

/// On-disk form of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Format version.
    pub version: u16,
    /// Table name.
    pub name: String,
    /// Table kind.
    pub kind: TableKind,
    /// Record size the records were written with.
    pub record_size: usize,
    /// Key size the records were written with.
    pub key_size: usize,
    /// Live records in key order.
    pub records: Vec<Vec<u8>>,
}

impl TableSnapshot {
    /// Captures the live records of a table.
    pub fn capture(table: &Table) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            name: table.name().as_str().to_string(),
            kind: table.kind(),
            record_size: table.record_size(),
            key_size: table.key_size(),
            records: table.live_records(),
        }
    }

    /// Encodes the snapshot as CBOR.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::snapshot(format!("encode failed: {e}")))?;
        Ok(buf)
    }

    /// Decodes a CBOR snapshot.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let snapshot: Self = ciborium::from_reader(bytes)
            .map_err(|e| CoreError::snapshot(format!("decode failed: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CoreError::snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn check_geometry(&self, table: &Table) -> CoreResult<()> {
        if self.kind != table.kind()
            || self.record_size != table.record_size()
            || self.key_size != table.key_size()
        {
            return Err(CoreError::snapshot(format!(
                "snapshot of {} was written as {} {}/{} but the table is {} {}/{}",
                self.name,
                self.kind.as_str(),
                self.record_size,
                self.key_size,
                table.kind().as_str(),
                table.record_size(),
                table.key_size()
            )));
        }
        Ok(())
    }
}

/// Saves and loads table snapshots.
#[derive(Debug, Clone)]
pub struct TableStore {
    config: PersistConfig,
}

impl TableStore {
    /// Creates a store over the configured directories.
    pub fn new(config: PersistConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Path of the snapshot file for a table.
    pub fn snapshot_path(&self, name: &TableName, flags: TableFlags) -> PathBuf {
        let dir = if flags.contains(TableFlags::NVRAM) {
            &self.config.nvram_dir
        } else {
            &self.config.store_dir
        };
        dir.join(format!("{name}.{SNAPSHOT_EXT}"))
    }

    /// Writes a table's live records to its snapshot file.
    ///
    /// The file is replaced atomically. Archives the store directory
    /// afterwards when an archive is configured.
    pub fn save(&self, table: &Table) -> CoreResult<PathBuf> {
        if !table.flags().contains(TableFlags::STORABLE) {
            return Err(CoreError::invalid_argument(format!(
                "table {} is not storable",
                table.name()
            )));
        }
        let path = self.snapshot_path(table.name(), table.flags());
        let snapshot = TableSnapshot::capture(table);
        let data = snapshot.encode()?;
        write_atomic(&path, &data)?;
        info!(
            table = %table.name(),
            records = snapshot.records.len(),
            path = %path.display(),
            "table stored"
        );

        if self.config.archive_path.is_some() && !table.flags().contains(TableFlags::NVRAM) {
            self.archive()?;
        }
        Ok(path)
    }

    /// Populates a freshly created table from its snapshot file.
    ///
    /// Returns the number of records loaded. A missing file (after trying
    /// the archive) leaves the table empty.
    pub fn load(&self, table: &mut Table) -> CoreResult<usize> {
        let path = self.snapshot_path(table.name(), table.flags());
        if !path.exists() && !table.flags().contains(TableFlags::NVRAM) {
            self.restore_from_archive(&path)?;
        }
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(table = %table.name(), path = %path.display(), "no snapshot to load");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = TableSnapshot::decode(&data)?;
        snapshot.check_geometry(table)?;
        for record in &snapshot.records {
            if record.len() != table.record_size() {
                return Err(CoreError::snapshot(format!(
                    "record of {} bytes in snapshot of {}",
                    record.len(),
                    table.name()
                )));
            }
            table.put_record(record)?;
        }
        info!(table = %table.name(), records = snapshot.records.len(), "table loaded");
        Ok(snapshot.records.len())
    }

    /// Packs every snapshot in the store directory into the archive.
    pub fn archive(&self) -> CoreResult<()> {
        let Some(archive_path) = &self.config.archive_path else {
            return Ok(());
        };
        let temp = temp_path(archive_path);
        if let Some(parent) = archive_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&temp)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut packed = 0usize;
        if self.config.store_dir.is_dir() {
            for entry in fs::read_dir(&self.config.store_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                    continue;
                }
                let Some(file_name) = path.file_name() else {
                    continue;
                };
                builder.append_path_with_name(&path, file_name)?;
                packed += 1;
            }
        }
        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        drop(writer);
        fs::rename(&temp, archive_path)?;
        debug!(archive = %archive_path.display(), files = packed, "store archived");
        Ok(())
    }

    /// Extracts one snapshot file from the archive if both exist.
    fn restore_from_archive(&self, target: &Path) -> CoreResult<bool> {
        let Some(archive_path) = &self.config.archive_path else {
            return Ok(false);
        };
        let Some(wanted) = target.file_name() else {
            return Ok(false);
        };
        let file = match File::open(archive_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let matches = {
                let path = entry.path()?;
                path.file_name() == Some(wanted) && path.components().count() == 1
            };
            if !matches {
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(target)?;
            warn!(
                path = %target.display(),
                archive = %archive_path.display(),
                "snapshot restored from archive"
            );
            return Ok(true);
        }
        Ok(false)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Write-then-rename so a crash never leaves a torn snapshot behind.
fn write_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_path(path);
    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)?;
    Ok(())
}
