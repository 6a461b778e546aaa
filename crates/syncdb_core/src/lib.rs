//! # SyncDB Core
//!
//! Table storage engine for SyncDB.
//!
//! This crate provides:
//! - Record tables (a single keyless record) and AVL tables (a
//!   capacity-bounded map ordered by a key prefix of the record)
//! - Per-client change tracking and delete-pending tombstones
//! - Replication dirty flags consumed by the NSF replicator
//! - A name-ordered table registry
//! - Snapshot files and archives for storable tables
//!
//! ## Usage
//!
//! ```
//! use syncdb_core::{ClientId, ReadOptions, TableName, TableRegistry, TableSpec};
//!
//! let mut registry = TableRegistry::new();
//! let name = TableName::new("vlan").unwrap();
//! let table = registry.create(TableSpec::avl(name, 8, 4, 16)).unwrap();
//! table.insert(&[1, 0, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
//!
//! let read = table
//!     .get(&[1, 0, 0, 0, 0, 0, 0, 0], ClientId::new(0), ReadOptions::CONSUME)
//!     .unwrap();
//! assert_eq!(read.data[4], 0xaa);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod persist;
mod registry;
pub mod table;
mod types;

pub use error::{CoreError, CoreResult};
pub use persist::{PersistConfig, TableSnapshot, TableStore};
pub use registry::{RegistryStats, TableRegistry};
pub use table::{InsertOutcome, Table, TableCounters};
pub use types::{
    ClientId, ClientMask, ReadOptions, RecordRead, TableFlags, TableKind, TableName, TableSpec,
    TableStatus, MAX_CLIENTS, MAX_RECORD_SIZE, TABLE_NAME_LEN,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
