//! Core type definitions for SyncDB.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Width of a table name on the wire and in the registry.
pub const TABLE_NAME_LEN: usize = 32;

/// Largest record a table may be created with.
pub const MAX_RECORD_SIZE: usize = 32 * 1024;

/// Size of the client id space. One bit per client in a [`ClientMask`].
pub const MAX_CLIENTS: usize = 128;

/// Fixed-width, zero-padded table name.
///
/// Ordering compares the padded bytes, which is lexicographic order on the
/// name itself.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName([u8; TABLE_NAME_LEN]);

impl TableName {
    /// Creates a table name, validating length and content.
    pub fn new(name: &str) -> CoreResult<Self> {
        if name.is_empty() {
            return Err(CoreError::invalid_argument("table name is empty"));
        }
        if name.len() > TABLE_NAME_LEN {
            return Err(CoreError::invalid_argument(format!(
                "table name {name:?} exceeds {TABLE_NAME_LEN} bytes"
            )));
        }
        if name.bytes().any(|b| b == 0) {
            return Err(CoreError::invalid_argument("table name contains NUL"));
        }
        let mut bytes = [0u8; TABLE_NAME_LEN];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self(bytes))
    }

    /// Parses a padded name received from the wire.
    pub fn from_padded(bytes: [u8; TABLE_NAME_LEN]) -> CoreResult<Self> {
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(TABLE_NAME_LEN);
        if bytes[len..].iter().any(|&b| b != 0) {
            return Err(CoreError::invalid_argument("table name has bytes after NUL"));
        }
        let name = std::str::from_utf8(&bytes[..len])
            .map_err(|_| CoreError::invalid_argument("table name is not UTF-8"))?;
        Self::new(name)
    }

    /// Returns the padded representation.
    #[must_use]
    pub const fn as_padded(&self) -> &[u8; TABLE_NAME_LEN] {
        &self.0
    }

    /// Returns the name without padding.
    #[must_use]
    pub fn as_str(&self) -> &str {
        let len = self
            .0
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TABLE_NAME_LEN);
        // Constructors only accept UTF-8.
        std::str::from_utf8(&self.0[..len]).unwrap_or_default()
    }
}

impl fmt::Debug for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableName({:?})", self.as_str())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-assigned client identifier.
///
/// Ids are drawn from `0..MAX_CLIENTS` and reused after unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u16);

impl ClientId {
    /// Creates a new client ID.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the id as an index into the client slot table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Set of client ids, one bit per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientMask(u128);

impl ClientMask {
    /// No clients.
    pub const EMPTY: Self = Self(0);
    /// Every possible client.
    pub const ALL: Self = Self(u128::MAX);

    /// Mask containing a single client.
    #[must_use]
    pub const fn single(client: ClientId) -> Self {
        Self(1u128 << (client.0 as u32 % MAX_CLIENTS as u32))
    }

    /// Returns true if the client is in the set.
    #[must_use]
    pub const fn contains(self, client: ClientId) -> bool {
        self.0 & Self::single(client).0 != 0
    }

    /// Adds a client.
    pub fn insert(&mut self, client: ClientId) {
        self.0 |= Self::single(client).0;
    }

    /// Removes a client.
    pub fn remove(&mut self, client: ClientId) {
        self.0 &= !Self::single(client).0;
    }

    /// Returns this set with one client removed.
    #[must_use]
    pub const fn without(self, client: ClientId) -> Self {
        Self(self.0 & !Self::single(client).0)
    }

    /// Returns the intersection of two sets.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns true if both sets share a client.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of clients in the set.
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates over the client ids in ascending order.
    pub fn iter(self) -> impl Iterator<Item = ClientId> {
        (0..MAX_CLIENTS as u16)
            .map(ClientId)
            .filter(move |id| self.contains(*id))
    }
}

impl BitOr for ClientMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Kind of table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TableKind {
    /// A single keyless fixed-size record.
    Record = 1,
    /// An ordered, capacity-bounded map keyed by a record prefix.
    Avl = 2,
}

impl TableKind {
    /// Converts a byte to a table kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Record),
            2 => Some(Self::Avl),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Short human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Avl => "avl",
        }
    }
}

/// Table creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableFlags(u32);

impl TableFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Table may be snapshotted to a file with TableStore.
    pub const STORABLE: Self = Self(1 << 0);
    /// Snapshot goes to the NVRAM directory instead of the store directory.
    pub const NVRAM: Self = Self(1 << 1);
    /// Table contents are replicated to the backup manager.
    pub const NSF: Self = Self(1 << 2);
    /// Populate the table from its snapshot file at creation.
    pub const LOAD_FROM_FILE: Self = Self(1 << 3);
    /// Insert fails with EntryExists instead of overwriting a live record.
    pub const REJECT_IF_EXISTS: Self = Self(1 << 4);

    const KNOWN: u32 = 0x1f;

    /// Builds flags from raw bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::KNOWN)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TableFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Parameters for creating a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name.
    pub name: TableName,
    /// Table kind.
    pub kind: TableKind,
    /// Creation flags.
    pub flags: TableFlags,
    /// Size of every record in bytes.
    pub record_size: usize,
    /// Length of the key prefix (AVL only, zero for Record tables).
    pub key_size: usize,
    /// Raw node capacity, including delete-pending nodes.
    pub max_records: usize,
    /// Cap on live (non-deleted) records.
    pub max_non_deleted_records: usize,
}

impl TableSpec {
    /// Describes an AVL table whose live cap equals its capacity.
    pub fn avl(name: TableName, record_size: usize, key_size: usize, max_records: usize) -> Self {
        Self {
            name,
            kind: TableKind::Avl,
            flags: TableFlags::NONE,
            record_size,
            key_size,
            max_records,
            max_non_deleted_records: max_records,
        }
    }

    /// Describes a Record table.
    pub fn record(name: TableName, record_size: usize) -> Self {
        Self {
            name,
            kind: TableKind::Record,
            flags: TableFlags::NONE,
            record_size,
            key_size: 0,
            max_records: 1,
            max_non_deleted_records: 1,
        }
    }

    /// Sets the live-record cap.
    #[must_use]
    pub fn with_live_cap(mut self, max_non_deleted_records: usize) -> Self {
        self.max_non_deleted_records = max_non_deleted_records;
        self
    }

    /// Sets the creation flags.
    #[must_use]
    pub fn with_flags(mut self, flags: TableFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Checks the geometry for consistency.
    pub fn validate(&self) -> CoreResult<()> {
        if self.record_size == 0 || self.record_size > MAX_RECORD_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "record size {} outside 1..={MAX_RECORD_SIZE}",
                self.record_size
            )));
        }
        if self.kind == TableKind::Avl {
            if self.key_size == 0 || self.key_size > self.record_size {
                return Err(CoreError::invalid_argument(format!(
                    "key size {} outside 1..={}",
                    self.key_size, self.record_size
                )));
            }
            if self.max_records == 0 {
                return Err(CoreError::invalid_argument("max_records is zero"));
            }
            if self.max_non_deleted_records == 0
                || self.max_non_deleted_records > self.max_records
            {
                return Err(CoreError::invalid_argument(format!(
                    "live cap {} outside 1..={}",
                    self.max_non_deleted_records, self.max_records
                )));
            }
        }
        Ok(())
    }
}

/// Snapshot of a table's geometry and the caller's pending events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatus {
    /// Table kind.
    pub kind: TableKind,
    /// Creation flags.
    pub flags: TableFlags,
    /// Record size.
    pub record_size: usize,
    /// Key size (zero for Record tables).
    pub key_size: usize,
    /// Raw capacity.
    pub max_records: usize,
    /// Live-record cap.
    pub max_non_deleted_records: usize,
    /// Physical node count, delete-pending nodes included.
    pub num_records: usize,
    /// Live node count.
    pub num_non_deleted_records: usize,
    /// Caller has not yet seen the table's creation.
    pub created: bool,
    /// Caller has not yet seen the latest change.
    pub changed: bool,
    /// Caller has not yet seen the latest purge.
    pub purged: bool,
}

/// A record returned by a read operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRead {
    /// Record bytes, always the table's record size.
    pub data: Vec<u8>,
    /// The record was deleted and is waiting to be observed.
    pub delete_pending: bool,
}

/// Options shared by read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOptions {
    /// Leave the caller's change bit untouched.
    pub preserve: bool,
}

impl ReadOptions {
    /// Read that consumes the caller's change bit.
    pub const CONSUME: Self = Self { preserve: false };
    /// Read that leaves change bits untouched.
    pub const PRESERVE: Self = Self { preserve: true };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_padding_round_trip() {
        let name = TableName::new("ports").unwrap();
        assert_eq!(name.as_str(), "ports");
        assert_eq!(&name.as_padded()[..5], b"ports");
        assert!(name.as_padded()[5..].iter().all(|&b| b == 0));

        let parsed = TableName::from_padded(*name.as_padded()).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn table_name_rejects_bad_input() {
        assert!(TableName::new("").is_err());
        assert!(TableName::new(&"x".repeat(33)).is_err());
        assert!(TableName::new("a\0b").is_err());

        let mut padded = [0u8; TABLE_NAME_LEN];
        padded[0] = b'a';
        padded[2] = b'b';
        assert!(TableName::from_padded(padded).is_err());
    }

    #[test]
    fn table_names_sort_lexicographically() {
        let mut names = vec![
            TableName::new("vlan").unwrap(),
            TableName::new("acl").unwrap(),
            TableName::new("ac").unwrap(),
        ];
        names.sort();
        let sorted: Vec<_> = names.iter().map(TableName::as_str).collect();
        assert_eq!(sorted, ["ac", "acl", "vlan"]);
    }

    #[test]
    fn client_mask_operations() {
        let a = ClientId::new(3);
        let b = ClientId::new(127);
        let mut mask = ClientMask::EMPTY;
        mask.insert(a);
        mask.insert(b);
        assert!(mask.contains(a));
        assert_eq!(mask.len(), 2);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![a, b]);
        assert!(!mask.without(a).contains(a));
        mask.remove(b);
        assert_eq!(mask, ClientMask::single(a));
    }

    #[test]
    fn spec_validation() {
        let name = TableName::new("T").unwrap();
        assert!(TableSpec::avl(name, 8, 4, 2).validate().is_ok());
        assert!(TableSpec::avl(name, 8, 9, 2).validate().is_err());
        assert!(TableSpec::avl(name, 8, 4, 2)
            .with_live_cap(3)
            .validate()
            .is_err());
        assert!(TableSpec::record(name, 0).validate().is_err());
        assert!(TableSpec::record(name, 16).validate().is_ok());
    }

    #[test]
    fn flags_truncate_unknown_bits() {
        let flags = TableFlags::from_bits_truncate(0xffff_ffff);
        assert!(flags.contains(TableFlags::NSF | TableFlags::STORABLE));
        assert_eq!(flags.bits(), 0x1f);
    }
}
