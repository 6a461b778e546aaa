//! Table storage engine.
//!
//! A [`Table`] is either a single keyless record or an ordered map of
//! fixed-size records (an "AVL" table). Besides the data it keeps the
//! bookkeeping that drives change notification and replication:
//!
//! - table-level client masks for unseen create / change / purge events
//! - per-node client masks for unseen record changes
//! - delete-pending tombstones that live until every interested observer
//!   has read them
//! - NSF dirty flags consumed by the replicator
//!
//! A tombstone is collectable once no subscribed client still has its change
//! bit set and, while the table is being replicated, the replicator has sent
//! it. The two kinds of interest are tracked separately.
//!
//! On a backup, tombstones replicated from the manager are mirrored: they
//! stay until the manager erases its own copy or purges the table.

mod avl;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    ClientId, ClientMask, ReadOptions, RecordRead, TableFlags, TableKind, TableName, TableSpec,
    TableStatus,
};
use avl::{AvlStore, Node};
use std::collections::BTreeSet;
use tracing::debug;

/// Result of a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOutcome {
    /// Number of tombstones purged to make room.
    pub purged: usize,
}

/// Per-table operation counters for the debug surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableCounters {
    /// Successful inserts (new or overwrite).
    pub inserts: u64,
    /// Successful sets and field sets.
    pub updates: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Capacity purges.
    pub purges: u64,
    /// Reads that returned a record.
    pub reads: u64,
}

#[derive(Debug, Clone)]
enum Storage {
    Record(Vec<u8>),
    Avl(AvlStore),
}

/// A SyncDB table.
#[derive(Debug, Clone)]
pub struct Table {
    spec: TableSpec,
    storage: Storage,
    subscribers: ClientMask,
    created: ClientMask,
    changed: ClientMask,
    purged: ClientMask,
    nsf_changed: bool,
    nsf_purge_pending: bool,
    /// Replicated tombstones erased here since the last burst.
    nsf_erased: BTreeSet<Vec<u8>>,
    replicating: bool,
    counters: TableCounters,
}

fn collectable(node: &Node, subscribers: ClientMask, replicating: bool) -> bool {
    node.delete_pending
        && !node.changed.intersects(subscribers)
        && !(replicating && node.nsf_changed)
        && !node.mirrored
}

impl Table {
    /// Creates an empty table.
    pub fn new(spec: TableSpec) -> CoreResult<Self> {
        spec.validate()?;
        let storage = match spec.kind {
            TableKind::Record => Storage::Record(vec![0; spec.record_size]),
            TableKind::Avl => Storage::Avl(AvlStore::new(spec.key_size)),
        };
        let nsf = spec.flags.contains(TableFlags::NSF);
        Ok(Self {
            spec,
            storage,
            subscribers: ClientMask::EMPTY,
            created: ClientMask::ALL,
            changed: ClientMask::EMPTY,
            purged: ClientMask::EMPTY,
            nsf_changed: nsf,
            nsf_purge_pending: false,
            nsf_erased: BTreeSet::new(),
            replicating: false,
            counters: TableCounters::default(),
        })
    }

    /// Returns the table name.
    pub fn name(&self) -> &TableName {
        &self.spec.name
    }

    /// Returns the creation parameters.
    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    /// Returns the table kind.
    pub fn kind(&self) -> TableKind {
        self.spec.kind
    }

    /// Returns the creation flags.
    pub fn flags(&self) -> TableFlags {
        self.spec.flags
    }

    /// Returns the record size.
    pub fn record_size(&self) -> usize {
        self.spec.record_size
    }

    /// Returns the key size.
    pub fn key_size(&self) -> usize {
        self.spec.key_size
    }

    /// Returns true if the table is replicated to the backup manager.
    pub fn is_nsf(&self) -> bool {
        self.spec.flags.contains(TableFlags::NSF)
    }

    /// Returns true while the local replicator is sending this table.
    pub fn is_replicating(&self) -> bool {
        self.replicating
    }

    /// Physical node count, tombstones included.
    pub fn num_records(&self) -> usize {
        match &self.storage {
            Storage::Record(_) => 1,
            Storage::Avl(avl) => avl.len(),
        }
    }

    /// Live node count.
    pub fn num_non_deleted_records(&self) -> usize {
        match &self.storage {
            Storage::Record(_) => 1,
            Storage::Avl(avl) => avl.live(),
        }
    }

    /// Bytes reserved for record data at full capacity.
    pub fn capacity_bytes(&self) -> usize {
        self.spec.max_records * self.spec.record_size
    }

    /// Clients subscribed to change notifications.
    pub fn subscribers(&self) -> ClientMask {
        self.subscribers
    }

    /// Returns the operation counters.
    pub fn counters(&self) -> TableCounters {
        self.counters
    }

    /// Subscribes a client to change notifications.
    pub fn subscribe(&mut self, client: ClientId) {
        self.subscribers.insert(client);
    }

    fn check_size(&self, len: usize) -> CoreResult<()> {
        if len != self.spec.record_size {
            return Err(CoreError::SizeMismatch {
                expected: self.spec.record_size,
                actual: len,
            });
        }
        Ok(())
    }

    fn check_window(&self, offset: usize, len: usize) -> CoreResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.spec.record_size => Ok(()),
            _ => Err(CoreError::invalid_argument(format!(
                "field window {offset}+{len} exceeds record size {}",
                self.spec.record_size
            ))),
        }
    }

    fn unsupported(&self, operation: &'static str) -> CoreError {
        CoreError::Unsupported {
            operation,
            kind: self.spec.kind.as_str(),
        }
    }

    fn mark_changed(&mut self) {
        self.changed = ClientMask::ALL;
        if self.is_nsf() {
            self.nsf_changed = true;
        }
    }

    fn note_purge(&mut self) {
        self.purged = ClientMask::ALL;
        self.counters.purges += 1;
        if self.is_nsf() {
            self.nsf_purge_pending = true;
            self.nsf_changed = true;
            self.nsf_erased.clear();
        }
    }

    /// Inserts or overwrites a record.
    ///
    /// When raw capacity is exhausted but the live cap still has room, every
    /// tombstone is purged first; the outcome reports how many.
    pub fn insert(&mut self, record: &[u8]) -> CoreResult<InsertOutcome> {
        let reject = self.spec.flags.contains(TableFlags::REJECT_IF_EXISTS);
        self.insert_inner(record, reject)
    }

    fn insert_inner(&mut self, record: &[u8], reject_if_exists: bool) -> CoreResult<InsertOutcome> {
        self.check_size(record.len())?;
        let nsf = self.is_nsf();
        let name = self.spec.name;
        let live_cap = self.spec.max_non_deleted_records;
        let capacity = self.spec.max_records;
        let Storage::Avl(avl) = &mut self.storage else {
            return Err(self.unsupported("insert"));
        };

        let mut outcome = InsertOutcome::default();
        let existing = avl.get(avl.key_of(record)).map(|node| node.delete_pending);
        match existing {
            Some(false) => {
                if reject_if_exists {
                    return Err(CoreError::EntryExists);
                }
                avl.overwrite(record, nsf)?;
            }
            Some(true) => {
                if avl.live() >= live_cap {
                    return Err(CoreError::table_full(name.as_str()));
                }
                avl.overwrite(record, nsf)?;
            }
            None => {
                if avl.live() >= live_cap {
                    return Err(CoreError::table_full(name.as_str()));
                }
                if avl.len() >= capacity {
                    outcome.purged = avl.purge_deleted();
                    debug!(table = %name, purged = outcome.purged, "purged tombstones to make room");
                    if avl.len() >= capacity {
                        return Err(CoreError::invariant(format!(
                            "table {name} has no room after purge"
                        )));
                    }
                }
                avl.insert_new(record, nsf)?;
            }
        }

        self.counters.inserts += 1;
        if outcome.purged > 0 {
            self.note_purge();
        }
        self.mark_changed();
        Ok(outcome)
    }

    /// Deletes the record whose key prefix matches `record`.
    ///
    /// `caller` is excluded from the set of clients that must observe the
    /// deletion.
    pub fn remove(&mut self, record: &[u8], caller: Option<ClientId>) -> CoreResult<()> {
        self.check_size(record.len())?;
        let key = record[..self.spec.key_size].to_vec();
        self.remove_key(&key, caller)
    }

    /// Deletes the record with the given key.
    pub fn remove_key(&mut self, key: &[u8], caller: Option<ClientId>) -> CoreResult<()> {
        let interested = match caller {
            Some(client) => self.subscribers.without(client),
            None => self.subscribers,
        };
        let replicating = self.replicating;
        let nsf = self.is_nsf();
        let Storage::Avl(avl) = &mut self.storage else {
            return Err(self.unsupported("delete"));
        };
        match avl.get(key) {
            Some(node) if !node.delete_pending => {}
            _ => return Err(CoreError::NotFound),
        }
        if !interested.is_empty() || replicating {
            avl.mark_deleted(key, interested, nsf)?;
        } else {
            avl.erase(key)?;
        }
        self.counters.deletes += 1;
        self.mark_changed();
        Ok(())
    }

    /// Replaces the whole record (Record tables) or an existing live node.
    pub fn set(&mut self, record: &[u8]) -> CoreResult<()> {
        self.check_size(record.len())?;
        let nsf = self.is_nsf();
        match &mut self.storage {
            Storage::Record(data) => data.copy_from_slice(record),
            Storage::Avl(avl) => {
                match avl.get(avl.key_of(record)) {
                    Some(node) if !node.delete_pending => {}
                    _ => return Err(CoreError::NotFound),
                }
                avl.overwrite(record, nsf)?;
            }
        }
        self.counters.updates += 1;
        self.mark_changed();
        Ok(())
    }

    /// Copies `record[offset..offset + len]` into the stored record.
    pub fn field_set(&mut self, record: &[u8], offset: usize, len: usize) -> CoreResult<()> {
        self.check_size(record.len())?;
        self.check_window(offset, len)?;
        let window = offset..offset + len;
        let nsf = self.is_nsf();
        match &mut self.storage {
            Storage::Record(data) => data[window.clone()].copy_from_slice(&record[window]),
            Storage::Avl(avl) => {
                let key = avl.key_of(record);
                let node = match avl.get_mut(key) {
                    Some(node) if !node.delete_pending => node,
                    _ => return Err(CoreError::NotFound),
                };
                node.data[window.clone()].copy_from_slice(&record[window]);
                node.changed = ClientMask::ALL;
                node.nsf_changed |= nsf;
            }
        }
        self.counters.updates += 1;
        self.mark_changed();
        Ok(())
    }

    /// Reads the record (Record tables) or the node with the matching key.
    pub fn get(
        &mut self,
        record: &[u8],
        client: ClientId,
        options: ReadOptions,
    ) -> CoreResult<RecordRead> {
        self.check_size(record.len())?;
        match &mut self.storage {
            Storage::Record(data) => {
                let read = RecordRead {
                    data: data.clone(),
                    delete_pending: false,
                };
                if !options.preserve {
                    self.changed.remove(client);
                }
                self.counters.reads += 1;
                Ok(read)
            }
            Storage::Avl(avl) => {
                let key = avl.key_of(record).to_vec();
                self.consume(&key, client, options)
            }
        }
    }

    /// Like [`Table::get`] but only `[offset, offset + len)` is returned; the
    /// rest of the buffer is zero.
    pub fn field_get(
        &mut self,
        record: &[u8],
        offset: usize,
        len: usize,
        client: ClientId,
        options: ReadOptions,
    ) -> CoreResult<RecordRead> {
        self.check_window(offset, len)?;
        let read = self.get(record, client, options)?;
        let mut data = vec![0; self.spec.record_size];
        data[offset..offset + len].copy_from_slice(&read.data[offset..offset + len]);
        Ok(RecordRead {
            data,
            delete_pending: read.delete_pending,
        })
    }

    /// Returns the first node after the key of `record`, or the first node
    /// overall when `record` is `None`.
    pub fn get_next(
        &mut self,
        record: Option<&[u8]>,
        client: ClientId,
        options: ReadOptions,
    ) -> CoreResult<RecordRead> {
        self.next_where(record, client, options, |_| true)
    }

    /// Like [`Table::get_next`] but skips nodes the client has already seen.
    pub fn get_next_changed(
        &mut self,
        record: Option<&[u8]>,
        client: ClientId,
        options: ReadOptions,
    ) -> CoreResult<RecordRead> {
        self.next_where(record, client, options, |node| node.changed.contains(client))
    }

    fn next_where(
        &mut self,
        record: Option<&[u8]>,
        client: ClientId,
        options: ReadOptions,
        filter: impl FnMut(&Node) -> bool,
    ) -> CoreResult<RecordRead> {
        if let Some(record) = record {
            self.check_size(record.len())?;
        }
        let key_size = self.spec.key_size;
        let Storage::Avl(avl) = &self.storage else {
            return Err(self.unsupported("get-next"));
        };
        let key = avl
            .next_after(record.map(|r| &r[..key_size]), filter)
            .ok_or(CoreError::NotFound)?;
        self.consume(&key, client, options)
    }

    fn consume(
        &mut self,
        key: &[u8],
        client: ClientId,
        options: ReadOptions,
    ) -> CoreResult<RecordRead> {
        let subscribers = self.subscribers;
        let replicating = self.replicating;
        let Storage::Avl(avl) = &mut self.storage else {
            return Err(self.unsupported("get"));
        };
        let node = avl.get_mut(key).ok_or(CoreError::NotFound)?;
        let read = RecordRead {
            data: node.data.clone(),
            delete_pending: node.delete_pending,
        };
        if !options.preserve {
            node.changed.remove(client);
            if collectable(node, subscribers, replicating) {
                avl.erase(key)?;
                if replicating {
                    self.nsf_erased.insert(key.to_vec());
                    self.nsf_changed = true;
                }
            }
        }
        self.counters.reads += 1;
        Ok(read)
    }

    /// Returns the caller's pending events and clears them.
    pub fn status(&mut self, client: ClientId) -> TableStatus {
        let status = TableStatus {
            kind: self.spec.kind,
            flags: self.spec.flags,
            record_size: self.spec.record_size,
            key_size: self.spec.key_size,
            max_records: self.spec.max_records,
            max_non_deleted_records: self.spec.max_non_deleted_records,
            num_records: self.num_records(),
            num_non_deleted_records: self.num_non_deleted_records(),
            created: self.created.contains(client),
            changed: self.changed.contains(client),
            purged: self.purged.contains(client),
        };
        self.created.remove(client);
        self.changed.remove(client);
        self.purged.remove(client);
        status
    }

    /// Erases every tombstone. Returns the number removed.
    pub fn purge_deleted(&mut self) -> usize {
        let Storage::Avl(avl) = &mut self.storage else {
            return 0;
        };
        let purged = avl.purge_deleted();
        if purged > 0 {
            self.note_purge();
        }
        purged
    }

    /// Drops every trace of a client and collects tombstones it was holding.
    pub fn forget_client(&mut self, client: ClientId) -> usize {
        self.subscribers.remove(client);
        self.created.remove(client);
        self.changed.remove(client);
        self.purged.remove(client);
        if let Storage::Avl(avl) = &mut self.storage {
            for (_, node) in avl.iter_mut() {
                node.changed.remove(client);
            }
        }
        self.collect_garbage()
    }

    /// Erases tombstones nobody is waiting for.
    pub fn collect_garbage(&mut self) -> usize {
        let subscribers = self.subscribers;
        let replicating = self.replicating;
        let Storage::Avl(avl) = &mut self.storage else {
            return 0;
        };
        let keys = avl.keys_where(|node| collectable(node, subscribers, replicating));
        for key in &keys {
            // Keys were just collected from the same map.
            let _ = avl.erase(key);
        }
        if replicating && !keys.is_empty() {
            self.nsf_erased.extend(keys.iter().cloned());
            self.nsf_changed = true;
        }
        keys.len()
    }

    /// Turns replication interest on or off.
    ///
    /// Only NSF tables can be replicated. Turning it off releases tombstones
    /// that were held only for the replicator.
    pub fn set_replicating(&mut self, on: bool) {
        self.replicating = on && self.is_nsf();
        if !self.replicating {
            self.nsf_erased.clear();
            self.collect_garbage();
        }
    }

    /// Marks the whole table for a full resync to the backup.
    pub fn mark_nsf_resync(&mut self) {
        if !self.is_nsf() {
            return;
        }
        self.nsf_changed = true;
        self.nsf_erased.clear();
        if let Storage::Avl(avl) = &mut self.storage {
            self.nsf_purge_pending = true;
            for (_, node) in avl.iter_mut() {
                node.nsf_changed = true;
            }
        }
    }

    /// Returns true if the table has changes the backup has not seen.
    pub fn nsf_dirty(&self) -> bool {
        self.nsf_changed
    }

    /// Clears the table-level replication flag.
    pub fn clear_nsf_dirty(&mut self) {
        self.nsf_changed = false;
    }

    /// Returns true if a PURGE must be sent to the backup.
    pub fn nsf_purge_pending(&self) -> bool {
        self.nsf_purge_pending
    }

    /// Clears the pending PURGE.
    pub fn clear_nsf_purge_pending(&mut self) {
        self.nsf_purge_pending = false;
    }

    /// Keys of nodes awaiting replication with their delete-pending state.
    pub fn nsf_changed_nodes(&self) -> Vec<(Vec<u8>, bool)> {
        let Storage::Avl(avl) = &self.storage else {
            return Vec::new();
        };
        avl.iter()
            .filter(|(_, node)| node.nsf_changed)
            .map(|(key, node)| (key.clone(), node.delete_pending))
            .collect()
    }

    /// Record of a tombstone that local subscribers still have to read.
    ///
    /// The backup mirrors such a tombstone instead of erasing the node.
    pub fn held_tombstone(&self, key: &[u8]) -> Option<&[u8]> {
        let Storage::Avl(avl) = &self.storage else {
            return None;
        };
        avl.get(key)
            .filter(|node| node.delete_pending && node.changed.intersects(self.subscribers))
            .map(|node| node.data.as_slice())
    }

    /// Keys of replicated tombstones erased since they were sent.
    pub fn nsf_erased_keys(&self) -> Vec<Vec<u8>> {
        self.nsf_erased.iter().cloned().collect()
    }

    /// Forgets an erased key once the backup has been told.
    pub fn clear_nsf_erased(&mut self, key: &[u8]) {
        self.nsf_erased.remove(key);
    }

    /// Marks a node as replicated and collects it if it was a tombstone no
    /// one else is waiting for.
    pub fn clear_node_nsf(&mut self, key: &[u8]) -> CoreResult<()> {
        let subscribers = self.subscribers;
        let replicating = self.replicating;
        let Storage::Avl(avl) = &mut self.storage else {
            return Err(self.unsupported("node replication"));
        };
        let Some(node) = avl.get_mut(key) else {
            return Ok(());
        };
        node.nsf_changed = false;
        if collectable(node, subscribers, replicating) {
            avl.erase(key)?;
        }
        Ok(())
    }

    /// Returns the data of a Record table.
    pub fn record_data(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Record(data) => Some(data),
            Storage::Avl(_) => None,
        }
    }

    /// Returns the data of the node with the given key.
    pub fn node_data(&self, key: &[u8]) -> Option<&[u8]> {
        match &self.storage {
            Storage::Avl(avl) => avl.get(key).map(|node| node.data.as_slice()),
            Storage::Record(_) => None,
        }
    }

    /// Writes a record unconditionally, ignoring the reject-if-exists flag.
    ///
    /// Used for data that was already accepted elsewhere: records replicated
    /// from the manager and records restored from a snapshot.
    pub fn put_record(&mut self, record: &[u8]) -> CoreResult<()> {
        match self.spec.kind {
            TableKind::Record => self.set(record),
            TableKind::Avl => self.insert_inner(record, false).map(|_| ()),
        }
    }

    /// Deletes by bare key, returning false if the key was not live.
    ///
    /// A mirrored tombstone loses its hold and is collected unless local
    /// subscribers still have to read it.
    pub fn delete_key_if_present(&mut self, key: &[u8]) -> CoreResult<bool> {
        if key.len() != self.spec.key_size {
            return Err(CoreError::SizeMismatch {
                expected: self.spec.key_size,
                actual: key.len(),
            });
        }
        let subscribers = self.subscribers;
        let replicating = self.replicating;
        if let Storage::Avl(avl) = &mut self.storage {
            if let Some(node) = avl.get_mut(key).filter(|node| node.delete_pending) {
                node.mirrored = false;
                if collectable(node, subscribers, replicating) {
                    avl.erase(key)?;
                }
                return Ok(false);
            }
        }
        match self.remove_key(key, None) {
            Ok(()) => Ok(true),
            Err(CoreError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Mirrors a tombstone the NSF manager still holds.
    ///
    /// A live node becomes delete-pending for the local subscribers; a
    /// missing one is recreated from `record` without counting against the
    /// live cap. Returns true if a live record was deleted.
    pub fn hold_tombstone(&mut self, record: &[u8]) -> CoreResult<bool> {
        self.check_size(record.len())?;
        let subscribers = self.subscribers;
        let name = self.spec.name;
        let capacity = self.spec.max_records;
        let Storage::Avl(avl) = &mut self.storage else {
            return Err(self.unsupported("delete"));
        };
        let key = avl.key_of(record).to_vec();
        let deleted = match avl.get(&key).map(|node| node.delete_pending) {
            Some(false) => {
                avl.mark_deleted(&key, subscribers, false)?;
                true
            }
            Some(true) => false,
            None => {
                if avl.len() >= capacity {
                    return Err(CoreError::table_full(name.as_str()));
                }
                avl.insert_tombstone(record)?;
                false
            }
        };
        if let Some(node) = avl.get_mut(&key) {
            node.data.copy_from_slice(record);
            node.mirrored = true;
        }
        if deleted {
            self.counters.deletes += 1;
            self.mark_changed();
        }
        Ok(deleted)
    }

    /// Iterates over every record with its delete-pending flag, in key order.
    pub fn records(&self) -> Box<dyn Iterator<Item = (&[u8], bool)> + '_> {
        match &self.storage {
            Storage::Record(data) => Box::new(std::iter::once((data.as_slice(), false))),
            Storage::Avl(avl) => Box::new(
                avl.iter()
                    .map(|(_, node)| (node.data.as_slice(), node.delete_pending)),
            ),
        }
    }

    /// Live records in key order.
    pub fn live_records(&self) -> Vec<Vec<u8>> {
        self.records()
            .filter(|(_, pending)| !pending)
            .map(|(data, _)| data.to_vec())
            .collect()
    }

    /// Verifies the capacity invariants.
    pub fn check_invariants(&self) -> CoreResult<()> {
        let Storage::Avl(avl) = &self.storage else {
            return Ok(());
        };
        let live = avl.count_live();
        if live != avl.live() {
            return Err(CoreError::invariant(format!(
                "table {} counts {} live nodes but holds {live}",
                self.spec.name,
                avl.live()
            )));
        }
        if live > self.spec.max_non_deleted_records
            || self.spec.max_non_deleted_records > self.spec.max_records
            || avl.len() > self.spec.max_records
        {
            return Err(CoreError::invariant(format!(
                "table {} exceeds its capacity",
                self.spec.name
            )));
        }
        Ok(())
    }
}
