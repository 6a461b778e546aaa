//! Ordered node storage for AVL tables.
//!
//! Nodes are keyed by the first `key_size` bytes of their record. The store
//! tracks how many nodes are live; delete-pending nodes stay in the map until
//! the owning [`Table`](super::Table) decides nobody needs them anymore.

use crate::error::{CoreError, CoreResult};
use crate::types::ClientMask;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A single record plus its control block.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// Full record bytes.
    pub(crate) data: Vec<u8>,
    /// Clients that have not observed the latest value.
    pub(crate) changed: ClientMask,
    /// Logically deleted, kept until observed.
    pub(crate) delete_pending: bool,
    /// Must be sent to the backup manager.
    pub(crate) nsf_changed: bool,
    /// Tombstone kept because the NSF manager still holds it.
    pub(crate) mirrored: bool,
}

/// Key-ordered node map with a live-node counter.
#[derive(Debug, Clone)]
pub(crate) struct AvlStore {
    key_size: usize,
    nodes: BTreeMap<Vec<u8>, Node>,
    live: usize,
}

impl AvlStore {
    pub(crate) fn new(key_size: usize) -> Self {
        Self {
            key_size,
            nodes: BTreeMap::new(),
            live: 0,
        }
    }

    /// Returns the key prefix of a record.
    pub(crate) fn key_of<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[..self.key_size]
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &[u8]) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    /// Finds the first key strictly after `key` (or the first key overall)
    /// whose node satisfies `filter`.
    pub(crate) fn next_after(
        &self,
        key: Option<&[u8]>,
        mut filter: impl FnMut(&Node) -> bool,
    ) -> Option<Vec<u8>> {
        let lower = match key {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.nodes
            .range::<[u8], _>((lower, Bound::Unbounded))
            .find(|&(_, node)| filter(node))
            .map(|(key, _)| key.clone())
    }

    /// Adds a node for a key that is not present.
    pub(crate) fn insert_new(&mut self, record: &[u8], nsf_changed: bool) -> CoreResult<()> {
        let key = self.key_of(record).to_vec();
        let node = Node {
            data: record.to_vec(),
            changed: ClientMask::ALL,
            delete_pending: false,
            nsf_changed,
            mirrored: false,
        };
        if self.nodes.insert(key, node).is_some() {
            return Err(CoreError::invariant("insert_new replaced an existing node"));
        }
        self.live += 1;
        Ok(())
    }

    /// Adds a delete-pending node for a key that is not present.
    pub(crate) fn insert_tombstone(&mut self, record: &[u8]) -> CoreResult<()> {
        let key = self.key_of(record).to_vec();
        let node = Node {
            data: record.to_vec(),
            changed: ClientMask::EMPTY,
            delete_pending: true,
            nsf_changed: false,
            mirrored: true,
        };
        if self.nodes.insert(key, node).is_some() {
            return Err(CoreError::invariant("insert_tombstone replaced an existing node"));
        }
        Ok(())
    }

    /// Overwrites an existing node, reviving it if it was delete-pending.
    pub(crate) fn overwrite(&mut self, record: &[u8], nsf_changed: bool) -> CoreResult<()> {
        let key_size = self.key_size;
        let node = self
            .nodes
            .get_mut(&record[..key_size])
            .ok_or_else(|| CoreError::invariant("overwrite target vanished"))?;
        let revived = node.delete_pending;
        node.data.copy_from_slice(record);
        node.changed = ClientMask::ALL;
        node.delete_pending = false;
        node.nsf_changed |= nsf_changed;
        node.mirrored = false;
        if revived {
            self.live += 1;
        }
        Ok(())
    }

    /// Turns a live node into a tombstone visible to `interested`.
    pub(crate) fn mark_deleted(
        &mut self,
        key: &[u8],
        interested: ClientMask,
        nsf_changed: bool,
    ) -> CoreResult<()> {
        let node = self
            .nodes
            .get_mut(key)
            .ok_or_else(|| CoreError::invariant("delete target vanished"))?;
        if node.delete_pending {
            return Err(CoreError::invariant("node deleted twice"));
        }
        node.delete_pending = true;
        node.changed = interested;
        node.nsf_changed |= nsf_changed;
        self.live -= 1;
        Ok(())
    }

    /// Physically removes a node.
    pub(crate) fn erase(&mut self, key: &[u8]) -> CoreResult<Node> {
        let node = self
            .nodes
            .remove(key)
            .ok_or_else(|| CoreError::invariant("erase target vanished"))?;
        if !node.delete_pending {
            self.live -= 1;
        }
        Ok(node)
    }

    /// Erases every delete-pending node regardless of who still cares.
    pub(crate) fn purge_deleted(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| !node.delete_pending);
        before - self.nodes.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Node)> {
        self.nodes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&Vec<u8>, &mut Node)> {
        self.nodes.iter_mut()
    }

    /// Keys of the nodes selected by `filter`, in key order.
    pub(crate) fn keys_where(&self, mut filter: impl FnMut(&Node) -> bool) -> Vec<Vec<u8>> {
        self.nodes
            .iter()
            .filter(|&(_, node)| filter(node))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Recounts live nodes from scratch.
    pub(crate) fn count_live(&self) -> usize {
        self.nodes.values().filter(|n| !n.delete_pending).count()
    }
}
