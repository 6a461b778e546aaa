//! Table registry.
//!
//! Tables are kept in a map ordered by name, which gives both lookup and the
//! deterministic enumeration used by the debug dump and by full resync.

use crate::error::{CoreError, CoreResult};
use crate::table::Table;
use crate::types::{TableKind, TableName, TableSpec};
use std::collections::BTreeMap;
use tracing::info;

/// Registry-wide counters used for capacity planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Number of tables.
    pub tables: usize,
    /// Number of AVL tables.
    pub avl_tables: usize,
    /// Number of Record tables.
    pub record_tables: usize,
    /// Record bytes reserved by all tables at full capacity.
    pub capacity_bytes: usize,
}

impl RegistryStats {
    fn add(&mut self, table: &Table) {
        self.tables += 1;
        match table.kind() {
            TableKind::Avl => self.avl_tables += 1,
            TableKind::Record => self.record_tables += 1,
        }
        self.capacity_bytes += table.capacity_bytes();
    }

    fn remove(&mut self, table: &Table) {
        self.tables -= 1;
        match table.kind() {
            TableKind::Avl => self.avl_tables -= 1,
            TableKind::Record => self.record_tables -= 1,
        }
        self.capacity_bytes -= table.capacity_bytes();
    }
}

/// Maps table names to tables.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: BTreeMap<TableName, Table>,
    stats: RegistryStats,
}

impl TableRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table.
    pub fn create(&mut self, spec: TableSpec) -> CoreResult<&mut Table> {
        let name = spec.name;
        if self.tables.contains_key(&name) {
            return Err(CoreError::duplicate_name(name.as_str()));
        }
        let table = Table::new(spec)?;
        self.stats.add(&table);
        info!(
            table = %name,
            kind = table.kind().as_str(),
            record_size = table.record_size(),
            capacity = table.spec().max_records,
            "table created"
        );
        Ok(self.tables.entry(name).or_insert(table))
    }

    /// Looks up a table.
    pub fn find(&self, name: &TableName) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Looks up a table for modification.
    pub fn find_mut(&mut self, name: &TableName) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Looks up a table or fails with `NoTable`.
    pub fn get_mut(&mut self, name: &TableName) -> CoreResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| CoreError::no_table(name.as_str()))
    }

    /// Removes a table and hands it back to the caller.
    pub fn delete(&mut self, name: &TableName) -> CoreResult<Table> {
        let table = self
            .tables
            .remove(name)
            .ok_or_else(|| CoreError::no_table(name.as_str()))?;
        self.stats.remove(&table);
        info!(table = %name, "table deleted");
        Ok(table)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns true if no tables exist.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Registry counters.
    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    /// Iterates over tables in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Iterates mutably over tables in name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Table> {
        self.tables.values_mut()
    }

    /// Table names in order.
    pub fn names(&self) -> Vec<TableName> {
        self.tables.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TableName {
        TableName::new(s).unwrap()
    }

    #[test]
    fn create_find_delete() {
        let mut registry = TableRegistry::new();
        registry
            .create(TableSpec::avl(name("vlan"), 16, 4, 8))
            .unwrap();
        registry.create(TableSpec::record(name("system"), 32)).unwrap();

        assert!(registry.find(&name("vlan")).is_some());
        assert!(registry.find(&name("port")).is_none());

        let stats = registry.stats();
        assert_eq!(stats.tables, 2);
        assert_eq!(stats.avl_tables, 1);
        assert_eq!(stats.record_tables, 1);
        assert_eq!(stats.capacity_bytes, 16 * 8 + 32);

        let table = registry.delete(&name("vlan")).unwrap();
        assert_eq!(table.name().as_str(), "vlan");
        assert_eq!(registry.stats().tables, 1);
        assert_eq!(registry.stats().capacity_bytes, 32);

        assert!(matches!(
            registry.delete(&name("vlan")),
            Err(CoreError::NoTable { .. })
        ));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = TableRegistry::new();
        registry.create(TableSpec::record(name("T"), 4)).unwrap();
        assert!(matches!(
            registry.create(TableSpec::record(name("T"), 8)),
            Err(CoreError::DuplicateName { .. })
        ));
        assert_eq!(registry.stats().tables, 1);
    }

    #[test]
    fn enumeration_is_sorted() {
        let mut registry = TableRegistry::new();
        for n in ["route", "acl", "port", "lag"] {
            registry.create(TableSpec::record(name(n), 4)).unwrap();
        }
        let names: Vec<_> = registry.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, ["acl", "lag", "port", "route"]);
    }
}
