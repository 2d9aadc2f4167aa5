//! Shared, atomically swapped table snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use sluice_core::{Column, Table, TableSnapshot};

/// Holds the current [`TableSnapshot`]. Cloning shares the same snapshot slot.
/// Readers never block; every change publishes a new snapshot.
#[derive(Clone, Default)]
pub struct Registry {
    snap: Arc<ArcSwap<TableSnapshot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<TableSnapshot> {
        self.snap.load_full()
    }

    pub fn publish(&self, snapshot: TableSnapshot) {
        self.snap.store(Arc::new(snapshot));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.snap.load().get(name).cloned()
    }

    /// Inserts `table` unless one with that name exists; returns whichever won.
    pub fn insert_if_absent(&self, table: Table) -> Arc<Table> {
        let candidate = Arc::new(table);
        self.snap.rcu(|cur| {
            if cur.contains(&candidate.name) {
                Arc::clone(cur)
            } else {
                Arc::new(cur.with(Arc::clone(&candidate)))
            }
        });
        self.get(&candidate.name).unwrap_or(candidate)
    }

    /// Adds or replaces a table.
    pub fn upsert(&self, table: Table) -> Arc<Table> {
        let table = Arc::new(table);
        self.snap.rcu(|cur| Arc::new(cur.with(Arc::clone(&table))));
        table
    }

    /// Publishes `base` (or its current version) extended with `columns`.
    /// Only call after the matching ALTERs ran against the store.
    pub fn extend_columns(&self, base: &Table, columns: &[Column]) -> Arc<Table> {
        self.snap.rcu(|cur| {
            let mut next = cur.get(&base.name).map(|t| Table::clone(t)).unwrap_or_else(|| base.clone());
            for col in columns {
                next.columns.entry(col.name.clone()).or_insert_with(|| col.clone());
            }
            Arc::new(cur.with(Arc::new(next)))
        });
        match self.get(&base.name) {
            Some(t) => t,
            None => Arc::new(base.clone().with_columns(columns.iter().cloned())),
        }
    }

    /// Tables whose name matches `pattern`, where `*` matches any run of characters.
    pub fn resolve(&self, pattern: &str) -> Vec<Arc<Table>> {
        let snap = self.current();
        if !pattern.contains('*') {
            return snap.get(pattern).cloned().into_iter().collect();
        }
        let body = pattern.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
        match Regex::new(&format!("^{body}$")) {
            Ok(re) => snap.tables().filter(|t| re.is_match(&t.name)).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}
