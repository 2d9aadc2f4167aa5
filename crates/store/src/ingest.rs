//! Write path: resolves or creates the target table, reconciles each document
//! against it and inserts the resulting rows.

use std::sync::{Arc, Mutex, MutexGuard};

use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sluice_core::document::{encode_field_names, leaf_paths};
use sluice_core::{Column, Document, SluiceConfig, Table, VirtualTableManifest};
use sluice_persist::JsonStore;
use sluice_schema::{
    create_statement, insert_statement, reconcile, table_from_document, ColumnPromoter,
    ReconcileError, Reconciled,
};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::connector::Connector;
use crate::discovery::{COMMON_TABLE, INDEX_NAME_COLUMN, MANIFEST_BUCKET};
use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("index {0} is disabled")]
    Disabled(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("store: {0:#}")]
    Store(anyhow::Error),
    #[error("manifest store: {0:#}")]
    Manifest(anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Physical table the rows went to.
    pub table: String,
    pub rows: usize,
    /// This call created the table.
    pub created: bool,
    pub alters: usize,
    pub dropped: usize,
}

pub struct IngestProcessor {
    connector: Arc<dyn Connector>,
    registry: Registry,
    config: SluiceConfig,
    manifests: Arc<dyn JsonStore>,
    promoter: Arc<dyn ColumnPromoter>,
}

impl IngestProcessor {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Registry,
        config: SluiceConfig,
        manifests: Arc<dyn JsonStore>,
        promoter: Arc<dyn ColumnPromoter>,
    ) -> Self {
        Self { connector, registry, config, manifests, promoter }
    }

    pub fn resolve_table(&self, name: &str) -> Option<Arc<Table>> {
        self.registry.get(name)
    }

    pub fn reconcile(&self, table: &Table, doc: Document) -> Result<Reconciled, IngestError> {
        Ok(reconcile(table, doc, self.promoter.as_ref())?)
    }

    /// Issues `CREATE TABLE IF NOT EXISTS` unless the table is known to exist.
    /// Returns true only for the single caller that flipped the table to created.
    pub async fn ensure_created(&self, table: &Table) -> Result<bool, IngestError> {
        if table.is_created() || table.is_virtual {
            return Ok(false);
        }
        self.connector.exec(&create_statement(table), &[]).await.map_err(IngestError::Store)?;
        let flipped = table.mark_created();
        if flipped {
            info!(table = %table.name, "table created");
        }
        Ok(flipped)
    }

    pub async fn ingest(&self, index: &str, docs: Vec<Document>) -> Result<IngestReport, IngestError> {
        let idx = self.config.index(index);
        if idx.is_some_and(|i| i.disabled) {
            return Err(IngestError::Disabled(index.to_string()));
        }
        let common = idx.is_some_and(|i| i.use_common_table);
        let target = if common { COMMON_TABLE } else { index };

        let docs: Vec<Document> = docs
            .into_iter()
            .map(|d| {
                let mut d = encode_field_names(d);
                if let Some(i) = idx {
                    d.retain(|k, _| !i.ignores(k));
                }
                if common {
                    d.insert(INDEX_NAME_COLUMN.to_string(), Value::String(index.to_string()));
                }
                d
            })
            .collect();
        let Some(first) = docs.first() else {
            return Ok(IngestReport { table: target.to_string(), ..IngestReport::default() });
        };

        let mut table = match self.registry.get(target) {
            Some(t) => t,
            None => self.registry.insert_if_absent(self.new_table(target, first)),
        };
        let created = self.ensure_created(&table).await?;

        let mut report = IngestReport { table: target.to_string(), created, ..IngestReport::default() };
        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            let out = self.reconcile(&table, doc)?;
            report.dropped += leaf_paths(&out.dropped).len();
            if !out.alter_statements.is_empty() {
                for stmt in &out.alter_statements {
                    self.connector.exec(stmt, &[]).await.map_err(IngestError::Store)?;
                }
                report.alters += out.alter_statements.len();
                table = self.registry.extend_columns(&table, &out.new_columns);
            }
            rows.push(out.row);
        }

        self.connector.exec(&insert_statement(&table, &rows), &[]).await.map_err(IngestError::Store)?;
        report.rows = rows.len();
        if common {
            self.store_manifest(index, &table, &rows)?;
        }

        counter!("ingest_docs_total", report.rows as u64);
        counter!("ingest_dropped_fields_total", report.dropped as u64);
        counter!("ingest_alter_total", report.alters as u64);
        debug!(
            index,
            table = %report.table,
            rows = report.rows,
            alters = report.alters,
            dropped = report.dropped,
            "ingested"
        );
        Ok(report)
    }

    fn new_table(&self, name: &str, first: &Document) -> Table {
        let mut table = table_from_document(name, first, self.config.table_defaults());
        table.database = self.config.database.clone();
        table.cluster = self.config.cluster.clone().unwrap_or_default();
        table
    }

    /// Records the columns `index` uses in the common table and publishes its virtual table.
    fn store_manifest(&self, index: &str, common: &Table, rows: &[Document]) -> Result<(), IngestError> {
        let previous: Option<VirtualTableManifest> = self
            .manifests
            .get(MANIFEST_BUCKET, index)
            .map_err(IngestError::Manifest)?
            .and_then(|v| serde_json::from_value(v).ok());
        let mut names: Vec<String> = previous
            .filter(VirtualTableManifest::is_current)
            .map(|m| m.column_names().map(str::to_string).collect())
            .unwrap_or_default();
        for key in rows.iter().flat_map(|r| r.keys()) {
            if key != INDEX_NAME_COLUMN && common.column(key).is_some() && !names.contains(key) {
                names.push(key.clone());
            }
        }

        let manifest = VirtualTableManifest::new(names.iter().cloned());
        let body = serde_json::to_value(&manifest).map_err(|e| IngestError::Manifest(e.into()))?;
        self.manifests.put(MANIFEST_BUCKET, index, &body).map_err(IngestError::Manifest)?;

        let columns: Vec<Column> = names.iter().filter_map(|n| common.column(n).cloned()).collect();
        let mut vt = Table::new(index).with_config(common.config.clone()).with_columns(columns);
        vt.database = common.database.clone();
        vt.cluster = common.cluster.clone();
        vt.is_virtual = true;
        vt.mark_created();
        self.registry.upsert(vt);
        Ok(())
    }
}

/// Always promote below this many columns.
const ALWAYS_BELOW: usize = 100;
/// Never promote at or above this many columns.
const NEVER_FROM: usize = 1000;
/// In between, a field must have been seen this many times within one window.
const MIN_SIGHTINGS: u32 = 10;
/// Sightings are forgotten after this many documents.
const WINDOW: u32 = 100;

#[derive(Default)]
struct Sightings {
    docs: u32,
    fields: FxHashMap<(String, String), u32>,
}

/// Promotes freely on narrow tables and the common table, and only recurring fields on wide ones.
#[derive(Default)]
pub struct FrequencyPromoter {
    window: Mutex<Sightings>,
}

impl FrequencyPromoter {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self) -> MutexGuard<'_, Sightings> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ColumnPromoter for FrequencyPromoter {
    fn should_promote(&self, table: &Table, field: &str) -> bool {
        let width = table.columns.len();
        if width < ALWAYS_BELOW || table.name == COMMON_TABLE {
            return true;
        }
        if width >= NEVER_FROM {
            return false;
        }
        let mut window = self.window();
        let count = window.fields.entry((table.name.clone(), field.to_string())).or_insert(0);
        *count += 1;
        *count >= MIN_SIGHTINGS
    }

    fn observe(&self, _table: &Table) {
        let mut window = self.window();
        window.docs += 1;
        if window.docs >= WINDOW {
            trace!(fields = window.fields.len(), "resetting field sightings");
            *window = Sightings::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{BaseKind, Type};

    fn wide(n: usize) -> Table {
        named("wide", n)
    }

    fn named(name: &str, n: usize) -> Table {
        let columns = (0..n).map(|i| Column::new(format!("c{i}"), Type::base(BaseKind::String)));
        Table::new(name).with_columns(columns)
    }

    #[test]
    fn narrow_tables_always_promote() {
        let p = FrequencyPromoter::new();
        assert!(p.should_promote(&wide(3), "x"));
    }

    #[test]
    fn very_wide_tables_never_promote() {
        let p = FrequencyPromoter::new();
        let t = wide(NEVER_FROM);
        assert!((0..20).all(|_| !p.should_promote(&t, "x")));
    }

    #[test]
    fn medium_tables_promote_recurring_fields() {
        let p = FrequencyPromoter::new();
        let t = wide(200);
        for _ in 1..MIN_SIGHTINGS {
            assert!(!p.should_promote(&t, "x"));
        }
        assert!(p.should_promote(&t, "x"));
        assert!(!p.should_promote(&t, "y"));
    }

    #[test]
    fn common_table_always_promotes() {
        let p = FrequencyPromoter::new();
        assert!(p.should_promote(&named(COMMON_TABLE, NEVER_FROM + 5), "x"));
        assert!(p.should_promote(&named(COMMON_TABLE, 200), "y"));
    }

    #[test]
    fn sightings_reset_every_window() {
        let p = FrequencyPromoter::new();
        let t = wide(200);
        for _ in 1..MIN_SIGHTINGS {
            assert!(!p.should_promote(&t, "x"));
        }
        for _ in 0..WINDOW {
            p.observe(&t);
        }
        // The nine earlier sightings were forgotten.
        assert!(!p.should_promote(&t, "x"));
        assert_eq!(p.window().fields.get(&("wide".to_string(), "x".to_string())), Some(&1));
    }
}
