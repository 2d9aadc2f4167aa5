//! One document against one table: the row to insert, the ALTERs it needs and
//! the leaves that had to be dropped.

use serde_json::Value;
use sluice_core::{Column, Document, Table, Type, OTHERS_FIELD};
use thiserror::Error;
use tracing::debug;

use crate::ddl::{alter_statements, promoted_columns};
use crate::diff::{drop_type_mismatches, prune_to_schema, unknown_fields};
use crate::pack::{pack, PackError};

/// Decides whether a new top-level field becomes a real column.
pub trait ColumnPromoter: Send + Sync {
    fn should_promote(&self, table: &Table, field: &str) -> bool;

    /// Called once for every document reconciled against `table`.
    fn observe(&self, _table: &Table) {}
}

pub struct AlwaysPromote;

impl ColumnPromoter for AlwaysPromote {
    fn should_promote(&self, _table: &Table, _field: &str) -> bool {
        true
    }
}

pub struct NeverPromote;

impl ColumnPromoter for NeverPromote {
    fn should_promote(&self, _table: &Table, _field: &str) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Pack(#[from] PackError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub row: Document,
    /// Must run against the store before `new_columns` are published.
    pub alter_statements: Vec<String>,
    pub new_columns: Vec<Column>,
    pub dropped: Document,
}

pub fn reconcile(
    table: &Table,
    doc: Document,
    promoter: &dyn ColumnPromoter,
) -> Result<Reconciled, ReconcileError> {
    promoter.observe(table);
    let (kept, dropped) = drop_type_mismatches(doc, table);
    let found = unknown_fields(table, &kept);

    // Only fields absent at the top level are promoted; unknowns nested in an
    // existing record column stay on the attribute/others path.
    let mut promoted = Document::new();
    let mut unknown = Document::new();
    for (k, v) in found {
        let promote = !table.config.has_others
            && table.column(&k).is_none()
            && Type::infer_column(&v).is_some()
            && promoter.should_promote(table, &k);
        if promote {
            promoted.insert(k, v);
        } else {
            unknown.insert(k, v);
        }
    }
    let alter_statements = alter_statements(table, &promoted);
    let new_columns = promoted_columns(&promoted);
    if !new_columns.is_empty() {
        debug!(table = %table.name, columns = new_columns.len(), "promoting new fields to columns");
    }

    let packed = pack(&unknown, &table.config)?;
    let mut row = Document::new();
    for attr in packed.attributes {
        let keys = attr.keys.into_iter().map(Value::String).collect();
        row.insert(attr.attribute.keys_column, Value::Array(keys));
        row.insert(attr.attribute.values_column, Value::Array(attr.values));
    }
    if !packed.others.is_empty() {
        row.insert(OTHERS_FIELD.to_string(), Value::Object(packed.others));
    }
    let pruned = if new_columns.is_empty() {
        prune_to_schema(table, &kept)
    } else {
        let extended = table.clone().with_columns(new_columns.iter().cloned());
        prune_to_schema(&extended, &kept)
    };
    row.extend(pruned);

    Ok(Reconciled { row, alter_statements, new_columns, dropped })
}
