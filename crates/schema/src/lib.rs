//! Sluice schema engine: parses and renders table DDL, diffs documents against
//! tables and packs schema-less fields into fallback columns.

#![forbid(unsafe_code)]

pub mod ddl;
pub mod diff;
pub mod pack;
pub mod parser;
pub mod reconcile;

pub use ddl::{alter_statements, create_statement, insert_statement, table_from_document};
pub use diff::{drop_type_mismatches, prune_to_schema, unknown_fields};
pub use pack::{pack, Packed, PackedAttribute, PackError};
pub use parser::{parse_create_table, parse_type_string, ParseError};
pub use reconcile::{reconcile, AlwaysPromote, ColumnPromoter, NeverPromote, Reconciled, ReconcileError};
