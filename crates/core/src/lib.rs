//! Sluice core types: the column type algebra, the in-memory table model,
//! decoded documents and the operator configuration consumed by discovery and ingest.

#![forbid(unsafe_code)]

pub mod config;
pub mod document;
pub mod manifest;
pub mod table;
pub mod types;

pub use config::{ConfigError, FieldOverride, IndexConfig, IngestDefaults, SluiceConfig};
pub use document::{Document, DocumentError};
pub use manifest::{ManifestColumn, VirtualTableManifest, MANIFEST_VERSION};
pub use table::{Attribute, Column, Table, TableConfig, TableSnapshot};
pub use types::{BaseKind, BaseType, Field, InferredKind, ScalarKind, Type};

/// Name of the synthetic timestamp column.
pub const TIMESTAMP_FIELD: &str = "@timestamp";
/// Name of the catch-all JSON column.
pub const OTHERS_FIELD: &str = "others";
/// Joins path segments of nested fields that are stored flat (attributes, encoded dotted names).
pub const NESTED_SEPARATOR: &str = "::";

pub mod prelude {
    pub use super::{
        Attribute, BaseKind, Column, Document, ScalarKind, SluiceConfig, Table, TableConfig,
        TableSnapshot, Type, NESTED_SEPARATOR, OTHERS_FIELD, TIMESTAMP_FIELD,
    };
}
