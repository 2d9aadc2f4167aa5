//! In-memory table model and the immutable snapshot of all known tables.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{integral, quote_ident, BaseKind, InferredKind, ScalarKind, Type};
use crate::{OTHERS_FIELD, TIMESTAMP_FIELD};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: Type,
    /// Raw trailing modifiers (`DEFAULT ...`, `CODEC(...)`, `TTL ...`), empty when none.
    #[serde(default)]
    pub modifiers: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub full_text: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self { name: name.into(), ty, modifiers: String::new(), comment: String::new(), full_text: false }
    }
}

/// One typed key/value fallback array pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub keys_column: String,
    pub values_column: String,
    pub value_type: Type,
}

impl Attribute {
    pub fn new(keys_column: impl Into<String>, values_column: impl Into<String>, value_type: Type) -> Self {
        Self { keys_column: keys_column.into(), values_column: values_column.into(), value_type }
    }

    pub fn default_string() -> Self {
        Self::new("attributes_string_key", "attributes_string_value", Type::base(BaseKind::String))
    }

    pub fn default_int64() -> Self {
        Self::new("attributes_int64_key", "attributes_int64_value", Type::base(BaseKind::Int64))
    }

    pub fn default_float64() -> Self {
        Self::new("attributes_float64_key", "attributes_float64_value", Type::base(BaseKind::Float64))
    }

    pub fn default_bool() -> Self {
        Self::new("attributes_bool_key", "attributes_bool_value", Type::base(BaseKind::Bool))
    }

    /// The four known shapes, in routing order.
    pub fn defaults() -> Vec<Attribute> {
        vec![Self::default_string(), Self::default_int64(), Self::default_float64(), Self::default_bool()]
    }

    pub fn keys_type(&self) -> Type {
        Type::array(Type::base(BaseKind::String))
    }

    pub fn values_type(&self) -> Type {
        Type::array(self.value_type.clone())
    }

    pub fn is_string(&self) -> bool {
        self.value_type.base_kind().and_then(BaseKind::scalar_kind) == Some(ScalarKind::String)
    }

    /// Whether a leaf value routes to this attribute without casting. Non-negative integers
    /// also fit a signed attribute.
    pub fn matches(&self, value: &Value) -> bool {
        let Some(want) = self.value_type.base_kind().and_then(BaseKind::scalar_kind) else {
            return false;
        };
        let InferredKind::Scalar(got) = InferredKind::infer(value) else { return false };
        match (want, got) {
            (ScalarKind::Int64, ScalarKind::UInt64) => {
                matches!(value, Value::Number(n) if integral(n).is_some_and(|i| i <= i64::MAX as i128))
            }
            (want, got) => want == got,
        }
    }
}

/// Storage and fallback policy of one table. Immutable once the table is published.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub engine: String,
    pub order_by: String,
    pub partition_by: String,
    pub primary_key: String,
    pub ttl: String,
    pub settings: String,
    pub has_timestamp: bool,
    pub timestamp_defaults_now: bool,
    pub has_others: bool,
    pub attributes: Vec<Attribute>,
    pub cast_unsupported_attr_value_types_to_string: bool,
    pub prefer_casting_to_others: bool,
}

impl TableConfig {
    /// Timestamped MergeTree with the four default attribute pairs.
    pub fn default_four_attrs() -> Self {
        Self {
            engine: "MergeTree".to_string(),
            order_by: format!("({})", quote_ident(TIMESTAMP_FIELD)),
            has_timestamp: true,
            timestamp_defaults_now: true,
            attributes: Attribute::defaults(),
            cast_unsupported_attr_value_types_to_string: true,
            ..Self::default()
        }
    }

    /// Timestamped MergeTree that only ever stores declared fields.
    pub fn only_schema_fields() -> Self {
        Self {
            engine: "MergeTree".to_string(),
            order_by: format!("({})", quote_ident(TIMESTAMP_FIELD)),
            has_timestamp: true,
            timestamp_defaults_now: true,
            ..Self::default()
        }
    }

    /// No timestamp, no attributes; unknown fields go to `others`.
    pub fn no_attrs() -> Self {
        Self {
            engine: "MergeTree".to_string(),
            order_by: "tuple()".to_string(),
            has_others: true,
            ..Self::default()
        }
    }

    /// Routing policy of a table found in the catalog. Storage settings come from its DDL,
    /// which does not carry the fallback flags.
    pub fn discovered() -> Self {
        Self {
            cast_unsupported_attr_value_types_to_string: true,
            prefer_casting_to_others: true,
            ..Self::default()
        }
    }

    /// Keeps storage and columns, takes the fallback flags from `policy`.
    pub fn with_policy(mut self, policy: &TableConfig) -> Self {
        self.cast_unsupported_attr_value_types_to_string =
            policy.cast_unsupported_attr_value_types_to_string;
        self.prefer_casting_to_others = policy.prefer_casting_to_others;
        self
    }

    pub fn string_attribute(&self) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is_string())
    }
}

/// In-memory model of one store-side relation.
#[derive(Debug)]
pub struct Table {
    pub name: String,
    pub database: String,
    pub cluster: String,
    pub columns: IndexMap<String, Column>,
    pub config: TableConfig,
    created: AtomicBool,
    pub comment: String,
    pub raw_ddl: String,
    /// Raw `INDEX ...` definitions.
    pub indexes: Vec<String>,
    pub timestamp_field: Option<String>,
    pub is_virtual: bool,
}

impl Clone for Table {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            database: self.database.clone(),
            cluster: self.cluster.clone(),
            columns: self.columns.clone(),
            config: self.config.clone(),
            created: AtomicBool::new(self.is_created()),
            comment: self.comment.clone(),
            raw_ddl: self.raw_ddl.clone(),
            indexes: self.indexes.clone(),
            timestamp_field: self.timestamp_field.clone(),
            is_virtual: self.is_virtual,
        }
    }
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: String::new(),
            cluster: String::new(),
            columns: IndexMap::new(),
            config: TableConfig::default(),
            created: AtomicBool::new(false),
            comment: String::new(),
            raw_ddl: String::new(),
            indexes: Vec::new(),
            timestamp_field: None,
            is_virtual: false,
        }
    }

    pub fn with_config(mut self, config: TableConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_columns(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        for col in columns {
            self.columns.insert(col.name.clone(), col);
        }
        self
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    /// Flips `created` from false to true. Returns true only for the caller that flipped it.
    pub fn mark_created(&self) -> bool {
        self.created.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// `"db"."name"`, or just `"name"` without a database.
    pub fn qualified_name(&self) -> String {
        if self.database.is_empty() {
            quote_ident(&self.name)
        } else {
            format!("{}.{}", quote_ident(&self.database), quote_ident(&self.name))
        }
    }

    /// Enables the fallback features whose columns the table already declares:
    /// known attribute pairs, `others` and the timestamp column.
    pub fn derive_config_from_columns(&mut self) {
        for attr in Attribute::defaults() {
            let present = self.columns.contains_key(&attr.keys_column)
                && self.columns.contains_key(&attr.values_column);
            let configured = self.config.attributes.iter().any(|a| a.keys_column == attr.keys_column);
            if present && !configured {
                self.config.attributes.push(attr);
            }
        }
        let others = self.columns.get(OTHERS_FIELD);
        if others.is_some_and(|c| matches!(c.ty.base_kind(), Some(BaseKind::Json))) {
            self.config.has_others = true;
        }
        if self.columns.contains_key(TIMESTAMP_FIELD) {
            self.config.has_timestamp = true;
        }
    }
}

/// Immutable name -> table map; replaced wholesale, never mutated once shared.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    tables: BTreeMap<String, Arc<Table>>,
}

impl TableSnapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<Table>> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.values()
    }

    /// Copy of this snapshot with `table` added or replaced.
    pub fn with(&self, table: Arc<Table>) -> TableSnapshot {
        let mut tables = self.tables.clone();
        tables.insert(table.name.clone(), table);
        TableSnapshot { tables }
    }
}

impl FromIterator<Table> for TableSnapshot {
    fn from_iter<I: IntoIterator<Item = Table>>(iter: I) -> Self {
        Self { tables: iter.into_iter().map(|t| (t.name.clone(), Arc::new(t))).collect() }
    }
}

impl FromIterator<Arc<Table>> for TableSnapshot {
    fn from_iter<I: IntoIterator<Item = Arc<Table>>>(iter: I) -> Self {
        Self { tables: iter.into_iter().map(|t| (t.name.clone(), t)).collect() }
    }
}
