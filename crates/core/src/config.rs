//! Operator configuration: which tables are enabled, per-index overrides and
//! the fallback policy applied to tables created on first sight.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table::{Attribute, TableConfig};
use crate::types::quote_ident;
use crate::TIMESTAMP_FIELD;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("database name must not be empty")]
    EmptyDatabase,
    #[error("reload interval must be at least one second")]
    ReloadInterval,
    #[error("index {index}: override for {field} sets neither a type nor ignored")]
    EmptyOverride { index: String, field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub database: String,
    pub cluster: Option<String>,
    /// Explicit allow-list. Absent means auto-discovery of every table.
    pub index_config: Option<BTreeMap<String, IndexConfig>>,
    /// Use the store's declared primary timestamp instead of the primary-key heuristic.
    pub native_primary_timestamp: bool,
    pub reload_interval_secs: u64,
    pub ingest: IngestDefaults,
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            database: "default".to_string(),
            cluster: None,
            index_config: None,
            native_primary_timestamp: false,
            reload_interval_secs: 60,
            ingest: IngestDefaults::default(),
        }
    }
}

impl SluiceConfig {
    pub fn auto_discovery(&self) -> bool {
        self.index_config.is_none()
    }

    pub fn index(&self, name: &str) -> Option<&IndexConfig> {
        self.index_config.as_ref().and_then(|m| m.get(name))
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }
        if self.reload_interval_secs == 0 {
            return Err(ConfigError::ReloadInterval);
        }
        for (index, cfg) in self.index_config.iter().flatten() {
            for (field, o) in &cfg.schema_overrides {
                if o.ty.is_none() && !o.ignored {
                    return Err(ConfigError::EmptyOverride { index: index.clone(), field: field.clone() });
                }
            }
        }
        Ok(())
    }

    /// Table configuration for an index created on first sight.
    pub fn table_defaults(&self) -> TableConfig {
        self.ingest.table_config()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub disabled: bool,
    pub ignored_fields: Vec<String>,
    pub schema_overrides: BTreeMap<String, FieldOverride>,
    /// Store documents in the shared physical table behind a virtual table.
    pub use_common_table: bool,
    pub full_text_fields: Vec<String>,
}

impl IndexConfig {
    pub fn ignores(&self, field: &str) -> bool {
        self.ignored_fields.iter().any(|f| f == field)
            || self.schema_overrides.get(field).is_some_and(|o| o.ignored)
    }

    pub fn type_override(&self, field: &str) -> Option<&str> {
        self.schema_overrides.get(field).and_then(|o| o.ty.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldOverride {
    #[serde(rename = "type")]
    pub ty: Option<String>,
    pub ignored: bool,
}

/// Fallback policy for tables created from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestDefaults {
    pub engine: String,
    pub order_by: Option<String>,
    pub timestamp: bool,
    pub timestamp_defaults_now: bool,
    pub others: bool,
    pub attributes: bool,
    pub cast_unsupported_attr_value_types_to_string: bool,
    pub prefer_casting_to_others: bool,
}

impl Default for IngestDefaults {
    fn default() -> Self {
        Self {
            engine: "MergeTree".to_string(),
            order_by: None,
            timestamp: true,
            timestamp_defaults_now: true,
            others: false,
            attributes: true,
            cast_unsupported_attr_value_types_to_string: true,
            prefer_casting_to_others: false,
        }
    }
}

impl IngestDefaults {
    pub fn table_config(&self) -> TableConfig {
        let order_by = match (&self.order_by, self.timestamp) {
            (Some(o), _) => o.clone(),
            (None, true) => format!("({})", quote_ident(TIMESTAMP_FIELD)),
            (None, false) => "tuple()".to_string(),
        };
        TableConfig {
            engine: self.engine.clone(),
            order_by,
            has_timestamp: self.timestamp,
            timestamp_defaults_now: self.timestamp_defaults_now,
            has_others: self.others,
            attributes: if self.attributes { Attribute::defaults() } else { Vec::new() },
            cast_unsupported_attr_value_types_to_string: self.cast_unsupported_attr_value_types_to_string,
            prefer_casting_to_others: self.prefer_casting_to_others,
            ..TableConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_auto_discover() {
        let cfg = SluiceConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.auto_discovery());
        let tc = cfg.table_defaults();
        assert_eq!(tc.order_by, "(\"@timestamp\")");
        assert_eq!(tc.attributes.len(), 4);
    }

    #[test]
    fn rejects_empty_override() {
        let mut idx = IndexConfig::default();
        idx.schema_overrides.insert("f".into(), FieldOverride::default());
        let cfg = SluiceConfig {
            index_config: Some(BTreeMap::from([("logs".to_string(), idx)])),
            ..SluiceConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::EmptyOverride { index: "logs".into(), field: "f".into() })
        );
    }

    #[test]
    fn ignores_listed_and_overridden_fields() {
        let mut idx = IndexConfig { ignored_fields: vec!["a".into()], ..IndexConfig::default() };
        idx.schema_overrides.insert("b".into(), FieldOverride { ty: None, ignored: true });
        assert!(idx.ignores("a"));
        assert!(idx.ignores("b"));
        assert!(!idx.ignores("c"));
    }
}
