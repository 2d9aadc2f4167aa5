//! Renders CREATE / ALTER / INSERT statements.

use sluice_core::types::{quote_ident, tabs};
use sluice_core::{BaseKind, Column, Document, Table, TableConfig, Type, OTHERS_FIELD, TIMESTAMP_FIELD};

/// Comment stamped on tables created from a document.
pub const CREATED_BY: &str = "created by sluice";

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn column_line(col: &Column, indent: usize) -> String {
    let ty = col.ty.create_table_string(indent);
    let mut line = format!("{}{} {}", tabs(indent), quote_ident(&col.name), ty);
    if !col.modifiers.is_empty() {
        line.push(' ');
        line.push_str(&col.modifiers);
    }
    if !col.comment.is_empty() {
        line.push_str(&format!(" COMMENT '{}'", escape_literal(&col.comment)));
    }
    line
}

fn synthetic_line(name: &str, ty: &str) -> String {
    format!("{}{} {}", tabs(1), quote_ident(name), ty)
}

fn on_cluster(table: &Table) -> String {
    if table.cluster.is_empty() {
        String::new()
    } else {
        format!(" ON CLUSTER {}", quote_ident(&table.cluster))
    }
}

pub fn create_statement(table: &Table) -> String {
    let cfg = &table.config;
    let mut lines: Vec<String> = table.columns.values().map(|c| column_line(c, 1)).collect();
    let declared = |name: &str| table.columns.contains_key(name);
    if cfg.has_others && !declared(OTHERS_FIELD) {
        lines.push(synthetic_line(OTHERS_FIELD, "JSON"));
    }
    if cfg.has_timestamp && !declared(TIMESTAMP_FIELD) {
        let default = if cfg.timestamp_defaults_now { " DEFAULT now64()" } else { "" };
        lines.push(format!("{}{default}", synthetic_line(TIMESTAMP_FIELD, "DateTime64(3)")));
    }
    for attr in &cfg.attributes {
        if !declared(&attr.keys_column) {
            lines.push(synthetic_line(&attr.keys_column, &attr.keys_type().to_string()));
        }
        if !declared(&attr.values_column) {
            lines.push(synthetic_line(&attr.values_column, &attr.values_type().to_string()));
        }
    }
    lines.extend(table.indexes.iter().map(|idx| format!("{}{idx}", tabs(1))));

    let mut out = format!("CREATE TABLE IF NOT EXISTS {}{}\n(\n", table.qualified_name(), on_cluster(table));
    out.push_str(&lines.join(",\n"));
    out.push_str("\n)");
    let clauses: [(&str, &str); 6] = [
        ("ENGINE = ", &cfg.engine),
        ("ORDER BY ", &cfg.order_by),
        ("PARTITION BY ", &cfg.partition_by),
        ("PRIMARY KEY ", &cfg.primary_key),
        ("TTL ", &cfg.ttl),
        ("SETTINGS ", &cfg.settings),
    ];
    for (keyword, value) in clauses {
        if !value.is_empty() {
            out.push('\n');
            out.push_str(keyword);
            out.push_str(value);
        }
    }
    if !table.comment.is_empty() {
        out.push_str(&format!("\nCOMMENT '{}'", escape_literal(&table.comment)));
    }
    out
}

/// One idempotent `ADD COLUMN` per new top-level field whose type can be inferred.
pub fn alter_statements(table: &Table, new_fields: &Document) -> Vec<String> {
    new_fields
        .iter()
        .filter_map(|(name, value)| {
            Type::infer_column(value).map(|ty| {
                format!(
                    "ALTER TABLE {}{} ADD COLUMN IF NOT EXISTS {} {}",
                    table.qualified_name(),
                    on_cluster(table),
                    quote_ident(name),
                    ty
                )
            })
        })
        .collect()
}

/// Columns that `alter_statements` adds for the same fields.
pub fn promoted_columns(new_fields: &Document) -> Vec<Column> {
    new_fields
        .iter()
        .filter_map(|(name, value)| Type::infer_column(value).map(|ty| Column::new(name.clone(), ty)))
        .collect()
}

/// An uncreated table for an index first seen with `doc`. Scalars are nullable;
/// `body` and `severity` get skip-index hints.
pub fn table_from_document(name: &str, doc: &Document, config: TableConfig) -> Table {
    let mut table = Table::new(name).with_config(config);
    for (field, value) in doc {
        if table.config.has_timestamp && field == TIMESTAMP_FIELD {
            continue;
        }
        if table.config.has_others && field == OTHERS_FIELD {
            continue;
        }
        if let Some(ty) = Type::infer_column(value) {
            table.columns.insert(field.clone(), Column::new(field.clone(), ty.into_nullable()));
        }
    }
    if is_string_column(&table, "body") {
        table.indexes.push("INDEX body_idx body TYPE tokenbf_v1(10240, 3, 0) GRANULARITY 4".to_string());
    }
    if is_string_column(&table, "severity") {
        table.indexes.push("INDEX severity_idx severity TYPE set(25) GRANULARITY 4".to_string());
    }
    table.comment = CREATED_BY.to_string();
    table
}

fn is_string_column(table: &Table, name: &str) -> bool {
    table.column(name).and_then(|c| c.ty.base_kind()).is_some_and(|k| *k == BaseKind::String)
}

/// `INSERT ... FORMAT JSONEachRow` with one JSON object per row.
pub fn insert_statement(table: &Table, rows: &[Document]) -> String {
    let body: Vec<String> = rows.iter().map(|r| serde_json::Value::Object(r.clone()).to_string()).collect();
    format!("INSERT INTO {} FORMAT JSONEachRow {}", table.qualified_name(), body.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::Attribute;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn create_adds_synthetic_columns_once() {
        let mut cfg = TableConfig::default_four_attrs();
        cfg.has_others = true;
        cfg.attributes = vec![Attribute::default_string()];
        let table = Table::new("logs")
            .with_config(cfg)
            .with_columns([Column::new("msg", Type::nullable(BaseKind::String))]);
        let sql = create_statement(&table);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"logs\"\n(\n\
             \t\"msg\" Nullable(String),\n\
             \t\"others\" JSON,\n\
             \t\"@timestamp\" DateTime64(3) DEFAULT now64(),\n\
             \t\"attributes_string_key\" Array(String),\n\
             \t\"attributes_string_value\" Array(String)\n\
             )\nENGINE = MergeTree\nORDER BY (\"@timestamp\")"
        );
    }

    #[test]
    fn alter_only_inferable_fields() {
        let mut table = Table::new("tableName");
        let alters = alter_statements(&table, &doc(json!({"Test1": 1, "gone": null, "f": 1.5})));
        assert_eq!(
            alters,
            vec![
                "ALTER TABLE \"tableName\" ADD COLUMN IF NOT EXISTS \"Test1\" Int64",
                "ALTER TABLE \"tableName\" ADD COLUMN IF NOT EXISTS \"f\" Float64",
            ]
        );
        table.cluster = "c1".into();
        assert_eq!(
            alter_statements(&table, &doc(json!({"b": true}))),
            vec!["ALTER TABLE \"tableName\" ON CLUSTER \"c1\" ADD COLUMN IF NOT EXISTS \"b\" Bool"]
        );
    }

    #[test]
    fn table_from_first_document() {
        let d = doc(json!({"@timestamp": "2024-01-01T00:00:00Z", "body": "x", "severity": "info", "n": 3}));
        let t = table_from_document("logs", &d, TableConfig::only_schema_fields());
        assert!(!t.is_created());
        assert_eq!(t.columns.keys().cloned().collect::<Vec<_>>(), vec!["body", "severity", "n"]);
        assert_eq!(t.columns["n"].ty, Type::nullable(BaseKind::Int64));
        assert_eq!(t.indexes.len(), 2);
        assert!(create_statement(&t).ends_with("COMMENT 'created by sluice'"));
    }

    #[test]
    fn insert_rows() {
        let t = Table::new("t");
        let sql = insert_statement(&t, &[doc(json!({"a": 1})), doc(json!({"b": "x"}))]);
        assert_eq!(sql, "INSERT INTO \"t\" FORMAT JSONEachRow {\"a\":1} {\"b\":\"x\"}");
    }
}
