#![forbid(unsafe_code)]

use sluice_core::{Attribute, BaseKind, BaseType, Column, Field, Table, TableConfig, Type};
use sluice_schema::{create_statement, parse_create_table, parse_type_string};

fn rec(fields: Vec<(&str, Type)>) -> Type {
    Type::Record(fields.into_iter().map(|(n, t)| Field::new(n, t)).collect())
}

fn paths(prefix: &str, ty: &Type, out: &mut Vec<String>) {
    match ty {
        Type::Record(fields) => {
            for f in fields {
                paths(&format!("{prefix}/{}", f.name), &f.ty, out);
            }
        }
        Type::Array(inner) => paths(&format!("{prefix}[]"), inner, out),
        Type::Base(_) => out.push(prefix.to_string()),
    }
}

fn shape(table: &Table) -> Vec<String> {
    let mut out = Vec::new();
    for col in table.columns.values() {
        paths(&col.name, &col.ty, &mut out);
    }
    out
}

fn deep_table() -> Table {
    let level3 = rec(vec![
        ("leaf", Type::nullable(BaseKind::String)),
        ("when", Type::base(BaseKind::DateTime64(Some("3".into())))),
        ("odd name/?&", Type::array(Type::nullable(BaseKind::Int64))),
    ]);
    let level2 = rec(vec![("inner", level3.clone()), ("flag", Type::base(BaseKind::Bool))]);
    let level1 = rec(vec![("middle", level2), ("list", Type::array(level3))]);
    let mut cfg = TableConfig::default_four_attrs();
    cfg.has_others = true;
    cfg.attributes = vec![Attribute::default_string()];
    let mut codec = Column::new("ts", Type::base(BaseKind::DateTime64(Some("3".into()))));
    codec.modifiers = "DEFAULT now64() CODEC(DoubleDelta, LZ4)".into();
    codec.comment = "event time, UTC".into();
    let mut table = Table::new("deep/table?x&y").with_config(cfg).with_columns([
        codec,
        Column::new("outer", level1),
        Column::new(
            "tag",
            Type::Base(BaseType { kind: BaseKind::String, nullable: false, low_cardinality: true }),
        ),
    ]);
    table.database = "logs".into();
    table.cluster = "main".into();
    table.indexes.push("INDEX tag_idx tag TYPE set(25) GRANULARITY 4".into());
    table.comment = "created by sluice".into();
    table
}

#[test]
fn create_statement_parses_back_to_same_shape() {
    let table = deep_table();
    let sql = create_statement(&table);
    let parsed = parse_create_table(&sql).unwrap_or_else(|e| panic!("{e}\n{sql}"));

    assert_eq!(parsed.name, table.name);
    assert_eq!(parsed.database, "logs");
    assert_eq!(parsed.cluster, "main");
    for (name, col) in &table.columns {
        assert_eq!(parsed.columns[name].ty, col.ty, "column {name}");
    }
    assert_eq!(parsed.columns["ts"].modifiers, "DEFAULT now64() CODEC(DoubleDelta, LZ4)");
    assert_eq!(parsed.columns["ts"].comment, "event time, UTC");

    let mut expected = shape(&table);
    expected.extend(["others", "@timestamp", "attributes_string_key[]", "attributes_string_value[]"].map(String::from));
    assert_eq!(shape(&parsed), expected);

    assert!(parsed.config.has_others);
    assert!(parsed.config.has_timestamp);
    assert_eq!(parsed.config.attributes, vec![Attribute::default_string()]);
    assert_eq!(parsed.config.engine, "MergeTree");
    assert_eq!(parsed.config.order_by, "(\"@timestamp\")");
    assert_eq!(parsed.indexes, table.indexes);
    assert_eq!(parsed.comment, table.comment);

    // Rendering the parsed table is stable.
    assert_eq!(create_statement(&parsed), sql);
}

#[test]
fn type_display_parses_back() {
    let samples = [
        Type::base(BaseKind::UInt8),
        Type::nullable(BaseKind::FixedString("16".into())),
        Type::Base(BaseType { kind: BaseKind::String, nullable: true, low_cardinality: true }),
        Type::array(Type::array(Type::nullable(BaseKind::Float32))),
        Type::base(BaseKind::Enum { name: "Enum16".into(), params: "'a' = 1, 'b' = 2".into() }),
        Type::unknown("Decimal(18, 4)"),
        rec(vec![
            ("1", Type::base(BaseKind::Uuid)),
            ("with space", rec(vec![("x", Type::array(Type::base(BaseKind::Json)))])),
            ("quote\"d", Type::base(BaseKind::Date)),
        ]),
    ];
    for ty in samples {
        assert_eq!(parse_type_string(&ty.to_string()), ty, "{ty}");
    }
}
