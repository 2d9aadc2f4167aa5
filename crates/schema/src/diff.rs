//! Per-document comparison against a table: unknown fields, pruning to the
//! declared schema and removal of values the column types cannot take.

use serde_json::{Map, Value};
use sluice_core::{Document, Field, Table, Type, TIMESTAMP_FIELD};

/// A level of the schema: the table's top-level columns or the fields of a record.
#[derive(Clone, Copy)]
enum Scope<'a> {
    Table(&'a Table),
    Record(&'a [Field]),
}

enum Lookup<'a> {
    Column(&'a Type),
    /// Implied by the table config rather than declared.
    Synthetic,
    Absent,
}

impl<'a> Scope<'a> {
    fn lookup(self, name: &str) -> Lookup<'a> {
        match self {
            Scope::Table(t) => match t.column(name) {
                Some(col) => Lookup::Column(&col.ty),
                None if t.config.has_timestamp && name == TIMESTAMP_FIELD => Lookup::Synthetic,
                None => Lookup::Absent,
            },
            Scope::Record(fields) => match fields.iter().find(|f| f.name == name) {
                Some(f) => Lookup::Column(&f.ty),
                None => Lookup::Absent,
            },
        }
    }
}

fn record_fields(ty: &Type) -> Option<&[Field]> {
    match ty {
        Type::Record(fields) => Some(fields),
        _ => None,
    }
}

/// The part of `doc` the table does not declare, nesting preserved.
pub fn unknown_fields(table: &Table, doc: &Document) -> Document {
    unknown_in(Scope::Table(table), doc)
}

fn unknown_in(scope: Scope<'_>, doc: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in doc {
        match scope.lookup(k) {
            Lookup::Absent => {
                out.insert(k.clone(), v.clone());
            }
            Lookup::Synthetic => {}
            Lookup::Column(ty) => {
                if let (Some(fields), Value::Object(inner)) = (record_fields(ty), v) {
                    let sub = unknown_in(Scope::Record(fields), inner);
                    if !sub.is_empty() {
                        out.insert(k.clone(), Value::Object(sub));
                    }
                }
            }
        }
    }
    out
}

/// Drops every field the table does not declare. Objects left empty are removed,
/// so pruning twice gives the same result as pruning once.
pub fn prune_to_schema(table: &Table, doc: &Document) -> Document {
    prune_in(Scope::Table(table), doc)
}

fn prune_in(scope: Scope<'_>, doc: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in doc {
        let ty = match scope.lookup(k) {
            Lookup::Absent => continue,
            Lookup::Synthetic => {
                out.insert(k.clone(), v.clone());
                continue;
            }
            Lookup::Column(ty) => ty,
        };
        match (ty, v) {
            (Type::Record(fields), Value::Object(inner)) => {
                let pruned = prune_in(Scope::Record(fields), inner);
                if !pruned.is_empty() {
                    out.insert(k.clone(), Value::Object(pruned));
                }
            }
            (Type::Array(elem), Value::Array(items)) => match record_fields(elem) {
                Some(fields) => {
                    let items = items
                        .iter()
                        .map(|item| match item {
                            Value::Object(o) => Value::Object(prune_in(Scope::Record(fields), o)),
                            other => other.clone(),
                        })
                        .collect();
                    out.insert(k.clone(), Value::Array(items));
                }
                None => {
                    out.insert(k.clone(), v.clone());
                }
            },
            _ => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    out
}

/// Splits `doc` into the part the column types admit and the leaves they do not.
/// A String column takes only strings. Numeric columns also take numeric strings.
/// Undeclared fields pass through untouched.
pub fn drop_type_mismatches(doc: Document, table: &Table) -> (Document, Document) {
    split_in(Scope::Table(table), doc)
}

fn split_in(scope: Scope<'_>, doc: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut kept = Map::new();
    let mut dropped = Map::new();
    for (k, v) in doc {
        let ty = match scope.lookup(&k) {
            Lookup::Absent => {
                kept.insert(k, v);
                continue;
            }
            Lookup::Synthetic => {
                if matches!(v, Value::String(_) | Value::Number(_) | Value::Null) {
                    kept.insert(k, v);
                } else {
                    dropped.insert(k, v);
                }
                continue;
            }
            Lookup::Column(ty) => ty,
        };
        match (ty, v) {
            (Type::Record(fields), Value::Object(inner)) => {
                let (k_in, d_in) = split_in(Scope::Record(fields), inner);
                if !d_in.is_empty() {
                    dropped.insert(k.clone(), Value::Object(d_in));
                }
                kept.insert(k, Value::Object(k_in));
            }
            (Type::Array(elem), Value::Array(items)) if elem.is_record() => {
                let fields = record_fields(elem).unwrap_or_default();
                let mut kept_items = Vec::with_capacity(items.len());
                let mut dropped_items = Vec::new();
                for item in items {
                    match item {
                        Value::Object(o) => {
                            let (k_in, d_in) = split_in(Scope::Record(fields), o);
                            if !d_in.is_empty() {
                                dropped_items.push(Value::Object(d_in));
                            }
                            kept_items.push(Value::Object(k_in));
                        }
                        Value::Null => kept_items.push(Value::Null),
                        other => dropped_items.push(other),
                    }
                }
                if !dropped_items.is_empty() {
                    dropped.insert(k.clone(), Value::Array(dropped_items));
                }
                kept.insert(k, Value::Array(kept_items));
            }
            (ty, v) => {
                if ty.admits(&v) {
                    kept.insert(k, v);
                } else {
                    dropped.insert(k, v);
                }
            }
        }
    }
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::document::leaf_paths;
    use sluice_core::{BaseKind, Column};

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap_or_default()
    }

    fn s() -> Type {
        Type::base(BaseKind::String)
    }

    fn rec(fields: Vec<(&str, Type)>) -> Type {
        Type::Record(fields.into_iter().map(|(n, t)| Field::new(n, t)).collect())
    }

    fn nested_table() -> Table {
        Table::new("t").with_columns([
            Column::new("schema1", rec(vec![("schema11", rec(vec![("schema111", s())]))])),
            Column::new(
                "schema2",
                rec(vec![
                    ("schema21", rec(vec![("schema211", s()), ("schema212", rec(vec![("schema2121", s())]))])),
                    ("schema22", rec(vec![("schema221", s())])),
                ]),
            ),
        ])
    }

    fn nested_doc() -> Document {
        doc(json!({
            "schema1": {"schema11": {"schema111": "a"}, "non-schema12": {"non-schema111": "b"}},
            "schema2": {
                "schema21": {
                    "non-schema211": "c",
                    "non-schema212": {"non-schema2121": "d"},
                    "schema211": "e",
                    "schema212": {"non-schema2121": "f", "schema2121": "g"}
                },
                "schema22": {"schema221": "h", "non-schema221": "i"}
            },
            "non-schema1": {"non-schema11": {"non-schema111": "j"}},
            "non-schema2": "k"
        }))
    }

    #[test]
    fn prune_keeps_only_declared_leaves() {
        let pruned = prune_to_schema(&nested_table(), &nested_doc());
        assert_eq!(
            Value::Object(pruned.clone()),
            json!({
                "schema1": {"schema11": {"schema111": "a"}},
                "schema2": {
                    "schema21": {"schema211": "e", "schema212": {"schema2121": "g"}},
                    "schema22": {"schema221": "h"}
                }
            })
        );
        assert_eq!(prune_to_schema(&nested_table(), &pruned), pruned);
    }

    #[test]
    fn prune_removes_emptied_objects() {
        let table = nested_table();
        let pruned = prune_to_schema(&table, &doc(json!({"schema1": {"schema11": {"x": 1}}, "schema2": {}})));
        assert!(pruned.is_empty());
    }

    #[test]
    fn unknown_fields_keep_nesting() {
        let unknown = unknown_fields(&nested_table(), &nested_doc());
        assert_eq!(
            Value::Object(unknown.clone()),
            json!({
                "schema1": {"non-schema12": {"non-schema111": "b"}},
                "schema2": {
                    "schema21": {
                        "non-schema211": "c",
                        "non-schema212": {"non-schema2121": "d"},
                        "schema212": {"non-schema2121": "f"}
                    },
                    "schema22": {"non-schema221": "i"}
                },
                "non-schema1": {"non-schema11": {"non-schema111": "j"}},
                "non-schema2": "k"
            })
        );
        let known = leaf_paths(&prune_to_schema(&nested_table(), &nested_doc())).len();
        assert_eq!(known + leaf_paths(&unknown).len(), leaf_paths(&nested_doc()).len());
    }

    #[test]
    fn mismatches_are_collected_not_fatal() {
        let table = Table::new("t").with_columns([
            Column::new("n", Type::base(BaseKind::Int64)),
            Column::new("f", Type::base(BaseKind::Float64)),
            Column::new("b", Type::base(BaseKind::Bool)),
            Column::new("items", Type::array(rec(vec![("id", Type::base(BaseKind::UInt32)), ("tag", s())]))),
        ]);
        let (kept, dropped) = drop_type_mismatches(
            doc(json!({
                "n": 3.0,
                "f": 2,
                "b": "yes",
                "items": [{"id": 1, "tag": "a"}, {"id": -1, "tag": "b"}, 7],
                "extra": [1, 2]
            })),
            &table,
        );
        assert_eq!(
            Value::Object(kept),
            json!({
                "n": 3.0,
                "f": 2,
                "items": [{"id": 1, "tag": "a"}, {"tag": "b"}],
                "extra": [1, 2]
            })
        );
        assert_eq!(Value::Object(dropped), json!({"b": "yes", "items": [{"id": -1}, 7]}));
    }

    #[test]
    fn scalar_kinds_are_checked_per_column() {
        let table = Table::new("t").with_columns([
            Column::new("string_field", s()),
            Column::new("int_field", Type::base(BaseKind::Int64)),
            Column::new("int32_field", Type::base(BaseKind::Int32)),
            Column::new("uint8_field", Type::base(BaseKind::UInt8)),
            Column::new("float_field", Type::base(BaseKind::Float32)),
            Column::new("int_array_field", Type::array(Type::base(BaseKind::Int64))),
            Column::new("string_array_field", Type::array(s())),
        ]);
        let cases = [
            (json!({"string_field": 10}), json!({"string_field": 10})),
            (json!({"string_field": "10"}), json!({})),
            (json!({"string_field": 1.5}), json!({"string_field": 1.5})),
            (json!({"int_field": 15.0}), json!({})),
            (json!({"int_field": "15"}), json!({})),
            (json!({"int_field": "1.5"}), json!({"int_field": "1.5"})),
            (json!({"int_array_field": [81, "oops", 69]}), json!({"int_array_field": [81, "oops", 69]})),
            (json!({"string_array_field": ["a", 15, "b"]}), json!({"string_array_field": ["a", 15, "b"]})),
            (json!({"int32_field": 2147483648u64}), json!({"int32_field": 2147483648u64})),
            (json!({"uint8_field": -1}), json!({"uint8_field": -1})),
            (json!({"uint8_field": 255}), json!({})),
            (json!({"float_field": "15.55"}), json!({})),
            (json!({"string_field": "x", "int_field": "x"}), json!({"int_field": "x"})),
        ];
        for (input, want_dropped) in cases {
            let (kept, dropped) = drop_type_mismatches(doc(input.clone()), &table);
            assert_eq!(Value::Object(dropped.clone()), want_dropped, "{input}");
            assert_eq!(kept.len() + dropped.len(), input.as_object().map_or(0, |o| o.len()), "{input}");
        }
    }
}
