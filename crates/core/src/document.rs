//! Decoded documents. A document is an insertion-ordered JSON object; every
//! traversal over it matches on `serde_json::Value` variants.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::NESTED_SEPARATOR;

pub type Document = Map<String, Value>;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

pub fn parse_document(text: &str) -> Result<Document, DocumentError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        other => Err(DocumentError::NotAnObject(value_kind(&other))),
    }
}

/// Parses newline-delimited documents, skipping blank lines.
pub fn parse_documents(text: &str) -> Result<Vec<Document>, DocumentError> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).map(parse_document).collect()
}

pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Rewrites dotted field names (`host.name`) into the stored form (`host::name`), at every level.
pub fn encode_field_names(doc: Document) -> Document {
    doc.into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Object(inner) => Value::Object(encode_field_names(inner)),
                other => other,
            };
            (k.replace('.', NESTED_SEPARATOR), v)
        })
        .collect()
}

/// Inserts `value` at `path`, creating intermediate objects. A non-object in the way is replaced.
pub fn insert_path(doc: &mut Document, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cur = doc;
    for seg in parents {
        let slot = cur.entry(seg.clone()).or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else { return };
        cur = next;
    }
    cur.insert(last.clone(), value);
}

/// Every leaf path of the document; empty objects are not leaves.
pub fn leaf_paths(doc: &Document) -> Vec<Vec<String>> {
    fn walk(map: &Document, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        for (k, v) in map {
            prefix.push(k.clone());
            match v {
                Value::Object(inner) => walk(inner, prefix, out),
                _ => out.push(prefix.clone()),
            }
            prefix.pop();
        }
    }
    let mut out = Vec::new();
    walk(doc, &mut Vec::new(), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn encodes_dots_recursively_and_keeps_order() {
        let d = encode_field_names(doc(json!({"host.name": "a", "z": {"x.y": 1}, "b": 2})));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec!["host::name", "z", "b"]);
        assert_eq!(d["z"], json!({"x::y": 1}));
    }

    #[test]
    fn rejects_non_objects() {
        assert!(matches!(parse_document("[1]"), Err(DocumentError::NotAnObject("array"))));
        assert_eq!(parse_documents("{\"a\":1}\n\n{\"b\":2}\n").unwrap().len(), 2);
    }

    #[test]
    fn inserts_nested_paths() {
        let mut d = Document::new();
        insert_path(&mut d, &["a".into(), "b".into()], json!(1));
        insert_path(&mut d, &["a".into(), "c".into()], json!(2));
        assert_eq!(Value::Object(d.clone()), json!({"a": {"b": 1, "c": 2}}));
        let path = |a: &str, b: &str| vec![a.to_string(), b.to_string()];
        assert_eq!(leaf_paths(&d), vec![path("a", "b"), path("a", "c")]);
    }
}
