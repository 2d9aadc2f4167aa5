//! Routes unknown leaves into typed attribute key/value arrays or the `others` blob.

use serde_json::Value;
use smallvec::SmallVec;
use sluice_core::document::insert_path;
use sluice_core::types::integral;
use sluice_core::{Attribute, BaseKind, Document, ScalarKind, TableConfig, NESTED_SEPARATOR};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    #[error("field {path} matches no attribute and the table has no others column")]
    Unroutable { path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackedAttribute {
    pub attribute: Attribute,
    pub keys: Vec<String>,
    pub values: Vec<Value>,
}

impl PackedAttribute {
    fn empty(attribute: Attribute) -> Self {
        Self { attribute, keys: Vec::new(), values: Vec::new() }
    }

    fn push(&mut self, key: String, value: &Value) {
        let value = match self.attribute.value_type.base_kind().and_then(BaseKind::scalar_kind) {
            Some(ScalarKind::String) => Value::String(stringify(value)),
            Some(ScalarKind::Int64 | ScalarKind::UInt64) => match value {
                Value::Number(n) => integral(n)
                    .and_then(|i| i64::try_from(i).ok())
                    .map(Value::from)
                    .unwrap_or_else(|| value.clone()),
                other => other.clone(),
            },
            _ => value.clone(),
        };
        self.keys.push(key);
        self.values.push(value);
    }
}

/// Every configured attribute appears, in configured order, even when nothing routed to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packed {
    pub attributes: Vec<PackedAttribute>,
    pub others: Document,
}

type Path<'a> = SmallVec<[&'a str; 4]>;

fn leaves<'a>(doc: &'a Document, prefix: &mut Path<'a>, out: &mut Vec<(Path<'a>, &'a Value)>) {
    for (k, v) in doc {
        prefix.push(k.as_str());
        match v {
            Value::Object(inner) => leaves(inner, prefix, out),
            Value::Null => {}
            leaf => out.push((prefix.clone(), leaf)),
        }
        prefix.pop();
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn pack(unknown: &Document, config: &TableConfig) -> Result<Packed, PackError> {
    let mut packed = Packed {
        attributes: config.attributes.iter().cloned().map(PackedAttribute::empty).collect(),
        others: Document::new(),
    };
    let mut found = Vec::new();
    leaves(unknown, &mut Path::new(), &mut found);

    for (path, value) in found {
        if config.prefer_casting_to_others && config.has_others {
            to_others(&mut packed.others, &path, value);
            continue;
        }
        let key = path.join(NESTED_SEPARATOR);
        if let Some(slot) = packed.attributes.iter_mut().find(|a| a.attribute.matches(value)) {
            slot.push(key, value);
            continue;
        }
        let string_slot = packed.attributes.iter_mut().find(|a| a.attribute.is_string());
        match string_slot {
            Some(slot) if config.cast_unsupported_attr_value_types_to_string => slot.push(key, value),
            _ if config.has_others => to_others(&mut packed.others, &path, value),
            _ => return Err(PackError::Unroutable { path: key }),
        }
    }
    Ok(packed)
}

fn to_others(others: &mut Document, path: &[&str], value: &Value) {
    let owned: Vec<String> = path.iter().map(|s| s.to_string()).collect();
    insert_path(others, &owned, value.clone());
}
