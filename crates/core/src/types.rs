//! Column type algebra.
//!
//! A [`Type`] is either a scalar base type (optionally `Nullable`/`LowCardinality`),
//! an `Array` of another type, or a `Record` of named fields (rendered as `Tuple`).
//! Rendering via `Display` is canonical: the DDL parser reads it back into an equal value.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseKind {
    String,
    /// Raw parameter text, e.g. `16`.
    FixedString(String),
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    Date,
    DateTime(Option<String>),
    DateTime64(Option<String>),
    Uuid,
    /// `Enum8`/`Enum16`/`Enum` with its raw value list.
    Enum { name: String, params: String },
    Json,
    /// Anything we do not model, kept verbatim.
    Unknown(String),
}

impl BaseKind {
    /// Builds a kind from a type name and its raw parameter text. `raw` is the
    /// full source slice and is what an unknown kind keeps.
    pub fn from_parts(name: &str, params: Option<&str>, raw: &str) -> BaseKind {
        let params = params.map(str::trim);
        match (name, params) {
            ("String", None) => BaseKind::String,
            ("FixedString", Some(p)) => BaseKind::FixedString(p.to_string()),
            ("Int8", None) => BaseKind::Int8,
            ("Int16", None) => BaseKind::Int16,
            ("Int32", None) => BaseKind::Int32,
            ("Int64", None) => BaseKind::Int64,
            ("UInt8", None) => BaseKind::UInt8,
            ("UInt16", None) => BaseKind::UInt16,
            ("UInt32", None) => BaseKind::UInt32,
            ("UInt64", None) => BaseKind::UInt64,
            ("Float32", None) => BaseKind::Float32,
            ("Float64", None) => BaseKind::Float64,
            ("Bool" | "Boolean", None) => BaseKind::Bool,
            ("Date", None) => BaseKind::Date,
            ("DateTime", p) => BaseKind::DateTime(p.map(str::to_string)),
            ("DateTime64", p) => BaseKind::DateTime64(p.map(str::to_string)),
            ("UUID", None) => BaseKind::Uuid,
            ("Enum8" | "Enum16" | "Enum", Some(p)) => {
                BaseKind::Enum { name: name.to_string(), params: p.to_string() }
            }
            ("JSON", None) => BaseKind::Json,
            _ => BaseKind::Unknown(raw.trim().to_string()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, BaseKind::Unknown(_))
    }

    /// Scalar kind a decoded value must have to be accepted as-is.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            BaseKind::String | BaseKind::FixedString(_) | BaseKind::Uuid => Some(ScalarKind::String),
            BaseKind::Int8 | BaseKind::Int16 | BaseKind::Int32 | BaseKind::Int64 => {
                Some(ScalarKind::Int64)
            }
            BaseKind::UInt8 | BaseKind::UInt16 | BaseKind::UInt32 | BaseKind::UInt64 => {
                Some(ScalarKind::UInt64)
            }
            BaseKind::Float32 | BaseKind::Float64 => Some(ScalarKind::Float64),
            BaseKind::Bool => Some(ScalarKind::Bool),
            _ => None,
        }
    }

    /// Inclusive integer range for the integer kinds.
    fn int_range(&self) -> Option<(i128, i128)> {
        Some(match self {
            BaseKind::Int8 => (i8::MIN as i128, i8::MAX as i128),
            BaseKind::Int16 => (i16::MIN as i128, i16::MAX as i128),
            BaseKind::Int32 => (i32::MIN as i128, i32::MAX as i128),
            BaseKind::Int64 => (i64::MIN as i128, i64::MAX as i128),
            BaseKind::UInt8 => (0, u8::MAX as i128),
            BaseKind::UInt16 => (0, u16::MAX as i128),
            BaseKind::UInt32 => (0, u32::MAX as i128),
            BaseKind::UInt64 => (0, u64::MAX as i128),
            _ => return None,
        })
    }

    /// Integer and float kinds take numbers and numeric strings, range-checked for integers.
    fn admits_number(&self, value: &Value) -> Option<bool> {
        if let Some((lo, hi)) = self.int_range() {
            let parsed = match value {
                Value::Number(n) => integral(n),
                Value::String(s) => s.parse::<i128>().ok(),
                _ => None,
            };
            return Some(parsed.is_some_and(|i| lo <= i && i <= hi));
        }
        match self {
            BaseKind::Float32 | BaseKind::Float64 => Some(match value {
                Value::Number(_) => true,
                Value::String(s) => s.parse::<f64>().is_ok(),
                _ => false,
            }),
            _ => None,
        }
    }

    /// Kinds with no scalar family of their own.
    fn admits_other(&self, value: &Value) -> bool {
        match self {
            BaseKind::Date | BaseKind::DateTime(_) | BaseKind::DateTime64(_) => {
                matches!(value, Value::String(s) if is_date_string(s))
            }
            BaseKind::Enum { .. } => match value {
                Value::String(_) => true,
                Value::Number(n) => integral(n).is_some(),
                _ => false,
            },
            BaseKind::Json | BaseKind::Unknown(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseKind::String => f.write_str("String"),
            BaseKind::FixedString(p) => write!(f, "FixedString({p})"),
            BaseKind::Int8 => f.write_str("Int8"),
            BaseKind::Int16 => f.write_str("Int16"),
            BaseKind::Int32 => f.write_str("Int32"),
            BaseKind::Int64 => f.write_str("Int64"),
            BaseKind::UInt8 => f.write_str("UInt8"),
            BaseKind::UInt16 => f.write_str("UInt16"),
            BaseKind::UInt32 => f.write_str("UInt32"),
            BaseKind::UInt64 => f.write_str("UInt64"),
            BaseKind::Float32 => f.write_str("Float32"),
            BaseKind::Float64 => f.write_str("Float64"),
            BaseKind::Bool => f.write_str("Bool"),
            BaseKind::Date => f.write_str("Date"),
            BaseKind::DateTime(None) => f.write_str("DateTime"),
            BaseKind::DateTime(Some(p)) => write!(f, "DateTime({p})"),
            BaseKind::DateTime64(None) => f.write_str("DateTime64"),
            BaseKind::DateTime64(Some(p)) => write!(f, "DateTime64({p})"),
            BaseKind::Uuid => f.write_str("UUID"),
            BaseKind::Enum { name, params } => write!(f, "{name}({params})"),
            BaseKind::Json => f.write_str("JSON"),
            BaseKind::Unknown(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseType {
    pub kind: BaseKind,
    pub nullable: bool,
    /// Storage wrapper only; never changes which values fit.
    #[serde(default)]
    pub low_cardinality: bool,
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.low_cardinality, self.nullable) {
            (true, true) => write!(f, "LowCardinality(Nullable({}))", self.kind),
            (true, false) => write!(f, "LowCardinality({})", self.kind),
            (false, true) => write!(f, "Nullable({})", self.kind),
            (false, false) => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self { name: name.into(), ty }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Base(BaseType),
    Array(Box<Type>),
    /// Ordered named fields, the store's `Tuple`.
    Record(Vec<Field>),
}

impl Type {
    pub fn base(kind: BaseKind) -> Type {
        Type::Base(BaseType { kind, nullable: false, low_cardinality: false })
    }

    pub fn nullable(kind: BaseKind) -> Type {
        Type::Base(BaseType { kind, nullable: true, low_cardinality: false })
    }

    pub fn array(inner: Type) -> Type {
        Type::Array(Box::new(inner))
    }

    pub fn unknown(raw: impl Into<String>) -> Type {
        Type::base(BaseKind::Unknown(raw.into()))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Type::Base(b) if b.kind.is_unknown())
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Type::Record(_))
    }

    pub fn base_kind(&self) -> Option<&BaseKind> {
        match self {
            Type::Base(b) => Some(&b.kind),
            _ => None,
        }
    }

    /// Nested field type of a record, if this is one.
    pub fn field(&self, name: &str) -> Option<&Type> {
        match self {
            Type::Record(fields) => fields.iter().find(|f| f.name == name).map(|f| &f.ty),
            _ => None,
        }
    }

    /// Wraps a base type in `Nullable`; compound types are returned unchanged.
    pub fn into_nullable(self) -> Type {
        match self {
            Type::Base(mut b) => {
                b.nullable = true;
                Type::Base(b)
            }
            other => other,
        }
    }

    /// Replaces every enum with an `Int32` placeholder, keeping nullability.
    pub fn with_enums_as_int32(self) -> Type {
        match self {
            Type::Base(mut b) => {
                if matches!(b.kind, BaseKind::Enum { .. }) {
                    b.kind = BaseKind::Int32;
                }
                Type::Base(b)
            }
            Type::Array(inner) => Type::array(inner.with_enums_as_int32()),
            Type::Record(fields) => Type::Record(
                fields.into_iter().map(|f| Field::new(f.name, f.ty.with_enums_as_int32())).collect(),
            ),
        }
    }

    /// Exact scalar-kind match. Arrays and records never accept a value directly.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Type::Base(b) => match (b.kind.scalar_kind(), ScalarKind::of(value)) {
                (Some(want), Some(got)) => want == got,
                _ => false,
            },
            Type::Array(_) | Type::Record(_) => false,
        }
    }

    /// Whether ingestion keeps `value` for a column of this type. Non-numeric kinds need an
    /// exact [`Type::accepts`] match. Numeric kinds also take numbers of another numeric kind
    /// and numeric strings, integers only within range. `null` fits anything.
    pub fn admits(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            Type::Base(b) => match b.kind.admits_number(value) {
                Some(fits) => fits,
                None => self.accepts(value) || b.kind.admits_other(value),
            },
            Type::Array(inner) => match value {
                Value::Array(items) => items.iter().all(|v| inner.admits(v)),
                _ => false,
            },
            Type::Record(_) => value.is_object(),
        }
    }

    /// Column type for a field first seen with `value`; `None` when nothing can be inferred.
    pub fn infer_column(value: &Value) -> Option<Type> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Type::base(BaseKind::Bool)),
            Value::Number(n) => Some(match ScalarKind::of_number(n) {
                ScalarKind::Float64 => Type::base(BaseKind::Float64),
                _ => Type::base(BaseKind::Int64),
            }),
            Value::String(s) if is_date_string(s) => Some(Type::base(BaseKind::DateTime64(None))),
            Value::String(_) => Some(Type::base(BaseKind::String)),
            Value::Array(items) => items.first().and_then(Type::infer_column).map(Type::array),
            Value::Object(map) => {
                let fields: Vec<Field> = map
                    .iter()
                    .filter_map(|(k, v)| Type::infer_column(v).map(|ty| Field::new(k.clone(), ty)))
                    .collect();
                (!fields.is_empty()).then_some(Type::Record(fields))
            }
        }
    }

    /// Multi-line rendering used inside CREATE TABLE; records open one indent level per nesting.
    pub fn create_table_string(&self, indent: usize) -> String {
        match self {
            Type::Record(fields) => {
                let mut out = format!("Tuple\n{}(\n", tabs(indent));
                let lines: Vec<String> = fields
                    .iter()
                    .map(|f| {
                        let ty = f.ty.create_table_string(indent + 1);
                        format!("{}{} {}", tabs(indent + 1), quote_ident(&f.name), ty)
                    })
                    .collect();
                out.push_str(&lines.join(",\n"));
                out.push('\n');
                out.push_str(&tabs(indent));
                out.push(')');
                out
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Base(b) => write!(f, "{b}"),
            Type::Array(inner) => write!(f, "Array({inner})"),
            Type::Record(fields) => {
                f.write_str("Tuple(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {}", element_name(&field.name), field.ty)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Kind of a decoded JSON scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Null,
    Bool,
    String,
    UInt64,
    Int64,
    Float64,
}

impl ScalarKind {
    /// `None` for arrays and objects.
    pub fn of(value: &Value) -> Option<ScalarKind> {
        match value {
            Value::Null => Some(ScalarKind::Null),
            Value::Bool(_) => Some(ScalarKind::Bool),
            Value::String(_) => Some(ScalarKind::String),
            Value::Number(n) => Some(ScalarKind::of_number(n)),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Non-negative integral numbers are unsigned, negative integral ones signed,
    /// everything else is a float.
    pub fn of_number(n: &Number) -> ScalarKind {
        if n.is_u64() {
            return ScalarKind::UInt64;
        }
        if n.is_i64() {
            return ScalarKind::Int64;
        }
        match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 => {
                if f >= 0.0 && f <= u64::MAX as f64 {
                    ScalarKind::UInt64
                } else if f < 0.0 && f >= i64::MIN as f64 {
                    ScalarKind::Int64
                } else {
                    ScalarKind::Float64
                }
            }
            _ => ScalarKind::Float64,
        }
    }
}

/// Recursive kind of a decoded value; arrays take the kind of their first element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferredKind {
    Scalar(ScalarKind),
    Array(Box<InferredKind>),
    Object,
    Unknown,
}

impl InferredKind {
    pub fn infer(value: &Value) -> InferredKind {
        match value {
            Value::Array(items) => InferredKind::Array(Box::new(
                items.first().map(InferredKind::infer).unwrap_or(InferredKind::Unknown),
            )),
            Value::Object(_) => InferredKind::Object,
            scalar => ScalarKind::of(scalar).map(InferredKind::Scalar).unwrap_or(InferredKind::Unknown),
        }
    }
}

/// Integral value of a number, also for floats with no fractional part.
pub fn integral(n: &Number) -> Option<i128> {
    if let Some(u) = n.as_u64() {
        return Some(u as i128);
    }
    if let Some(i) = n.as_i64() {
        return Some(i as i128);
    }
    let f = n.as_f64()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() <= u64::MAX as f64).then_some(f as i128)
}

/// RFC 3339 or `YYYY-MM-DDTHH:MM:SS`.
pub fn is_date_string(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
}

/// Double-quoted identifier as used for table and column names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

fn is_simple_ident(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn element_name(name: &str) -> String {
    if is_simple_ident(name) {
        name.to_string()
    } else {
        quote_ident(name)
    }
}

pub fn tabs(n: usize) -> String {
    "\t".repeat(n)
}
