//! Recursive-descent parser for `CREATE TABLE` statements and column type strings.
//!
//! Fields are separated by a comma only at depth zero of the enclosing list, so
//! modifiers such as `CODEC(DoubleDelta, LZ4)` or `TTL 10 + now()` never split a column.

use sluice_core::{BaseKind, Column, Field, Table, Type};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse DDL at byte {offset}: {reason}")]
pub struct ParseError {
    /// Byte offset of the first token that could not be parsed.
    pub offset: usize,
    pub reason: &'static str,
}

const CLAUSE_KEYWORDS: &[&str] =
    &["ENGINE", "ORDER", "PARTITION", "PRIMARY", "SAMPLE", "TTL", "SETTINGS", "COMMENT"];
const COLUMN_KEYWORDS: &[&str] =
    &["DEFAULT", "MATERIALIZED", "EPHEMERAL", "ALIAS", "CODEC", "TTL", "COMMENT"];

fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn err(&self, reason: &'static str) -> ParseError {
        ParseError { offset: self.pos, reason }
    }

    fn skip_ws(&mut self) {
        let bytes = self.src.as_bytes();
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else if b == b'-' && bytes.get(self.pos + 1) == Some(&b'-') {
                while let Some(b) = self.peek() {
                    self.pos += 1;
                    if b == b'\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8, reason: &'static str) -> Result<(), ParseError> {
        if self.eat(b) {
            Ok(())
        } else {
            Err(self.err(reason))
        }
    }

    fn peek_word(&self) -> &'a str {
        let bytes = self.src.as_bytes();
        let mut end = self.pos;
        while end < bytes.len() && is_word(bytes[end]) {
            end += 1;
        }
        &self.src[self.pos..end]
    }

    fn word(&mut self) -> &'a str {
        self.skip_ws();
        let w = self.peek_word();
        self.pos += w.len();
        w
    }

    fn keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        if self.peek_word().eq_ignore_ascii_case(kw) {
            self.pos += kw.len();
            true
        } else {
            false
        }
    }

    /// All of `kws` in sequence, or nothing consumed.
    fn keywords(&mut self, kws: &[&str]) -> bool {
        let save = self.pos;
        for kw in kws {
            if !self.keyword(kw) {
                self.pos = save;
                return false;
            }
        }
        true
    }

    fn at_keyword(&mut self, set: &[&str]) -> bool {
        self.skip_ws();
        let w = self.peek_word();
        set.iter().any(|k| w.eq_ignore_ascii_case(k))
    }

    /// `INDEX`, `CONSTRAINT` and `PROJECTION` open a definition only when their marker
    /// keyword follows the definition name. Otherwise they are a column name.
    fn at_definition(&mut self) -> bool {
        self.skip_ws();
        let head = self.peek_word().to_ascii_uppercase();
        let (markers, nested): (&[&str], bool) = match head.as_str() {
            "INDEX" => (&["TYPE"], false),
            "CONSTRAINT" => (&["CHECK", "ASSUME"], false),
            "PROJECTION" => (&["SELECT"], true),
            _ => return false,
        };
        let save = self.pos;
        self.word();
        let found = self.ident().is_ok()
            && if nested {
                self.eat(b'(') && self.at_keyword(markers)
            } else {
                self.skip_expression(markers, true).is_ok() && self.at_keyword(markers)
            };
        self.pos = save;
        found
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some(q @ (b'"' | b'`')) => self.quoted(q),
            Some(b) if is_word(b) => Ok(self.word().to_string()),
            _ => Err(self.err("expected identifier")),
        }
    }

    fn string_literal(&mut self) -> Result<String, ParseError> {
        self.skip_ws();
        if self.peek() != Some(b'\'') {
            return Err(self.err("expected string literal"));
        }
        self.quoted(b'\'')
    }

    /// Reads a quoted token starting at the opening quote. Backslash escapes and
    /// doubled quotes are unescaped.
    fn quoted(&mut self, q: u8) -> Result<String, ParseError> {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        let mut buf = Vec::new();
        self.pos += 1;
        loop {
            match self.peek() {
                None => return Err(ParseError { offset: start, reason: "unterminated quoted token" }),
                Some(b'\\') => match bytes.get(self.pos + 1) {
                    Some(&n) => {
                        buf.push(n);
                        self.pos += 2;
                    }
                    None => return Err(ParseError { offset: start, reason: "unterminated quoted token" }),
                },
                Some(b) if b == q => {
                    if bytes.get(self.pos + 1) == Some(&q) {
                        buf.push(q);
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        break;
                    }
                }
                Some(b) => {
                    buf.push(b);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(buf)
            .map_err(|_| ParseError { offset: start, reason: "invalid utf-8 in quoted token" })
    }

    /// Consumes `( ... )` including nested parentheses and quoted text; returns the inner text.
    fn balanced(&mut self) -> Result<&'a str, ParseError> {
        self.expect(b'(', "expected '('")?;
        let start = self.pos;
        let mut depth = 1usize;
        loop {
            match self.peek() {
                None => return Err(ParseError { offset: start - 1, reason: "unbalanced parentheses" }),
                Some(b'(') => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(b')') => {
                    depth -= 1;
                    self.pos += 1;
                    if depth == 0 {
                        return Ok(&self.src[start..self.pos - 1]);
                    }
                }
                Some(q @ (b'\'' | b'"' | b'`')) => {
                    self.quoted(q)?;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Skips an expression. Stops before a depth-zero `)`, `;`, `stops` keyword or,
    /// when `commas` is set, a depth-zero comma.
    fn skip_expression(&mut self, stops: &[&str], commas: bool) -> Result<(), ParseError> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            self.skip_ws();
            let Some(b) = self.peek() else {
                return if depth == 0 {
                    Ok(())
                } else {
                    Err(ParseError { offset: start, reason: "unbalanced parentheses" })
                };
            };
            match b {
                b'(' | b'[' => {
                    depth += 1;
                    self.pos += 1;
                }
                b')' | b']' => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                    self.pos += 1;
                }
                b',' if depth == 0 && commas => return Ok(()),
                b';' if depth == 0 => return Ok(()),
                b'\'' | b'"' | b'`' => {
                    self.quoted(b)?;
                }
                _ if is_word(b) => {
                    if depth == 0 && self.at_keyword(stops) {
                        return Ok(());
                    }
                    self.pos += self.peek_word().len();
                }
                _ => self.pos += 1,
            }
        }
    }
}

/// Parses a column type; text that does not parse becomes `Unknown(raw)`.
pub fn parse_type_string(raw: &str) -> Type {
    let mut c = Cursor::new(raw);
    match parse_type(&mut c) {
        Ok(ty) => {
            c.skip_ws();
            if c.at_end() {
                ty
            } else {
                Type::unknown(raw.trim())
            }
        }
        Err(_) => Type::unknown(raw.trim()),
    }
}

fn parse_type(c: &mut Cursor<'_>) -> Result<Type, ParseError> {
    c.skip_ws();
    let start = c.pos;
    let name = c.word();
    if name.is_empty() {
        return Err(c.err("expected type"));
    }
    match name {
        "Nullable" | "LowCardinality" => {
            c.expect(b'(', "expected '(' after type wrapper")?;
            let inner = parse_type(c)?;
            c.expect(b')', "expected ')' closing type wrapper")?;
            Ok(match inner {
                Type::Base(mut b) => {
                    if name == "Nullable" {
                        b.nullable = true;
                    } else {
                        b.low_cardinality = true;
                    }
                    Type::Base(b)
                }
                other => other,
            })
        }
        "Array" => {
            c.expect(b'(', "expected '(' after Array")?;
            let inner = parse_type(c)?;
            c.expect(b')', "expected ')' closing Array")?;
            Ok(Type::array(inner))
        }
        "Tuple" | "Nested" => {
            c.expect(b'(', "expected '(' after Tuple")?;
            Ok(Type::Record(parse_fields(c)?))
        }
        _ => {
            c.skip_ws();
            let params = if c.peek() == Some(b'(') { Some(c.balanced()?) } else { None };
            let raw = &c.src[start..c.pos];
            Ok(Type::base(BaseKind::from_parts(name, params, raw)))
        }
    }
}

/// Tuple elements after the opening parenthesis. Unnamed elements get positional names.
fn parse_fields(c: &mut Cursor<'_>) -> Result<Vec<Field>, ParseError> {
    let mut fields = Vec::new();
    if c.eat(b')') {
        return Ok(fields);
    }
    loop {
        c.skip_ws();
        let position = fields.len() + 1;
        let field = match c.peek() {
            Some(b'"' | b'`') => {
                let name = c.ident()?;
                Field::new(name, parse_type(c)?)
            }
            _ => {
                let save = c.pos;
                let word = c.word();
                if word.is_empty() {
                    return Err(c.err("expected tuple element"));
                }
                c.skip_ws();
                match c.peek() {
                    Some(b',' | b')' | b'(') => {
                        c.pos = save;
                        Field::new(position.to_string(), parse_type(c)?)
                    }
                    _ => Field::new(word, parse_type(c)?),
                }
            }
        };
        fields.push(field);
        if c.eat(b',') {
            continue;
        }
        c.expect(b')', "expected ',' or ')' in tuple")?;
        return Ok(fields);
    }
}

fn parse_column(c: &mut Cursor<'_>) -> Result<Column, ParseError> {
    let name = c.ident()?;
    let ty = parse_type(c)?;
    let mut col = Column::new(name, ty);
    let mut modifiers: Vec<&str> = Vec::new();
    loop {
        c.skip_ws();
        let start = c.pos;
        if c.keywords(&["NOT", "NULL"]) || c.keyword("NULL") {
            modifiers.push(&c.src[start..c.pos]);
        } else if ["DEFAULT", "MATERIALIZED", "EPHEMERAL", "ALIAS", "TTL"].iter().any(|kw| c.keyword(kw)) {
            c.skip_expression(COLUMN_KEYWORDS, true)?;
            modifiers.push(c.src[start..c.pos].trim_end());
        } else if c.keyword("CODEC") {
            c.balanced()?;
            modifiers.push(&c.src[start..c.pos]);
        } else if c.keyword("COMMENT") {
            col.comment = c.string_literal()?;
        } else {
            break;
        }
    }
    col.modifiers = modifiers.join(" ");
    Ok(col)
}

fn clause(c: &mut Cursor<'_>) -> Result<String, ParseError> {
    c.skip_ws();
    let start = c.pos;
    // A leading clause keyword is the expression itself, as in `ORDER BY ttl`.
    if c.at_keyword(CLAUSE_KEYWORDS) {
        c.word();
    }
    c.skip_expression(CLAUSE_KEYWORDS, false)?;
    let text = c.src[start..c.pos].trim();
    if text.is_empty() {
        return Err(ParseError { offset: start, reason: "empty clause" });
    }
    Ok(text.to_string())
}

fn parse_clauses(c: &mut Cursor<'_>, table: &mut Table) -> Result<(), ParseError> {
    loop {
        c.skip_ws();
        if c.at_end() || c.eat(b';') {
            return Ok(());
        }
        if c.keyword("ENGINE") {
            c.eat(b'=');
            table.config.engine = clause(c)?;
        } else if c.keywords(&["ORDER", "BY"]) {
            table.config.order_by = clause(c)?;
        } else if c.keywords(&["PARTITION", "BY"]) {
            table.config.partition_by = clause(c)?;
        } else if c.keywords(&["PRIMARY", "KEY"]) {
            table.config.primary_key = clause(c)?;
        } else if c.keywords(&["SAMPLE", "BY"]) {
            clause(c)?;
        } else if c.keyword("TTL") {
            table.config.ttl = clause(c)?;
        } else if c.keyword("SETTINGS") {
            table.config.settings = clause(c)?;
        } else if c.keyword("COMMENT") {
            table.comment = c.string_literal()?;
        } else {
            return Err(c.err("unexpected clause after column list"));
        }
    }
}

/// Parses `CREATE TABLE [IF NOT EXISTS] [db.]name [ON CLUSTER c] (...) clauses`.
pub fn parse_create_table(query: &str) -> Result<Table, ParseError> {
    let mut c = Cursor::new(query);
    if !c.keyword("CREATE") {
        return Err(c.err("expected CREATE"));
    }
    c.keywords(&["OR", "REPLACE"]);
    if !c.keyword("TABLE") {
        return Err(c.err("expected TABLE"));
    }
    c.keywords(&["IF", "NOT", "EXISTS"]);
    let first = c.ident()?;
    let (database, name) = if c.eat(b'.') { (first, c.ident()?) } else { (String::new(), first) };
    let mut table = Table::new(name);
    table.database = database;
    if c.keywords(&["ON", "CLUSTER"]) {
        table.cluster = c.ident()?;
    }
    c.expect(b'(', "expected '(' opening the column list")?;
    if !c.eat(b')') {
        loop {
            c.skip_ws();
            let start = c.pos;
            if c.at_definition() {
                c.word();
                c.skip_expression(&[], true)?;
                table.indexes.push(c.src[start..c.pos].trim().to_string());
            } else if c.keywords(&["PRIMARY", "KEY"]) {
                let key_start = c.pos;
                c.skip_expression(&[], true)?;
                table.config.primary_key = c.src[key_start..c.pos].trim().to_string();
            } else {
                let col = parse_column(&mut c)?;
                table.columns.insert(col.name.clone(), col);
            }
            if c.eat(b',') {
                continue;
            }
            c.expect(b')', "expected ',' or ')' after column")?;
            break;
        }
    }
    parse_clauses(&mut c, &mut table)?;
    table.derive_config_from_columns();
    table.raw_ddl = query.trim().to_string();
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::BaseType;

    const DDL: &str = r#"CREATE TABLE IF NOT EXISTS "logs/a?b&c" ON CLUSTER "main"
(
	"timestamp" DateTime64(3) DEFAULT now64() CODEC(DoubleDelta, LZ4),
	"n" Int64 TTL 10 + 50*80 + now(),
	"attrs" Tuple(a Nullable(String), "b c" Array(Int32)),
	`msg` LowCardinality(String) COMMENT 'it''s, really',
	INDEX body_idx msg TYPE tokenbf_v1(10240, 3, 0) GRANULARITY 4
)
ENGINE = MergeTree
ORDER BY ("timestamp")
SETTINGS index_granularity = 8192, min_bytes_for_wide_part = 0
COMMENT 'created by sluice'"#;

    #[test]
    fn parses_modifiers_without_splitting_fields() {
        let t = parse_create_table(DDL).unwrap();
        assert_eq!(t.name, "logs/a?b&c");
        assert_eq!(t.cluster, "main");
        let names: Vec<_> = t.columns.keys().cloned().collect();
        assert_eq!(names, vec!["timestamp", "n", "attrs", "msg"]);
        assert_eq!(t.columns["timestamp"].modifiers, "DEFAULT now64() CODEC(DoubleDelta, LZ4)");
        assert_eq!(t.columns["n"].modifiers, "TTL 10 + 50*80 + now()");
        assert_eq!(t.columns["msg"].comment, "it's, really");
        assert_eq!(
            t.columns["msg"].ty,
            Type::Base(BaseType { kind: BaseKind::String, nullable: false, low_cardinality: true })
        );
        assert_eq!(t.columns["attrs"].ty.to_string(), "Tuple(a Nullable(String), \"b c\" Array(Int32))");
        assert_eq!(t.indexes, vec!["INDEX body_idx msg TYPE tokenbf_v1(10240, 3, 0) GRANULARITY 4"]);
        assert_eq!(t.config.engine, "MergeTree");
        assert_eq!(t.config.order_by, "(\"timestamp\")");
        assert_eq!(t.config.settings, "index_granularity = 8192, min_bytes_for_wide_part = 0");
        assert_eq!(t.comment, "created by sluice");
    }

    #[test]
    fn splits_database_and_name() {
        let t = parse_create_table("create table `db`.events (id UInt64) ENGINE = Memory").unwrap();
        assert_eq!(t.database, "db");
        assert_eq!(t.name, "events");
        assert_eq!(t.columns["id"].ty, Type::base(BaseKind::UInt64));
    }

    #[test]
    fn reports_offset_of_bad_token() {
        let q = "CREATE TABLE t (a String, b )";
        let err = parse_create_table(q).unwrap_err();
        assert_eq!(err.offset, q.rfind(')').unwrap());
        let err = parse_create_table("DROP TABLE t").unwrap_err();
        assert_eq!(err.offset, 0);
        let q = "CREATE TABLE t (a String) WAT ENGINE = MergeTree";
        assert_eq!(parse_create_table(q).unwrap_err().offset, q.find("WAT").unwrap());
    }

    #[test]
    fn type_strings() {
        assert_eq!(parse_type_string("Nullable(Int64)"), Type::nullable(BaseKind::Int64));
        assert_eq!(
            parse_type_string("Array(Array(Nullable(Float64)))"),
            Type::array(Type::array(Type::nullable(BaseKind::Float64)))
        );
        assert_eq!(parse_type_string("Map(String, Array(UInt8))"), Type::unknown("Map(String, Array(UInt8))"));
        assert_eq!(parse_type_string("Array(String"), Type::unknown("Array(String"));
        assert_eq!(
            parse_type_string("Tuple(String, Int8)"),
            Type::Record(vec![
                Field::new("1", Type::base(BaseKind::String)),
                Field::new("2", Type::base(BaseKind::Int8)),
            ])
        );
        assert_eq!(
            parse_type_string("Enum8('a' = 1, 'b, c' = 2)"),
            Type::base(BaseKind::Enum { name: "Enum8".into(), params: "'a' = 1, 'b, c' = 2".into() })
        );
        assert_eq!(parse_type_string("DateTime64(3, 'UTC')").to_string(), "DateTime64(3, 'UTC')");
    }

    #[test]
    fn detects_fallback_columns() {
        let q = concat!(
            r#"CREATE TABLE t ("others" JSON, "attributes_string_key" Array(String), "#,
            r#""attributes_string_value" Array(String))"#,
        );
        let t = parse_create_table(q).unwrap();
        assert!(t.config.has_others);
        assert_eq!(t.config.attributes.len(), 1);
    }

    #[test]
    fn definition_keywords_can_name_columns() {
        let q = "CREATE TABLE t (index String, `constraint` Int64, projection Array(String), \
                 INDEX idx index TYPE bloom_filter GRANULARITY 1, \
                 CONSTRAINT c CHECK constraint > 0, \
                 PROJECTION p (SELECT index ORDER BY constraint))";
        let t = parse_create_table(q).unwrap();
        assert_eq!(t.columns.keys().collect::<Vec<_>>(), vec!["index", "constraint", "projection"]);
        assert_eq!(t.column("index").unwrap().ty, Type::base(BaseKind::String));
        assert_eq!(t.column("projection").unwrap().ty, Type::array(Type::base(BaseKind::String)));
        assert_eq!(t.indexes.len(), 3);
        assert!(t.indexes[0].starts_with("INDEX idx index TYPE"));
        assert!(t.indexes[2].starts_with("PROJECTION p (SELECT"));
    }

    #[test]
    fn clause_keywords_can_be_clause_expressions() {
        let t = parse_create_table("CREATE TABLE t (ttl DateTime) ENGINE = MergeTree ORDER BY ttl").unwrap();
        assert_eq!(t.config.order_by, "ttl");
        let q = "CREATE TABLE t (comment String, ts DateTime) ENGINE = MergeTree \
                 ORDER BY comment TTL ts + INTERVAL 1 DAY COMMENT 'kept'";
        let t = parse_create_table(q).unwrap();
        assert_eq!(t.config.order_by, "comment");
        assert_eq!(t.config.ttl, "ts + INTERVAL 1 DAY");
        assert_eq!(t.comment, "kept");
        assert!(parse_create_table("CREATE TABLE t (a Int64) ORDER BY").is_err());
    }
}
