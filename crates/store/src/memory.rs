//! In-process catalog that answers the catalog queries and records every statement.
//! Backs dry runs of the CLI and the store tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sluice_schema::parse_create_table;
use tracing::debug;

use crate::catalog::{
    COLUMNS_QUERY, CREATE_TABLE_QUERY, PRIMARY_TIMESTAMP_QUERY, TABLE_COMMENT_QUERY,
    TIMESTAMP_KEY_QUERY,
};
use crate::connector::{Connector, Row};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub primary_key: bool,
}

impl CatalogColumn {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self { name: name.into(), ty: ty.into(), ..Self::default() }
    }

    pub fn key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogTable {
    pub name: String,
    pub columns: Vec<CatalogColumn>,
    pub comment: String,
    pub create_table_query: String,
    /// Declared primary key expression.
    pub primary_key: String,
}

impl CatalogTable {
    pub fn new(name: impl Into<String>, columns: impl IntoIterator<Item = CatalogColumn>) -> Self {
        Self { name: name.into(), columns: columns.into_iter().collect(), ..Self::default() }
    }
}

pub struct MemoryCatalog {
    database: String,
    tables: Mutex<BTreeMap<String, CatalogTable>>,
    executed: Mutex<Vec<String>>,
    failing: AtomicBool,
    queries: AtomicUsize,
}

const ALTER_PATTERN: &str = concat!(
    r#"^ALTER TABLE (?:"(?:[^"\\]|\\.)*"\.)?"((?:[^"\\]|\\.)*)""#,
    r#"(?: ON CLUSTER "(?:[^"\\]|\\.)*")?"#,
    r#" ADD COLUMN IF NOT EXISTS "((?:[^"\\]|\\.)*)" (.+)$"#,
);

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn unquote(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\\\", "\\")
}

impl MemoryCatalog {
    pub fn new(database: impl Into<String>) -> Self {
        Self::with_tables(database, Vec::new())
    }

    pub fn with_tables(database: impl Into<String>, tables: Vec<CatalogTable>) -> Self {
        Self {
            database: database.into(),
            tables: Mutex::new(tables.into_iter().map(|t| (t.name.clone(), t)).collect()),
            executed: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn put_table(&self, table: CatalogTable) {
        guard(&self.tables).insert(table.name.clone(), table);
    }

    pub fn drop_table(&self, name: &str) {
        guard(&self.tables).remove(name);
    }

    pub fn table(&self, name: &str) -> Option<CatalogTable> {
        guard(&self.tables).get(name).cloned()
    }

    /// Makes every following call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of catalog queries answered so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        guard(&self.executed).clone()
    }

    fn lookup(&self, args: &[&str]) -> Result<Option<CatalogTable>> {
        match args {
            [db, table] if *db == self.database => Ok(self.table(table)),
            [_, _] => Ok(None),
            _ => bail!("expected database and table arguments"),
        }
    }

    fn apply_create(&self, sql: &str) -> Result<()> {
        let parsed = parse_create_table(sql).map_err(|e| anyhow!("{e}"))?;
        let mut tables = guard(&self.tables);
        if tables.contains_key(&parsed.name) {
            return Ok(());
        }
        let columns =
            parsed.columns.values().map(|c| CatalogColumn::new(&c.name, c.ty.to_string())).collect();
        let table = CatalogTable {
            name: parsed.name.clone(),
            columns,
            comment: parsed.comment.clone(),
            create_table_query: sql.to_string(),
            primary_key: parsed.config.primary_key.clone(),
        };
        tables.insert(parsed.name, table);
        Ok(())
    }

    fn apply_alter(&self, sql: &str) -> Result<()> {
        let re = Regex::new(ALTER_PATTERN)?;
        let caps = re.captures(sql).ok_or_else(|| anyhow!("unsupported ALTER: {sql}"))?;
        let (table, column, ty) = (unquote(&caps[1]), unquote(&caps[2]), caps[3].to_string());
        let mut tables = guard(&self.tables);
        let entry = tables.get_mut(&table).ok_or_else(|| anyhow!("no such table {table}"))?;
        if !entry.columns.iter().any(|c| c.name == column) {
            entry.columns.push(CatalogColumn::new(column, ty));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connector for MemoryCatalog {
    async fn query(&self, sql: &str, args: &[&str]) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("catalog unavailable");
        }
        let rows = match sql {
            COLUMNS_QUERY => {
                if args.first() != Some(&self.database.as_str()) {
                    return Ok(Vec::new());
                }
                let tables = guard(&self.tables);
                let rows: Vec<Row> = tables
                    .values()
                    .flat_map(|t| {
                        t.columns.iter().map(|c| {
                            vec![t.name.clone(), c.name.clone(), c.ty.clone(), c.comment.clone()]
                        })
                    })
                    .collect();
                rows
            }
            TABLE_COMMENT_QUERY => self.lookup(args)?.map(|t| vec![vec![t.comment]]).unwrap_or_default(),
            CREATE_TABLE_QUERY => self
                .lookup(args)?
                .filter(|t| !t.create_table_query.is_empty())
                .map(|t| vec![vec![t.create_table_query]])
                .unwrap_or_default(),
            TIMESTAMP_KEY_QUERY => self
                .lookup(args)?
                .and_then(|t| {
                    t.columns
                        .into_iter()
                        .find(|c| c.primary_key && c.ty.to_ascii_lowercase().starts_with("datetime"))
                        .map(|c| vec![vec![c.name]])
                })
                .unwrap_or_default(),
            PRIMARY_TIMESTAMP_QUERY => self
                .lookup(args)?
                .filter(|t| !t.primary_key.is_empty())
                .map(|t| vec![vec![t.primary_key]])
                .unwrap_or_default(),
            other => bail!("unsupported query: {other}"),
        };
        Ok(rows)
    }

    async fn exec(&self, sql: &str, _args: &[&str]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        debug!(sql, "memory catalog exec");
        guard(&self.executed).push(sql.to_string());
        if sql.starts_with("CREATE TABLE") {
            self.apply_create(sql)?;
        } else if sql.starts_with("ALTER TABLE") {
            self.apply_alter(sql)?;
        }
        Ok(())
    }
}
