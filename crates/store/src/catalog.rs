//! Catalog queries. Column order of each result is part of the contract.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use indexmap::IndexMap;

use crate::connector::Connector;

pub const COLUMNS_QUERY: &str =
    "SELECT table, name, type, comment FROM system.columns WHERE database = ?";
pub const TABLE_COMMENT_QUERY: &str =
    "SELECT comment FROM system.tables WHERE database = ? and table = ?";
pub const CREATE_TABLE_QUERY: &str =
    "SELECT create_table_query FROM system.tables WHERE database = ? and table = ?";
pub const TIMESTAMP_KEY_QUERY: &str = "SELECT name FROM system.columns \
    WHERE database = ? AND table = ? AND is_in_primary_key = 1 AND type iLIKE 'DateTime%'";
pub const PRIMARY_TIMESTAMP_QUERY: &str =
    "SELECT primary_key FROM system.tables WHERE database = ? and table = ?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub raw_type: String,
    pub comment: String,
}

pub type CatalogColumns = BTreeMap<String, IndexMap<String, RawColumn>>;

/// Every column of every table in `database`, grouped by table.
pub async fn read_columns(conn: &dyn Connector, database: &str) -> Result<CatalogColumns> {
    let rows = conn.query(COLUMNS_QUERY, &[database]).await.context("reading system.columns")?;
    let mut out = CatalogColumns::new();
    for row in rows {
        let [table, name, raw_type, comment]: [String; 4] = row
            .try_into()
            .map_err(|r: Vec<String>| anyhow::anyhow!("expected 4 catalog columns, got {}", r.len()))?;
        out.entry(table).or_default().insert(name, RawColumn { raw_type, comment });
    }
    Ok(out)
}

async fn single(conn: &dyn Connector, sql: &str, database: &str, table: &str) -> Result<Option<String>> {
    let rows = conn.query(sql, &[database, table]).await?;
    Ok(rows.into_iter().next().and_then(|r| r.into_iter().next()))
}

pub async fn table_comment(conn: &dyn Connector, database: &str, table: &str) -> Result<String> {
    Ok(single(conn, TABLE_COMMENT_QUERY, database, table).await?.unwrap_or_default())
}

pub async fn create_table_query(conn: &dyn Connector, database: &str, table: &str) -> Result<String> {
    Ok(single(conn, CREATE_TABLE_QUERY, database, table).await?.unwrap_or_default())
}

/// Timestamp column hint: the first primary-key column of a DateTime type, or the
/// store's declared primary key when it natively carries a timestamp.
pub async fn timestamp_column(
    conn: &dyn Connector,
    database: &str,
    table: &str,
    native: bool,
) -> Result<Option<String>> {
    let sql = if native { PRIMARY_TIMESTAMP_QUERY } else { TIMESTAMP_KEY_QUERY };
    let found = single(conn, sql, database, table).await?;
    let first = found.map(|s| s.split(',').next().unwrap_or("").trim().to_string());
    Ok(first.filter(|s| !s.is_empty()))
}
