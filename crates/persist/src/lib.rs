//! Sluice persistence: a small durable JSON document store, keyed by bucket and key.
//! Holds virtual-table manifests. Synchronous; writes are rare and small.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::debug;

pub trait JsonStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, value: &Value) -> Result<()>;
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>>;
    /// All documents of a bucket, ordered by key.
    fn list(&self, bucket: &str) -> Result<Vec<(String, Value)>>;
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("store mutex poisoned"))
}

/// SQLite-backed store.
pub struct SqliteJsonStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteJsonStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SLUICE_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "json store opened");
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory().context("opening in-memory sqlite")?)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                bucket TEXT NOT NULL,
                key    TEXT NOT NULL,
                body   TEXT NOT NULL,
                ts     INTEGER NOT NULL,
                PRIMARY KEY (bucket, key)
            )",
            [],
        )
        .context("creating documents table")?;
        Ok(Self { db: Mutex::new(db) })
    }
}

impl JsonStore for SqliteJsonStore {
    fn put(&self, bucket: &str, key: &str, value: &Value) -> Result<()> {
        let started = std::time::Instant::now();
        let body = serde_json::to_string(value).context("encoding document")?;
        let db = lock(&self.db)?;
        db.execute(
            "INSERT INTO documents(bucket, key, body, ts) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(bucket, key) DO UPDATE SET body = excluded.body, ts = excluded.ts",
            (bucket, key, &body, now_ts()),
        )
        .with_context(|| format!("storing {bucket}/{key}"))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare("SELECT body FROM documents WHERE bucket = ?1 AND key = ?2")?;
        let mut rows = stmt.query((bucket, key))?;
        let body: Option<String> = match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        };
        let value = match body {
            Some(body) => Some(
                serde_json::from_str(&body).with_context(|| format!("decoding {bucket}/{key}"))?,
            ),
            None => None,
        };
        Ok(value)
    }

    fn list(&self, bucket: &str) -> Result<Vec<(String, Value)>> {
        let started = std::time::Instant::now();
        let db = lock(&self.db)?;
        let mut stmt =
            db.prepare("SELECT key, body FROM documents WHERE bucket = ?1 ORDER BY key")?;
        let mut rows = stmt.query([bucket])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let body: String = row.get(1)?;
            let value = serde_json::from_str(&body)
                .with_context(|| format!("decoding {bucket}/{key}"))?;
            out.push((key, value));
        }
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryJsonStore {
    docs: Mutex<BTreeMap<(String, String), Value>>,
}

impl MemoryJsonStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JsonStore for MemoryJsonStore {
    fn put(&self, bucket: &str, key: &str, value: &Value) -> Result<()> {
        lock(&self.docs)?.insert((bucket.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.docs)?.get(&(bucket.to_string(), key.to_string())).cloned())
    }

    fn list(&self, bucket: &str) -> Result<Vec<(String, Value)>> {
        Ok(lock(&self.docs)?
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".sluice");
        let _ = std::fs::create_dir_all(&p);
        p.push("sluice.db");
        return p.to_string_lossy().to_string();
    }
    "sluice.db".to_string()
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
