//! Catalog discovery: turns the store's catalog plus operator configuration into the
//! published [`TableSnapshot`], keeps it fresh in the background and serves reads.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use metrics::{counter, gauge, histogram};
use sluice_core::{
    Column, IndexConfig, SluiceConfig, Table, TableConfig, TableSnapshot, VirtualTableManifest,
};
use sluice_persist::JsonStore;
use sluice_schema::{parse_create_table, parse_type_string};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::catalog::{create_table_query, read_columns, table_comment, timestamp_column, RawColumn};
use crate::clock::{Clock, SystemClock};
use crate::connector::Connector;
use crate::registry::Registry;

/// Shared physical table behind every virtual table.
pub const COMMON_TABLE: &str = "sluice_common_table";
/// Column of the common table naming the index a row belongs to.
pub const INDEX_NAME_COLUMN: &str = "__sluice_index_name";
/// Manifest store bucket holding one manifest per virtual table.
pub const MANIFEST_BUCKET: &str = "virtual_tables";
/// Reads of a snapshot published longer ago than this wait for a reload.
pub const STALENESS: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("catalog read failed: {0}")]
    Catalog(String),
    #[error("discovery loop is not running")]
    Stopped,
}

#[derive(Default)]
struct State {
    last_publish: Option<Instant>,
    last_access: Option<Instant>,
    last_error: Option<DiscoveryError>,
    reloads: u64,
}

pub struct TableDiscovery {
    connector: Arc<dyn Connector>,
    registry: Registry,
    config: SluiceConfig,
    manifests: Arc<dyn JsonStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl TableDiscovery {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Registry,
        config: SluiceConfig,
        manifests: Arc<dyn JsonStore>,
    ) -> Self {
        Self {
            connector,
            registry,
            config,
            manifests,
            clock: Arc::new(SystemClock),
            state: Mutex::new(State::default()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SluiceConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Error of the most recent reload, if it failed.
    pub fn last_error(&self) -> Option<DiscoveryError> {
        self.state().last_error.clone()
    }

    /// Completed reloads, failed ones included.
    pub fn reload_count(&self) -> u64 {
        self.state().reloads
    }

    fn touch(&self) {
        let now = self.clock.now();
        self.state().last_access = Some(now);
    }

    /// True before the first publish and once the last publish is older than [`STALENESS`].
    pub fn is_stale(&self) -> bool {
        let now = self.clock.now();
        match self.state().last_publish {
            Some(at) => now.saturating_duration_since(at) > STALENESS,
            None => true,
        }
    }

    fn accessed_within(&self, window: Duration) -> bool {
        let now = self.clock.now();
        self.state().last_access.is_some_and(|at| now.saturating_duration_since(at) <= window)
    }

    /// Runs one discovery pass and publishes its result. A failed catalog read
    /// publishes an empty snapshot. Passes never overlap.
    pub async fn reload(&self) -> Result<(), DiscoveryError> {
        let _pass = self.reload_lock.lock().await;
        let started = Instant::now();
        let before = self.registry.current();

        let (snapshot, outcome) = match self.load().await {
            Ok(snapshot) => (snapshot, Ok(())),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "catalog read failed; publishing empty snapshot");
                counter!("discovery_reload_errors_total", 1u64);
                (TableSnapshot::default(), Err(DiscoveryError::Catalog(format!("{e:#}"))))
            }
        };
        let count = snapshot.len();
        self.registry.publish(snapshot);
        {
            let now = self.clock.now();
            let mut st = self.state();
            st.last_publish = Some(now);
            st.last_error = outcome.clone().err();
            st.reloads += 1;
        }
        histogram!("discovery_reload_ms", started.elapsed().as_secs_f64() * 1000.0);
        gauge!("discovery_tables", count as f64);
        log_changes(&before, &self.registry.current());
        debug!(tables = count, "snapshot published");
        outcome
    }

    async fn load(&self) -> anyhow::Result<TableSnapshot> {
        let db = self.config.database.as_str();
        let conn = self.connector.as_ref();
        let catalog = read_columns(conn, db).await?;

        let mut tables: Vec<Table> = Vec::new();
        for (name, raw) in &catalog {
            let index = self.config.index(name);
            if !self.config.auto_discovery() {
                match index {
                    Some(i) if i.disabled => continue,
                    None if name != COMMON_TABLE => continue,
                    _ => {}
                }
            }
            let hint = if self.config.auto_discovery() {
                let native = self.config.native_primary_timestamp;
                timestamp_column(conn, db, name, native).await.unwrap_or_else(|e| {
                    warn!(table = %name, error = %e, "timestamp lookup failed");
                    None
                })
            } else {
                None
            };
            let comment = table_comment(conn, db, name).await.unwrap_or_else(|e| {
                warn!(table = %name, error = %e, "table comment lookup failed");
                String::new()
            });
            let raw_ddl = create_table_query(conn, db, name).await.unwrap_or_else(|e| {
                warn!(table = %name, error = %e, "create_table_query lookup failed");
                String::new()
            });
            if let Some(table) = self.build_table(name, raw, index, comment, raw_ddl, hint) {
                tables.push(table);
            }
        }

        if let Some(common) = tables.iter().find(|t| t.name == COMMON_TABLE).cloned() {
            let physical: BTreeSet<String> = tables.iter().map(|t| t.name.clone()).collect();
            for vt in self.virtual_tables(&common) {
                if physical.contains(&vt.name) {
                    warn!(table = %vt.name, "virtual table shadows a physical table; skipping");
                    continue;
                }
                tables.push(vt);
            }
        }
        Ok(tables.into_iter().collect())
    }

    fn build_table(
        &self,
        name: &str,
        raw: &IndexMap<String, RawColumn>,
        index: Option<&IndexConfig>,
        comment: String,
        raw_ddl: String,
        hint: Option<String>,
    ) -> Option<Table> {
        let mut table = Table::new(name);
        table.database = self.config.database.clone();
        table.cluster = self.config.cluster.clone().unwrap_or_default();

        for (col, rc) in raw {
            if index.is_some_and(|i| i.ignores(col)) {
                continue;
            }
            let raw_type = index.and_then(|i| i.type_override(col)).unwrap_or(rc.raw_type.as_str());
            let mut column = Column::new(col.clone(), parse_type_string(raw_type).with_enums_as_int32());
            column.comment = rc.comment.clone();
            column.full_text = index.is_some_and(|i| i.full_text_fields.iter().any(|f| f == col));
            table.columns.insert(col.clone(), column);
        }
        if table.columns.values().all(|c| c.ty.is_unknown()) {
            warn!(table = %name, "no column type could be resolved; skipping table");
            return None;
        }
        let policy = TableConfig::discovered();
        table.config = policy.clone();
        if !raw_ddl.is_empty() {
            match parse_create_table(&raw_ddl) {
                Ok(parsed) => {
                    table.config = parsed.config.with_policy(&policy);
                    table.indexes = parsed.indexes;
                }
                Err(e) => {
                    debug!(table = %name, error = %e, "create_table_query not parsed; using defaults")
                }
            }
        }
        table.derive_config_from_columns();
        table.comment = comment;
        table.raw_ddl = raw_ddl;
        table.timestamp_field = hint;
        table.mark_created();
        Some(table)
    }

    /// Virtual tables from stored manifests, restricted to columns the common table has.
    fn virtual_tables(&self, common: &Table) -> Vec<Table> {
        let entries = match self.manifests.list(MANIFEST_BUCKET) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "listing virtual table manifests failed");
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(entries.len());
        for (name, body) in entries {
            let manifest: VirtualTableManifest = match serde_json::from_value(body) {
                Ok(m) => m,
                Err(e) => {
                    warn!(table = %name, error = %e, "unreadable virtual table manifest");
                    continue;
                }
            };
            if !manifest.is_current() {
                warn!(table = %name, version = %manifest.version, "unsupported manifest version; skipping");
                continue;
            }
            let mut table = Table::new(name.clone()).with_config(common.config.clone());
            table.database = common.database.clone();
            table.cluster = common.cluster.clone();
            table.timestamp_field = common.timestamp_field.clone();
            table.is_virtual = true;
            for col in manifest.column_names() {
                match common.column(col) {
                    Some(c) => {
                        table.columns.insert(c.name.clone(), c.clone());
                    }
                    None => {
                        warn!(table = %name, column = col, "manifest column missing from common table")
                    }
                }
            }
            table.mark_created();
            out.push(table);
        }
        out
    }
}

fn log_changes(before: &TableSnapshot, after: &TableSnapshot) {
    for name in after.names().filter(|n| !before.contains(n)) {
        info!(table = %name, "table appeared");
    }
    for name in before.names().filter(|n| !after.contains(n)) {
        info!(table = %name, "table disappeared");
    }
}

/// Read side of a running discovery loop.
#[derive(Clone)]
pub struct DiscoveryHandle {
    discovery: Arc<TableDiscovery>,
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl DiscoveryHandle {
    /// Current snapshot. Waits for a reload first when the last publish is stale.
    pub async fn snapshot(&self) -> Arc<TableSnapshot> {
        self.discovery.touch();
        if self.discovery.is_stale() {
            if let Err(e) = self.force_reload().await {
                warn!(error = %e, "forced reload failed");
            }
        }
        self.discovery.registry().current()
    }

    /// Queues a reload and waits until a pass that started after the request finished.
    pub async fn force_reload(&self) -> Result<(), DiscoveryError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(ack_tx).await.map_err(|_| DiscoveryError::Stopped)?;
        ack_rx.await.map_err(|_| DiscoveryError::Stopped)
    }

    pub fn registry(&self) -> &Registry {
        self.discovery.registry()
    }

    pub fn discovery(&self) -> &Arc<TableDiscovery> {
        &self.discovery
    }
}

/// Runs the first reload, then spawns the loop serving forced reloads and periodic ticks.
/// A tick only reloads when the snapshot was read within the last two intervals.
pub async fn spawn_discovery(discovery: Arc<TableDiscovery>, interval: Duration) -> DiscoveryHandle {
    let _ = discovery.reload().await;
    let (tx, mut rx) = mpsc::channel::<oneshot::Sender<()>>(64);
    let d = Arc::clone(&discovery);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(ack) => {
                            let mut acks = vec![ack];
                            while let Ok(more) = rx.try_recv() {
                                acks.push(more);
                            }
                            let _ = d.reload().await;
                            for ack in acks {
                                let _ = ack.send(());
                            }
                        }
                        None => {
                            debug!("reload channel closed; exiting discovery loop");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if d.accessed_within(interval * 2) {
                        let _ = d.reload().await;
                    } else {
                        debug!("snapshot idle; skipping periodic reload");
                    }
                }
            }
        }
        info!("discovery loop stopped");
    });

    DiscoveryHandle { discovery, tx }
}
