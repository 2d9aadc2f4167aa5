#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};
use sluice_core::{BaseKind, Column, Document, IndexConfig, SluiceConfig, Table, TableConfig, Type};
use sluice_persist::{JsonStore, MemoryJsonStore};
use sluice_schema::{AlwaysPromote, NeverPromote};
use sluice_store::{
    Connector, IngestError, IngestProcessor, MemoryCatalog, Registry, Row, TableDiscovery,
    COMMON_TABLE, MANIFEST_BUCKET,
};

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap_or_default()
}

fn processor(
    config: SluiceConfig,
) -> (Arc<MemoryCatalog>, Registry, Arc<MemoryJsonStore>, IngestProcessor) {
    let catalog = Arc::new(MemoryCatalog::new(config.database.clone()));
    let registry = Registry::new();
    let manifests = Arc::new(MemoryJsonStore::new());
    let promoter = Arc::new(AlwaysPromote);
    let p = IngestProcessor::new(
        catalog.clone(),
        registry.clone(),
        config,
        manifests.clone(),
        promoter,
    );
    (catalog, registry, manifests, p)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_caller_creates_the_table() {
    let (catalog, registry, _, p) = processor(SluiceConfig::default());
    let p = Arc::new(p);
    let table = registry.insert_if_absent(
        Table::new("race")
            .with_config(TableConfig::default_four_attrs())
            .with_columns([Column::new("a", Type::nullable(BaseKind::String))]),
    );

    let tasks = (0..16).map(|_| {
        let p = Arc::clone(&p);
        let t = Arc::clone(&table);
        tokio::spawn(async move { p.ensure_created(&t).await })
    });
    let flipped = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|created| *created)
        .count();

    assert_eq!(flipped, 1);
    assert!(table.is_created());
    assert!(catalog.executed().iter().all(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")));
    assert!(!p.ensure_created(&table).await.unwrap());
}

#[tokio::test]
async fn creates_evolves_and_inserts() {
    let (catalog, registry, _, p) = processor(SluiceConfig::default());
    let docs = vec![doc(json!({"msg": "hi", "n": 1})), doc(json!({"msg": "x", "extra.field": 2.5}))];
    let report = p.ingest("logs", docs).await.unwrap();
    assert!(report.created);
    assert_eq!(report.rows, 2);
    assert_eq!(report.alters, 1);
    assert_eq!(report.table, "logs");

    let executed = catalog.executed();
    assert_eq!(executed.len(), 3);
    assert!(executed[0].starts_with("CREATE TABLE IF NOT EXISTS \"default\".\"logs\""));
    assert_eq!(
        executed[1],
        "ALTER TABLE \"default\".\"logs\" ADD COLUMN IF NOT EXISTS \"extra::field\" Float64"
    );
    assert!(executed[2].starts_with("INSERT INTO \"default\".\"logs\" FORMAT JSONEachRow {"));
    assert!(executed[2].contains("\"extra::field\":2.5"));

    let logs = p.resolve_table("logs").unwrap();
    assert!(logs.is_created());
    assert_eq!(logs.column("extra::field").unwrap().ty, Type::base(BaseKind::Float64));
    assert!(registry.get("logs").is_some());
    let stored = catalog.table("logs").unwrap();
    assert!(stored.columns.iter().any(|c| c.name == "extra::field"));

    let again = p.ingest("logs", vec![doc(json!({"msg": "y"}))]).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.alters, 0);
    assert_eq!(catalog.executed().len(), 4);
}

#[tokio::test]
async fn mismatched_values_are_counted_as_dropped() {
    let (_, registry, _, p) = processor(SluiceConfig::default());
    let t = registry.insert_if_absent(
        Table::new("m")
            .with_config(TableConfig::only_schema_fields())
            .with_columns([Column::new("n", Type::base(BaseKind::Int64))]),
    );
    t.mark_created();
    let report = p.ingest("m", vec![doc(json!({"n": "abc"})), doc(json!({"n": 3}))]).await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.rows, 2);
}

#[tokio::test]
async fn disabled_indexes_are_rejected() {
    let cfg = SluiceConfig {
        index_config: Some(BTreeMap::from([(
            "off".to_string(),
            IndexConfig { disabled: true, ..IndexConfig::default() },
        )])),
        ..SluiceConfig::default()
    };
    let (catalog, _, _, p) = processor(cfg);
    let err = p.ingest("off", vec![doc(json!({"a": 1}))]).await.unwrap_err();
    assert!(matches!(err, IngestError::Disabled(ref i) if i == "off"));
    assert!(catalog.executed().is_empty());
}

#[tokio::test]
async fn common_table_mode_writes_manifest_and_virtual_table() {
    let cfg = SluiceConfig {
        index_config: Some(BTreeMap::from([(
            "web".to_string(),
            IndexConfig { use_common_table: true, ..IndexConfig::default() },
        )])),
        ..SluiceConfig::default()
    };
    let (catalog, registry, manifests, p) = processor(cfg.clone());
    let report = p.ingest("web", vec![doc(json!({"host": "a", "status": 200}))]).await.unwrap();
    assert_eq!(report.table, COMMON_TABLE);

    let stored = manifests.get(MANIFEST_BUCKET, "web").unwrap().unwrap();
    assert_eq!(stored["version"], json!("v1"));
    let columns = stored["columns"].as_array().unwrap();
    let names: Vec<_> = columns.iter().map(|c| c["name"].clone()).collect();
    assert!(names.contains(&json!("host")));
    assert!(names.contains(&json!("status")));
    assert!(registry.get("web").is_some_and(|t| t.is_virtual));

    // A fresh discovery pass rebuilds the same virtual table from the catalog and manifest.
    let d = TableDiscovery::new(catalog.clone(), Registry::new(), cfg, manifests.clone());
    d.reload().await.unwrap();
    let web = d.registry().get("web").unwrap();
    assert!(web.is_virtual);
    assert!(web.column("host").is_some());
    assert!(d.registry().get(COMMON_TABLE).is_some());
}

/// Records, for every ALTER it executes, whether the column was already published.
struct AlterWatch {
    inner: MemoryCatalog,
    registry: Registry,
    published_before_alter: Mutex<Vec<bool>>,
}

#[async_trait::async_trait]
impl Connector for AlterWatch {
    async fn query(&self, sql: &str, args: &[&str]) -> Result<Vec<Row>> {
        self.inner.query(sql, args).await
    }

    async fn exec(&self, sql: &str, args: &[&str]) -> Result<()> {
        if sql.starts_with("ALTER TABLE") {
            let seen = self.registry.get("logs").is_some_and(|t| t.column("late").is_some());
            self.published_before_alter.lock().unwrap().push(seen);
        }
        self.inner.exec(sql, args).await
    }
}

#[tokio::test]
async fn columns_publish_only_after_alter() {
    let registry = Registry::new();
    let watch = Arc::new(AlterWatch {
        inner: MemoryCatalog::new("default"),
        registry: registry.clone(),
        published_before_alter: Mutex::new(Vec::new()),
    });
    let p = IngestProcessor::new(
        watch.clone(),
        registry.clone(),
        SluiceConfig::default(),
        Arc::new(MemoryJsonStore::new()),
        Arc::new(AlwaysPromote),
    );
    p.ingest("logs", vec![doc(json!({"a": "x"})), doc(json!({"late": 1}))]).await.unwrap();
    assert_eq!(*watch.published_before_alter.lock().unwrap(), vec![false]);
    assert!(registry.get("logs").is_some_and(|t| t.column("late").is_some()));
}

#[tokio::test]
async fn declined_promotion_packs_into_attributes() {
    let catalog = Arc::new(MemoryCatalog::new("default"));
    let p = IngestProcessor::new(
        catalog.clone(),
        Registry::new(),
        SluiceConfig::default(),
        Arc::new(MemoryJsonStore::new()),
        Arc::new(NeverPromote),
    );
    let docs = vec![doc(json!({"a": "x"})), doc(json!({"late": 1}))];
    let report = p.ingest("logs", docs).await.unwrap();
    assert_eq!(report.alters, 0);
    let insert = catalog.executed().pop().unwrap();
    assert!(insert.contains("\"attributes_int64_key\":[\"late\"]"));
}

#[tokio::test]
async fn rediscovered_table_keeps_routing_unmatched_leaves() {
    let (catalog, _, manifests, first) = processor(SluiceConfig::default());
    first.ingest("logs", vec![doc(json!({"msg": "b", "tags": []}))]).await.unwrap();

    // A restart: discovery rebuilds the table from the catalog into a fresh registry.
    let registry = Registry::new();
    let d = TableDiscovery::new(
        catalog.clone(),
        registry.clone(),
        SluiceConfig::default(),
        manifests.clone(),
    );
    d.reload().await.unwrap();
    let logs = registry.get("logs").unwrap();
    assert!(logs.config.cast_unsupported_attr_value_types_to_string);

    let p = IngestProcessor::new(
        catalog.clone(),
        registry,
        SluiceConfig::default(),
        manifests,
        Arc::new(NeverPromote),
    );
    let docs = vec![doc(json!({"msg": "a"})), doc(json!({"msg": "b", "tags": []}))];
    let report = p.ingest("logs", docs).await.unwrap();
    assert!(!report.created);
    assert_eq!(report.rows, 2);
    let insert = catalog.executed().pop().unwrap();
    assert!(insert.contains("\"attributes_string_key\":[\"tags\"]"));
}

#[tokio::test]
async fn scalar_mismatches_are_dropped_not_coerced() {
    let (catalog, registry, _, p) = processor(SluiceConfig::default());
    let t = registry.insert_if_absent(
        Table::new("v")
            .with_config(TableConfig::only_schema_fields())
            .with_columns([
                Column::new("string_field", Type::nullable(BaseKind::String)),
                Column::new("int_field", Type::nullable(BaseKind::Int64)),
                Column::new("uint8_field", Type::nullable(BaseKind::UInt8)),
            ]),
    );
    t.mark_created();
    let docs = vec![
        doc(json!({"string_field": 10})),
        doc(json!({"int_field": "15"})),
        doc(json!({"uint8_field": 1000})),
        doc(json!({"string_field": "10", "uint8_field": 255})),
    ];
    let report = p.ingest("v", docs).await.unwrap();
    assert_eq!(report.rows, 4);
    assert_eq!(report.dropped, 2);
    let insert = catalog.executed().pop().unwrap();
    assert!(insert.contains("\"int_field\":\"15\""));
    assert!(!insert.contains("\"string_field\":10"));
    assert!(!insert.contains("1000"));
}
