#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use sluice_core::SluiceConfig;
use sluice_persist::MemoryJsonStore;
use sluice_store::{
    spawn_discovery, CatalogColumn, CatalogTable, ManualClock, MemoryCatalog, Registry,
    TableDiscovery,
};

const HOUR: Duration = Duration::from_secs(3600);

async fn setup() -> (Arc<ManualClock>, Arc<MemoryCatalog>, sluice_store::DiscoveryHandle) {
    let clock = Arc::new(ManualClock::new());
    let logs = CatalogTable::new("logs", [CatalogColumn::new("a", "String")]);
    let catalog = Arc::new(MemoryCatalog::with_tables("default", vec![logs]));
    let manifests = Arc::new(MemoryJsonStore::new());
    let d = TableDiscovery::new(catalog.clone(), Registry::new(), SluiceConfig::default(), manifests)
        .with_clock(clock.clone());
    // Long tick so only reads drive reloads.
    let handle = spawn_discovery(Arc::new(d), HOUR).await;
    (clock, catalog, handle)
}

#[tokio::test]
async fn fresh_reads_do_not_reload() {
    let (clock, _, handle) = setup().await;
    assert_eq!(handle.discovery().reload_count(), 1);

    let snap = handle.snapshot().await;
    assert!(snap.contains("logs"));
    clock.advance(Duration::from_secs(60));
    handle.snapshot().await;
    assert_eq!(handle.discovery().reload_count(), 1);
}

#[tokio::test]
async fn stale_read_waits_for_exactly_one_reload() {
    let (clock, catalog, handle) = setup().await;
    catalog.put_table(CatalogTable::new("late", [CatalogColumn::new("b", "Int64")]));

    clock.advance(Duration::from_secs(16 * 60));
    let snap = handle.snapshot().await;
    assert!(snap.contains("late"));
    assert_eq!(handle.discovery().reload_count(), 2);

    // The reload refreshed the publish time.
    handle.snapshot().await;
    assert_eq!(handle.discovery().reload_count(), 2);
}

#[tokio::test]
async fn concurrent_forced_reloads_all_complete() {
    let (_, _, handle) = setup().await;
    let waits = (0..8).map(|_| {
        let h = handle.clone();
        tokio::spawn(async move { h.force_reload().await })
    });
    for r in futures::future::join_all(waits).await {
        assert!(r.unwrap().is_ok());
    }
    let n = handle.discovery().reload_count();
    assert!((2..=9).contains(&n), "{n}");
}
