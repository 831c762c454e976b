//! Integration tests: log garbage collection and the stale-device policy.
//!
//! The watermark is the minimum acknowledged cursor across fresh devices; a
//! device silent past the freshness window is excluded from it and forced
//! through a full resync on reconnect instead of an incremental pull.

use std::sync::Arc;
use tempfile::TempDir;

use vellum_core::config::SyncConfig;
use vellum_core::types::{unix_now, OpPayload};
use vellum_store::{DeviceRegistry, LogPolicy, OperationLog, VersionStore};
use vellum_sync::{InMemoryRemote, SyncEngine};

const DAY: u64 = 24 * 3600;

fn open_stores(
    root: &std::path::Path,
    config: &SyncConfig,
) -> (OperationLog, VersionStore, DeviceRegistry) {
    let log = OperationLog::open(&root.join("operations.log"), LogPolicy::from(config)).unwrap();
    let notes = VersionStore::open(&root.join("notes.json")).unwrap();
    let devices = DeviceRegistry::open(&root.join("devices.json")).unwrap();
    (log, notes, devices)
}

/// With every device fresh and caught up, gc compacts all acknowledged
/// operations out of the log.
#[tokio::test]
async fn gc_compacts_below_the_min_fresh_cursor() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("laptop");
    let config = SyncConfig::default();
    let remote = Arc::new(InMemoryRemote::new());

    let (log, notes, mut devices) = open_stores(&root, &config);
    let device_id = devices.register("laptop").unwrap();
    let engine = SyncEngine::new(log, notes, devices, remote.clone(), config, device_id);

    for (i, path) in ["a.md", "b.md", "c.md"].iter().enumerate() {
        engine
            .enqueue_operation(
                path,
                OpPayload::Create { content: format!("note {i}") },
                0,
                &format!("k{i}"),
            )
            .await
            .unwrap();
    }
    engine.sync_once().await.unwrap();
    assert_eq!(engine.get_sync_status().await.applied, 3);

    // Second round pulls the echoes and moves the cursor to the stream head
    engine.sync_once().await.unwrap();
    assert_eq!(engine.get_sync_status().await.last_cursor, 3);

    let dropped = engine.gc().await.unwrap();
    assert_eq!(dropped, 3);

    // Compaction touches the log only; notes and new work are unaffected
    let summary = engine.get_sync_status().await;
    assert_eq!(summary.applied, 0);
    assert_eq!(engine.get_note("b.md").await.unwrap().content, "note 1");
    engine
        .enqueue_operation("d.md", OpPayload::Create { content: "later".into() }, 0, "k9")
        .await
        .unwrap();
    let stats = engine.push().await.unwrap();
    assert_eq!(stats.applied, 1);
}

/// A device silent for 45 days is flagged and excluded, so it no longer
/// holds the watermark back; on reconnect it re-reads the stream from the
/// start instead of resuming from its (now meaningless) cursor.
#[tokio::test]
async fn silent_device_is_excluded_then_fully_resynced() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig::default();
    let remote = Arc::new(InMemoryRemote::new());
    let now = unix_now();

    // Shared registry: an active laptop and a phone last heard from 45 days
    // ago, whose cursor (5) is ahead of anything it actually holds.
    let registry_path = dir.path().join("laptop/devices.json");
    let (log, notes, mut devices) = open_stores(&dir.path().join("laptop"), &config);
    let laptop = devices.register("laptop").unwrap();
    let phone = devices.register("phone").unwrap();
    devices.heartbeat_at(&laptop, 9, 0, now).unwrap();
    devices.heartbeat_at(&phone, 5, 0, now - 45 * DAY).unwrap();

    let engine = SyncEngine::new(log, notes, devices, remote.clone(), config.clone(), laptop);
    engine
        .enqueue_operation("a.md", OpPayload::Create { content: "alpha".into() }, 0, "k1")
        .await
        .unwrap();
    engine
        .enqueue_operation("b.md", OpPayload::Create { content: "beta".into() }, 0, "k2")
        .await
        .unwrap();
    engine.sync_once().await.unwrap();

    // GC: the phone is swept as stale, the laptop's cursor carries the
    // watermark, and both applied operations compact away.
    let dropped = engine.gc().await.unwrap();
    assert_eq!(dropped, 2);

    let registry = DeviceRegistry::open(&registry_path).unwrap();
    let entry = registry.find("phone").unwrap();
    assert!(entry.needs_full_resync);
    assert_eq!(registry.gc_watermark(), Some(9));

    // The phone reconnects with empty local stores. An incremental pull
    // from cursor 5 would see nothing; the resync flag forces a re-read
    // from the start of the stream.
    let (phone_log, phone_notes, _) = open_stores(&dir.path().join("phone"), &config);
    let phone_devices = DeviceRegistry::open(&registry_path).unwrap();
    let phone_engine = SyncEngine::new(
        phone_log,
        phone_notes,
        phone_devices,
        remote.clone(),
        config,
        entry.device_id.clone(),
    );
    phone_engine.sync_once().await.unwrap();

    assert_eq!(phone_engine.get_note("a.md").await.unwrap().content, "alpha");
    assert_eq!(phone_engine.get_note("b.md").await.unwrap().content, "beta");

    let registry = DeviceRegistry::open(&registry_path).unwrap();
    assert!(!registry.find("phone").unwrap().needs_full_resync);
}

/// A device that has never pulled pins the watermark at zero, so nothing
/// is compacted out from under it.
#[tokio::test]
async fn gc_without_a_watermark_discards_nothing() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("laptop");
    let config = SyncConfig::default();
    let remote = Arc::new(InMemoryRemote::new());

    let (log, notes, mut devices) = open_stores(&root, &config);
    let device_id = devices.register("laptop").unwrap();
    let engine = SyncEngine::new(log, notes, devices, remote, config, device_id);

    engine
        .enqueue_operation("a.md", OpPayload::Create { content: "alpha".into() }, 0, "k1")
        .await
        .unwrap();
    // Pushed and acked, but the registry cursor never advanced past 0
    engine.push().await.unwrap();

    assert_eq!(engine.gc().await.unwrap(), 0);
    assert_eq!(engine.get_sync_status().await.applied, 1);
}
