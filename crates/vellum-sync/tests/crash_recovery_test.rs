//! Integration tests: crash recovery.
//!
//! A crash between the log claim and the version-store apply (or between
//! the apply and the log's Applied record) must leave the system in either
//! the pre- or post-apply state, never a partial one. The version store's
//! head operation id is the commit point.

use std::sync::Arc;
use tempfile::TempDir;

use vellum_core::config::SyncConfig;
use vellum_core::types::{OpPayload, OpStatus};
use vellum_store::{DeviceRegistry, LogPolicy, OperationLog, VersionStore};
use vellum_sync::{InMemoryRemote, SyncEngine};

fn reopen_engine(root: &std::path::Path, device_id: &str) -> SyncEngine<InMemoryRemote> {
    let config = SyncConfig::default();
    let log = OperationLog::open(&root.join("operations.log"), LogPolicy::from(&config)).unwrap();
    let notes = VersionStore::open(&root.join("notes.json")).unwrap();
    let devices = DeviceRegistry::open(&root.join("devices.json")).unwrap();
    SyncEngine::new(
        log,
        notes,
        devices,
        Arc::new(InMemoryRemote::new()),
        config,
        device_id,
    )
}

/// Crash after the claim but before any apply: the operation is released
/// back to Pending and a retry is safe.
#[tokio::test]
async fn claimed_but_unapplied_operation_returns_to_pending() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("store");

    let op_id = {
        let mut log = OperationLog::open(
            &root.join("operations.log"),
            LogPolicy::from(&SyncConfig::default()),
        )
        .unwrap();
        let id = log
            .enqueue("dev-1", "n.md", OpPayload::Create { content: "x".into() }, 0, "k1")
            .unwrap();
        let claimed = log.next_ready("dev-1").unwrap().unwrap();
        assert_eq!(claimed.status, OpStatus::Syncing);
        id
        // Crash: the claim is durable, nothing was applied
    };

    let engine = reopen_engine(&root, "dev-1");
    assert_eq!(engine.recover().await.unwrap(), 1);

    let op = engine.op(op_id).await.unwrap();
    assert_eq!(op.status, OpStatus::Pending);
    assert!(engine.get_note("n.md").await.is_none());

    // The released operation pushes normally afterwards
    let stats = engine.push().await.unwrap();
    assert_eq!(stats.applied, 1);
    assert_eq!(engine.get_note("n.md").await.unwrap().version, 1);
}

/// Crash after the version-store apply but before the log's Applied record:
/// recovery completes the transition instead of re-running the apply.
#[tokio::test]
async fn applied_to_store_before_crash_is_marked_applied() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("store");

    let op_id = {
        let config = SyncConfig::default();
        let mut log =
            OperationLog::open(&root.join("operations.log"), LogPolicy::from(&config)).unwrap();
        let mut notes = VersionStore::open(&root.join("notes.json")).unwrap();

        let id = log
            .enqueue("dev-1", "n.md", OpPayload::Create { content: "kept".into() }, 0, "k1")
            .unwrap();
        let claimed = log.next_ready("dev-1").unwrap().unwrap();
        notes.apply(&claimed).unwrap();
        id
        // Crash: applied to the store, the log still says Syncing
    };

    let engine = reopen_engine(&root, "dev-1");
    assert_eq!(engine.recover().await.unwrap(), 1);

    let op = engine.op(op_id).await.unwrap();
    assert_eq!(op.status, OpStatus::Applied);

    let note = engine.get_note("n.md").await.unwrap();
    assert_eq!(note.version, 1);
    assert_eq!(note.content, "kept");
    assert_eq!(engine.read_history("n.md").await.len(), 1, "no double apply");
}

/// Replaying the same idempotency key is invisible: one operation, one
/// apply, one history entry.
#[tokio::test]
async fn duplicate_enqueue_yields_identical_state() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("store");
    let config = SyncConfig::default();
    let log = OperationLog::open(&root.join("operations.log"), LogPolicy::from(&config)).unwrap();
    let notes = VersionStore::open(&root.join("notes.json")).unwrap();
    let mut devices = DeviceRegistry::open(&root.join("devices.json")).unwrap();
    let device_id = devices.register("laptop").unwrap();
    let engine = SyncEngine::new(
        log,
        notes,
        devices,
        Arc::new(InMemoryRemote::new()),
        config,
        device_id,
    );

    let payload = OpPayload::Create { content: "once".into() };
    let first = engine
        .enqueue_operation("n.md", payload.clone(), 0, "retried-key")
        .await
        .unwrap();
    let second = engine
        .enqueue_operation("n.md", payload, 0, "retried-key")
        .await
        .unwrap();
    assert_eq!(first, second);

    engine.push().await.unwrap();
    let summary = engine.get_sync_status().await;
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.pending, 0);
    assert_eq!(engine.get_note("n.md").await.unwrap().version, 1);
    assert_eq!(engine.read_history("n.md").await.len(), 1);
}

/// A full restart loses nothing: notes, statuses, and conflicts all come
/// back from the three stores.
#[tokio::test]
async fn restart_preserves_durable_state() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("store");
    let remote = Arc::new(InMemoryRemote::new());

    let device_id = {
        let config = SyncConfig::default();
        let log =
            OperationLog::open(&root.join("operations.log"), LogPolicy::from(&config)).unwrap();
        let notes = VersionStore::open(&root.join("notes.json")).unwrap();
        let mut devices = DeviceRegistry::open(&root.join("devices.json")).unwrap();
        let device_id = devices.register("laptop").unwrap();
        let engine = SyncEngine::new(log, notes, devices, remote.clone(), config, device_id.clone());

        engine
            .enqueue_operation("a.md", OpPayload::Create { content: "alpha".into() }, 0, "k1")
            .await
            .unwrap();
        engine
            .enqueue_operation("b.md", OpPayload::Create { content: "beta".into() }, 0, "k2")
            .await
            .unwrap();
        engine.sync_once().await.unwrap();
        device_id
    };

    let engine = reopen_engine(&root, &device_id);
    assert_eq!(engine.recover().await.unwrap(), 0, "nothing was in flight");

    let summary = engine.get_sync_status().await;
    assert_eq!(summary.applied, 2);
    assert_eq!(engine.get_note("a.md").await.unwrap().content, "alpha");
    assert_eq!(engine.get_note("b.md").await.unwrap().content, "beta");
    assert!(engine.list_conflicts(None).await.is_empty());
}
