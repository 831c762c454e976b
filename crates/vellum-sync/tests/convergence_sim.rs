//! Two-device convergence simulation using property-based testing.
//!
//! Devices append distinct lines to a shared note, going through arbitrary
//! interleavings of offline writes and sync rounds; divergences are
//! resolved with the content merge. Invariants checked:
//!   1. No silent loss — every appended line survives, exactly once
//!   2. Eventual convergence — both devices and the remote end identical
//!   3. Version monotonicity — observed versions never move backward
//!   4. Quiescence — draining leaves no pending work and no open conflict

use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

use vellum_core::config::SyncConfig;
use vellum_core::types::{ConflictStatus, OpPayload};
use vellum_store::{DeviceRegistry, LogPolicy, OperationLog, VersionStore};
use vellum_sync::{InMemoryRemote, Strategy as MergeStrategy, SyncEngine};

const NOTE: &str = "journal.md";

#[derive(Debug, Clone)]
enum SimStep {
    /// Device appends a line locally without syncing.
    Write { device: usize },
    /// Device runs a sync round, resolving any divergence it finds.
    Sync { device: usize },
}

fn arb_steps() -> impl Strategy<Value = Vec<SimStep>> {
    prop::collection::vec(
        prop_oneof![
            (0..2usize).prop_map(|device| SimStep::Write { device }),
            (0..2usize).prop_map(|device| SimStep::Sync { device }),
        ],
        1..24,
    )
}

fn make_engine(dir: &TempDir, name: &str, remote: Arc<InMemoryRemote>) -> SyncEngine<InMemoryRemote> {
    let root = dir.path().join(name);
    let config = SyncConfig::default();
    let log = OperationLog::open(&root.join("operations.log"), LogPolicy::from(&config)).unwrap();
    let notes = VersionStore::open(&root.join("notes.json")).unwrap();
    let mut devices = DeviceRegistry::open(&root.join("devices.json")).unwrap();
    let device_id = devices.register(name).unwrap();
    SyncEngine::new(log, notes, devices, remote, config, device_id)
}

/// One sync round plus conflict resolution. Returns whether anything moved.
async fn drive(engine: &SyncEngine<InMemoryRemote>) -> bool {
    let session = engine.sync_once().await.unwrap();
    let mut moved = session.pulled > 0 || session.pushed > 0;

    for conflict in engine.list_conflicts(Some(NOTE)).await {
        if conflict.status == ConflictStatus::Unresolved && conflict.resolution_op_id.is_none() {
            engine
                .resolve_conflict(conflict.id, MergeStrategy::MergeContent)
                .await
                .unwrap();
            moved = true;
        }
    }
    moved
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn interleaved_appends_converge_without_loss(steps in arb_steps()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        rt.block_on(async move {
            let dir = TempDir::new().unwrap();
            let remote = Arc::new(InMemoryRemote::new());
            let engines = [
                make_engine(&dir, "sim-a", remote.clone()),
                make_engine(&dir, "sim-b", remote.clone()),
            ];

            // Shared base
            engines[0]
                .enqueue_operation(NOTE, OpPayload::Create { content: "log\n".into() }, 0, "seed")
                .await
                .unwrap();
            engines[0].sync_once().await.unwrap();
            engines[1].sync_once().await.unwrap();

            let mut lines: Vec<String> = Vec::new();
            let mut last_seen = [1u64, 1u64];

            for step in &steps {
                match step {
                    SimStep::Write { device } => {
                        let line = format!("entry {} from device {device}\n", lines.len() + 1);
                        let base = engines[*device].head_version(NOTE).await;
                        engines[*device]
                            .enqueue_operation(
                                NOTE,
                                OpPayload::Append { delta: line.clone() },
                                base,
                                &format!("write-{}", lines.len() + 1),
                            )
                            .await
                            .unwrap();
                        lines.push(line);
                    }
                    SimStep::Sync { device } => {
                        drive(&engines[*device]).await;
                        let version = engines[*device].head_version(NOTE).await;
                        prop_assert!(
                            version >= last_seen[*device],
                            "version went backward: {} -> {version}",
                            last_seen[*device]
                        );
                        last_seen[*device] = version;
                    }
                }
            }

            // Drain: alternate rounds until both devices go quiet
            for _ in 0..32 {
                let mut quiet = true;
                for engine in &engines {
                    if drive(engine).await {
                        quiet = false;
                    }
                }
                if quiet {
                    break;
                }
            }

            // Quiescence
            for engine in &engines {
                let summary = engine.get_sync_status().await;
                prop_assert_eq!(summary.pending, 0, "pending work left after drain");
                prop_assert_eq!(summary.failed, 0);
                let open = engine
                    .list_conflicts(None)
                    .await
                    .into_iter()
                    .filter(|c| c.status == ConflictStatus::Unresolved)
                    .count();
                prop_assert_eq!(open, 0, "open conflict left after drain");
            }

            // Convergence
            let content_a = engines[0].get_note(NOTE).await.unwrap().content;
            let content_b = engines[1].get_note(NOTE).await.unwrap().content;
            prop_assert_eq!(&content_a, &content_b);
            prop_assert_eq!(remote.note(NOTE).unwrap().1, content_a.clone());

            // No silent loss, no double apply
            for line in &lines {
                prop_assert_eq!(
                    content_a.matches(line.as_str()).count(),
                    1,
                    "line {:?} lost or duplicated in {:?}",
                    line,
                    content_a
                );
            }
            Ok(())
        })?;
    }
}
