//! Bounded worker pool driving the sync engine.
//!
//! Each round pulls and reconciles the remote stream, then fans pushes out
//! to a small pool of workers. Workers claim operations through the log, so
//! per-path work is strictly serialized (the claim is the single-flight
//! lock) while unrelated paths push in parallel. Shutdown cancels in-flight
//! network calls — claimed operations go back to Pending — and drains the
//! pool before returning.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vellum_core::{VellumError, VellumResult};

use crate::engine::SyncEngine;
use crate::remote::RemoteReplica;

pub struct Scheduler<R: RemoteReplica + 'static> {
    engine: SyncEngine<R>,
    workers: usize,
    interval: Duration,
    gc_interval: Duration,
    semaphore: Arc<Semaphore>,
}

impl<R: RemoteReplica + 'static> Scheduler<R> {
    pub fn new(engine: SyncEngine<R>) -> Self {
        let config = engine.config().clone();
        let workers = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            config.workers
        };

        Self {
            engine,
            workers,
            interval: Duration::from_secs(config.sync_interval_secs.max(1)),
            gc_interval: Duration::from_secs(3600),
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// One sync round: pull + reconcile, then push everything ready through
    /// the worker pool. Returns once the pool is idle again.
    pub async fn run_round(&self, cancel: &CancellationToken) -> VellumResult<()> {
        match self.engine.pull_and_reconcile().await {
            Ok(stats) if stats.pulled > 0 => {
                info!(
                    pulled = stats.pulled,
                    applied = stats.applied,
                    conflicts = stats.conflicts,
                    "reconciled remote stream"
                );
            }
            Ok(_) => {}
            Err(VellumError::TransientNetwork(e)) => {
                warn!(error = %e, "pull skipped this round");
            }
            Err(e) => return Err(e),
        }

        for _ in 0..self.workers {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let engine = self.engine.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let _permit = permit; // released when the worker finishes
                while !cancel.is_cancelled() {
                    match engine.push_next(&cancel).await {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "push worker error");
                            break;
                        }
                    }
                }
            });
        }

        // Barrier: every worker from this round is done
        let _ = self.semaphore.acquire_many(self.workers as u32).await;
        Ok(())
    }

    /// Drive rounds until a shutdown signal arrives, then drain.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> VellumResult<()> {
        let cancel = CancellationToken::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut gc_ticker = tokio::time::interval(self.gc_interval);
        gc_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        gc_ticker.tick().await;

        info!(
            workers = self.workers,
            interval_secs = self.interval.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("scheduler: shutdown signal received, draining");
                    break;
                }
                _ = gc_ticker.tick() => {
                    match self.engine.gc().await {
                        Ok(0) => {}
                        Ok(dropped) => info!(dropped, "log compacted"),
                        Err(e) => warn!(error = %e, "log compaction failed"),
                    }
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            info!("scheduler: shutdown during sync round, cancelling");
                            break;
                        }
                        result = self.run_round(&cancel) => {
                            if let Err(e) = result {
                                error!(error = %e, "sync round failed");
                            }
                        }
                    }
                }
            }
        }

        // Abort in-flight network calls; claimed operations are released
        // back to Pending, then wait for every worker to exit.
        cancel.cancel();
        let _ = self.semaphore.acquire_many(self.workers as u32).await;
        info!("scheduler: all in-flight work drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vellum_core::config::SyncConfig;
    use vellum_core::types::OpPayload;
    use vellum_store::{DeviceRegistry, LogPolicy, OperationLog, VersionStore};

    use crate::remote::InMemoryRemote;

    fn make_engine(dir: &TempDir, remote: Arc<InMemoryRemote>) -> SyncEngine<InMemoryRemote> {
        let root = dir.path().join("scheduler");
        let config = SyncConfig {
            workers: 2,
            sync_interval_secs: 1,
            retry_base_ms: 1,
            retry_cap_ms: 8,
            ..SyncConfig::default()
        };
        let log = OperationLog::open(&root.join("operations.log"), LogPolicy::from(&config)).unwrap();
        let notes = VersionStore::open(&root.join("notes.json")).unwrap();
        let mut devices = DeviceRegistry::open(&root.join("devices.json")).unwrap();
        let device_id = devices.register("scheduler-test").unwrap();
        SyncEngine::new(log, notes, devices, remote, config, device_id)
    }

    #[tokio::test]
    async fn round_pushes_ready_operations() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let engine = make_engine(&dir, remote.clone());

        engine
            .enqueue_operation("a.md", OpPayload::Create { content: "alpha".into() }, 0, "k-a")
            .await
            .unwrap();
        engine
            .enqueue_operation("b.md", OpPayload::Create { content: "beta".into() }, 0, "k-b")
            .await
            .unwrap();

        let scheduler = Scheduler::new(engine.clone());
        scheduler.run_round(&CancellationToken::new()).await.unwrap();

        assert_eq!(remote.note("a.md").unwrap().1, "alpha");
        assert_eq!(remote.note("b.md").unwrap().1, "beta");
        assert_eq!(engine.get_sync_status().await.applied, 2);
        assert_eq!(engine.get_sync_status().await.pending, 0);
    }

    #[tokio::test]
    async fn round_is_idle_safe() {
        let dir = TempDir::new().unwrap();
        let engine = make_engine(&dir, Arc::new(InMemoryRemote::new()));

        let scheduler = Scheduler::new(engine);
        scheduler.run_round(&CancellationToken::new()).await.unwrap();
        scheduler.run_round(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_and_returns() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let engine = make_engine(&dir, remote.clone());
        engine
            .enqueue_operation("a.md", OpPayload::Create { content: "alpha".into() }, 0, "k-a")
            .await
            .unwrap();

        let scheduler = Scheduler::new(engine.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        // Give the first round a chance to run, then stop
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("scheduler drained in time")
            .expect("scheduler task completed")
            .expect("scheduler exited cleanly");

        assert_eq!(remote.note("a.md").unwrap().1, "alpha");
    }
}
