//! Sync engine: orchestrates pull/push/reconcile between the local stores
//! and the remote replica.
//!
//! The version store only ever holds remote-acknowledged state, so local
//! path versions stay aligned with the remote stream: every stream entry
//! for a path bumps its version by exactly one. Local edits wait in the
//! operation log until their push is acked (or conflicts). Reconcile
//! classifies each pulled entry as already-incorporated, an echo of our own
//! push, a fast-forward, or a divergence that opens a conflict.
//!
//! Locking discipline: the log lock is taken before the notes lock, which
//! is taken before the registry lock, and no lock is ever held across a
//! remote call.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vellum_core::config::SyncConfig;
use vellum_core::types::{
    unix_now, AppliedOp, Conflict, Note, OpPayload, OpStatus, Operation, SessionStatus,
    SyncSession, SyncStatusSummary,
};
use vellum_core::{VellumError, VellumResult};
use vellum_store::notes::ApplyError;
use vellum_store::{DeviceRegistry, OperationLog, VersionStore};

use crate::remote::{AckOutcome, RemoteError, RemoteOp, RemoteReplica};
use crate::resolver::MergeAssistant;

/// Outcome of pushing one claimed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// Acked and applied locally.
    Applied,
    /// Idempotency replay on the remote; treated as success.
    Duplicate,
    /// Remote moved past our base; a conflict record was opened.
    Conflicted,
    /// Rejected or exhausted; surfaced through `get_sync_status`.
    Failed,
    /// Transient failure; the operation is Pending again with backoff.
    Deferred,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    pub applied: usize,
    pub duplicates: usize,
    pub conflicted: usize,
    pub failed: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Stream entries processed.
    pub pulled: usize,
    /// Entries applied to the version store (fast-forwards and echoes).
    pub applied: usize,
    /// Entries that were echoes of our own pushes.
    pub echoes: usize,
    /// Entries folded into conflict records.
    pub conflicts: usize,
}

/// The sync engine and the service facade exposed to callers.
pub struct SyncEngine<R: RemoteReplica> {
    log: Arc<Mutex<OperationLog>>,
    notes: Arc<Mutex<VersionStore>>,
    devices: Arc<Mutex<DeviceRegistry>>,
    remote: Arc<R>,
    config: SyncConfig,
    device_id: String,
    pub(crate) assistant: Option<Arc<dyn MergeAssistant>>,
    sessions: Arc<Mutex<Vec<SyncSession>>>,
}

impl<R: RemoteReplica> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            notes: self.notes.clone(),
            devices: self.devices.clone(),
            remote: self.remote.clone(),
            config: self.config.clone(),
            device_id: self.device_id.clone(),
            assistant: self.assistant.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

impl<R: RemoteReplica> SyncEngine<R> {
    pub fn new(
        log: OperationLog,
        notes: VersionStore,
        devices: DeviceRegistry,
        remote: Arc<R>,
        config: SyncConfig,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            log: Arc::new(Mutex::new(log)),
            notes: Arc::new(Mutex::new(notes)),
            devices: Arc::new(Mutex::new(devices)),
            remote,
            config,
            device_id: device_id.into(),
            assistant: None,
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Install an external merge assistant for the `External` strategy.
    pub fn with_assistant(mut self, assistant: Arc<dyn MergeAssistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn log_handle(&self) -> &Arc<Mutex<OperationLog>> {
        &self.log
    }

    pub(crate) fn notes_handle(&self) -> &Arc<Mutex<VersionStore>> {
        &self.notes
    }

    // ── Service facade ───────────────────────────────────────────────────────

    /// Validate and durably enqueue a mutation intent. Returns before any
    /// network I/O happens.
    pub async fn enqueue_operation(
        &self,
        target_path: &str,
        payload: OpPayload,
        based_on_version: u64,
        idempotency_key: &str,
    ) -> VellumResult<Uuid> {
        self.log.lock().await.enqueue(
            &self.device_id,
            target_path,
            payload,
            based_on_version,
            idempotency_key,
        )
    }

    /// Converged (remote-acknowledged) state of a path.
    pub async fn get_note(&self, path: &str) -> Option<Note> {
        self.notes.lock().await.read(path).cloned()
    }

    /// Applied history of a path, oldest first.
    pub async fn read_history(&self, path: &str) -> Vec<AppliedOp> {
        self.notes.lock().await.read_history(path).to_vec()
    }

    /// Version new operations on the path should be based on.
    pub async fn head_version(&self, path: &str) -> u64 {
        self.notes.lock().await.head_version(path)
    }

    pub async fn get_sync_status(&self) -> SyncStatusSummary {
        let mut summary = self.log.lock().await.status_counts(&self.device_id);
        if let Some(device) = self.devices.lock().await.find_by_id(&self.device_id) {
            summary.last_cursor = device.last_cursor;
            summary.last_sync_at = device.last_sync_at;
        }
        summary
    }

    pub async fn list_conflicts(&self, path: Option<&str>) -> Vec<Conflict> {
        self.log.lock().await.conflicts(path)
    }

    pub async fn op(&self, id: Uuid) -> Option<Operation> {
        self.log.lock().await.op(id).cloned()
    }

    /// Operator decision: put a Failed operation back in the queue.
    pub async fn requeue_failed(&self, op_id: Uuid) -> VellumResult<()> {
        self.log.lock().await.requeue_failed(op_id)
    }

    pub async fn last_sessions(&self) -> Vec<SyncSession> {
        self.sessions.lock().await.clone()
    }

    // ── Crash recovery ───────────────────────────────────────────────────────

    /// Resolve operations stuck in Syncing after a crash.
    ///
    /// The version store's head op id is the commit point: an op that made
    /// it into the store is Applied, anything else goes back to Pending.
    /// The result is always exactly the pre- or post-apply state.
    pub async fn recover(&self) -> VellumResult<usize> {
        let mut log = self.log.lock().await;
        let notes = self.notes.lock().await;

        let stuck = log.syncing_ops();
        let recovered = stuck.len();
        for op in stuck {
            if notes.last_applied_op(&op.target_path) == Some(op.id) {
                tracing::info!(op_id = %op.id, path = %op.target_path, "recovery: apply committed");
                log.mark_applied(op.id, None)?;
            } else {
                tracing::info!(op_id = %op.id, path = %op.target_path, "recovery: released to pending");
                log.release(op.id)?;
            }
        }
        Ok(recovered)
    }

    // ── Push ─────────────────────────────────────────────────────────────────

    /// Claim and push one ready operation.
    ///
    /// Returns `None` when nothing is ready. Cancellation releases the
    /// claimed operation back to Pending untouched, so a retry is safe.
    pub async fn push_next(
        &self,
        cancel: &CancellationToken,
    ) -> VellumResult<Option<PushResult>> {
        let claimed = self.log.lock().await.next_ready(&self.device_id)?;
        let Some(op) = claimed else {
            return Ok(None);
        };

        let ops = [op.clone()];
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.log.lock().await.release(op.id)?;
                tracing::debug!(op_id = %op.id, "push cancelled, operation released");
                return Ok(None);
            }
            result = tokio::time::timeout(self.config.request_timeout(), self.remote.push(&ops)) => result,
        };

        let acks = match result {
            Err(_) => return self.defer(op.id, "push request timed out").await,
            Ok(Err(RemoteError::Transient(e))) => return self.defer(op.id, &e).await,
            Ok(Err(RemoteError::Fatal(e))) => {
                self.log
                    .lock()
                    .await
                    .mark(op.id, OpStatus::Failed, Some(e.clone()))?;
                tracing::error!(op_id = %op.id, error = %e, "push failed fatally");
                return Ok(Some(PushResult::Failed));
            }
            Ok(Ok(acks)) => acks,
        };

        let Some(ack) = acks
            .into_iter()
            .find(|a| a.op_id == op.id || a.idempotency_key == op.idempotency_key)
        else {
            return self.defer(op.id, "remote returned no ack for operation").await;
        };

        match ack.outcome {
            AckOutcome::Applied { version, cursor } => {
                self.commit_acked(&op, cursor).await?;
                tracing::info!(
                    op_id = %op.id,
                    path = %op.target_path,
                    version,
                    cursor,
                    "operation pushed and applied"
                );
                Ok(Some(PushResult::Applied))
            }
            AckOutcome::Duplicate { version, cursor } => {
                self.commit_acked(&op, cursor).await?;
                tracing::info!(
                    op_id = %op.id,
                    path = %op.target_path,
                    version,
                    "push was an idempotency replay, treated as success"
                );
                Ok(Some(PushResult::Duplicate))
            }
            AckOutcome::Stale { snapshot } => {
                let mut log = self.log.lock().await;
                log.mark(
                    op.id,
                    OpStatus::Conflicted,
                    Some(format!(
                        "based on version {} but remote is at {}",
                        op.based_on_version, snapshot.version
                    )),
                )?;
                log.open_conflict(&op.target_path, op.based_on_version, op.id, snapshot)?;
                Ok(Some(PushResult::Conflicted))
            }
            AckOutcome::Rejected { reason } => {
                self.log
                    .lock()
                    .await
                    .mark(op.id, OpStatus::Failed, Some(reason.clone()))?;
                tracing::error!(op_id = %op.id, reason = %reason, "push rejected by remote");
                Ok(Some(PushResult::Failed))
            }
        }
    }

    /// Apply an acked operation locally and close it out in the log,
    /// tolerating the pull path having gotten there first.
    async fn commit_acked(&self, op: &Operation, cursor: u64) -> VellumResult<()> {
        let mut log = self.log.lock().await;
        let mut notes = self.notes.lock().await;

        match notes.apply(op) {
            Ok(_) => {}
            Err(ApplyError::StaleVersion { .. })
                if notes
                    .read_history(&op.target_path)
                    .iter()
                    .any(|entry| entry.op_id == op.id) =>
            {
                // Already folded in by a pulled echo
            }
            Err(e) => {
                log.mark(op.id, OpStatus::Failed, Some(e.to_string()))?;
                return Err(VellumError::Fatal(format!(
                    "acked operation {} failed local apply: {e}",
                    op.id
                )));
            }
        }

        if log
            .op(op.id)
            .is_some_and(|o| matches!(o.status, OpStatus::Syncing | OpStatus::Pending))
        {
            log.mark_applied(op.id, Some(cursor))?;
        }
        Ok(())
    }

    async fn defer(&self, op_id: Uuid, error: &str) -> VellumResult<Option<PushResult>> {
        let status = self
            .log
            .lock()
            .await
            .record_transient_failure(op_id, error)?;
        tracing::warn!(op_id = %op_id, error, ?status, "transient push failure");
        Ok(Some(if status == OpStatus::Failed {
            PushResult::Failed
        } else {
            PushResult::Deferred
        }))
    }

    /// Push everything currently ready, serially.
    pub async fn push(&self) -> VellumResult<PushStats> {
        let cancel = CancellationToken::new();
        let mut stats = PushStats::default();
        while let Some(result) = self.push_next(&cancel).await? {
            match result {
                PushResult::Applied => stats.applied += 1,
                PushResult::Duplicate => stats.duplicates += 1,
                PushResult::Conflicted => stats.conflicted += 1,
                PushResult::Failed => stats.failed += 1,
                PushResult::Deferred => stats.deferred += 1,
            }
        }
        Ok(stats)
    }

    // ── Pull / reconcile ─────────────────────────────────────────────────────

    /// Fetch the stream since our cursor and reconcile it, then advance the
    /// cursor and liveness in the registry. A device flagged for full
    /// resync re-reads the stream from the beginning.
    pub async fn pull_and_reconcile(&self) -> VellumResult<ReconcileStats> {
        let (since, full_resync) = {
            let devices = self.devices.lock().await;
            let device = devices
                .find_by_id(&self.device_id)
                .ok_or_else(|| VellumError::NotFound(format!("device {}", self.device_id)))?;
            if device.needs_full_resync {
                (0, true)
            } else {
                (device.last_cursor, false)
            }
        };
        if full_resync {
            tracing::warn!(device = %self.device_id, "full resync: re-reading stream from start");
        }

        let result =
            tokio::time::timeout(self.config.request_timeout(), self.remote.pull(since)).await;
        let remote_ops = match result {
            Err(_) => return Err(VellumError::TransientNetwork("pull request timed out".into())),
            Ok(Err(RemoteError::Transient(e))) => return Err(VellumError::TransientNetwork(e)),
            Ok(Err(RemoteError::Fatal(e))) => return Err(VellumError::Fatal(e)),
            Ok(Ok(ops)) => ops,
        };

        let stats = self.reconcile(&remote_ops).await?;

        let cursor = remote_ops.last().map(|r| r.cursor).unwrap_or(0).max(since);
        {
            let log = self.log.lock().await;
            let pending = log.pending_count(&self.device_id) as u64;
            drop(log);
            let mut devices = self.devices.lock().await;
            devices.heartbeat(&self.device_id, cursor, pending)?;
            if full_resync {
                devices.clear_full_resync(&self.device_id)?;
                tracing::info!(device = %self.device_id, cursor, "full resync complete");
            }
        }
        Ok(stats)
    }

    /// Apply a batch of stream entries, in cursor order.
    pub async fn reconcile(&self, remote_ops: &[RemoteOp]) -> VellumResult<ReconcileStats> {
        let mut log = self.log.lock().await;
        let mut notes = self.notes.lock().await;
        let mut stats = ReconcileStats::default();

        for rop in remote_ops {
            stats.pulled += 1;
            let path = rop.snapshot.path.as_str();
            let head = notes.head_version(path);

            // Already incorporated, either applied entry by entry or folded
            // into an accepted snapshot. Still close out our own op if this
            // was its echo.
            if rop.snapshot.version <= head {
                let ours = log
                    .find_by_idempotency(&rop.idempotency_key)
                    .filter(|o| o.device_id == self.device_id)
                    .filter(|o| matches!(o.status, OpStatus::Pending | OpStatus::Syncing))
                    .map(|o| o.id);
                if let Some(op_id) = ours {
                    log.mark_applied(op_id, Some(rop.cursor))?;
                    stats.echoes += 1;
                }
                continue;
            }

            // Echo of our own push that never got its ack (crash or lost
            // response): apply it, no conflict.
            let echo = log
                .find_by_idempotency(&rop.idempotency_key)
                .filter(|o| o.device_id == self.device_id)
                .map(|o| (o.id, o.status));
            if let Some((op_id, status)) = echo {
                if rop.base_version != head {
                    return Err(VellumError::Fatal(format!(
                        "echo out of order on {path}: base {} vs head {head}",
                        rop.base_version
                    )));
                }
                notes
                    .apply_remote(rop.op_id, rop.base_version, &rop.snapshot)
                    .map_err(|e| VellumError::Fatal(format!("applying echo on {path}: {e}")))?;
                if matches!(status, OpStatus::Pending | OpStatus::Syncing) {
                    log.mark_applied(op_id, Some(rop.cursor))?;
                }
                tracing::debug!(
                    path,
                    version = rop.snapshot.version,
                    content_hash = %blake3::hash(rop.snapshot.content.as_bytes()).to_hex(),
                    "echo of own push applied"
                );
                stats.echoes += 1;
                stats.applied += 1;
                continue;
            }

            // An open conflict absorbs every further remote change on the
            // path; nothing is applied until resolution.
            if let Some(conflict) = log.open_conflict_for(path) {
                let (base, local_op) = (conflict.base_version, conflict.local_op_id);
                log.open_conflict(path, base, local_op, rop.snapshot.clone())?;
                stats.conflicts += 1;
                continue;
            }

            if rop.base_version != head {
                return Err(VellumError::Fatal(format!(
                    "stream gap on {path}: entry based on {} but head is {head}",
                    rop.base_version
                )));
            }

            let local_pending = log.unapplied_for_path(path).first().map(|o| o.id);
            match local_pending {
                Some(local_op_id) => {
                    // Divergence: both sides advanced from the same base.
                    // Neither side is applied; exactly one conflict records it.
                    log.mark(
                        local_op_id,
                        OpStatus::Conflicted,
                        Some("concurrent remote write on the same base".into()),
                    )?;
                    log.open_conflict(path, head, local_op_id, rop.snapshot.clone())?;
                    stats.conflicts += 1;
                }
                None => {
                    notes
                        .apply_remote(rop.op_id, rop.base_version, &rop.snapshot)
                        .map_err(|e| {
                            VellumError::Fatal(format!("fast-forward on {path}: {e}"))
                        })?;
                    tracing::debug!(
                        path,
                        version = rop.snapshot.version,
                        writer = %rop.snapshot.device_id,
                        content_hash = %blake3::hash(rop.snapshot.content.as_bytes()).to_hex(),
                        "fast-forwarded remote change"
                    );
                    stats.applied += 1;
                }
            }
        }
        Ok(stats)
    }

    // ── Sessions & GC ────────────────────────────────────────────────────────

    /// One full sync round: pull + reconcile, then push. Transient network
    /// errors are absorbed here and reported through the session status.
    pub async fn sync_once(&self) -> VellumResult<SyncSession> {
        let mut session = SyncSession {
            id: Uuid::new_v4(),
            device_id: self.device_id.clone(),
            started_at: unix_now(),
            completed_at: None,
            pulled: 0,
            pushed: 0,
            status: SessionStatus::Running,
        };

        let mut transient = false;
        match self.pull_and_reconcile().await {
            Ok(stats) => session.pulled = stats.pulled,
            Err(VellumError::TransientNetwork(e)) => {
                tracing::warn!(error = %e, "pull skipped this round");
                transient = true;
            }
            Err(e) => return Err(e),
        }

        if !transient {
            let stats = self.push().await?;
            session.pushed = stats.applied + stats.duplicates;
            if stats.deferred > 0 {
                transient = true;
            }
        }

        session.completed_at = Some(unix_now());
        session.status = if transient {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };

        let mut sessions = self.sessions.lock().await;
        sessions.push(session.clone());
        if sessions.len() > 64 {
            sessions.remove(0);
        }
        Ok(session)
    }

    /// Flag stale devices, then compact the log below the GC watermark.
    /// Returns the number of discarded operations.
    pub async fn gc(&self) -> VellumResult<usize> {
        let watermark = {
            let mut devices = self.devices.lock().await;
            devices.sweep_stale(self.config.freshness_window_secs)?;
            devices.gc_watermark()
        };
        match watermark {
            Some(watermark) if watermark > 0 => self.log.lock().await.compact(watermark),
            _ => Ok(0),
        }
    }
}
