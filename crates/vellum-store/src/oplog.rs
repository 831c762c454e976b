//! Durable operation log — append-only, crash-safe record of mutation intents.
//!
//! Layout: one JSON record per line in `operations.log`. Record kinds:
//!   - `enqueue` — the full operation as submitted
//!   - `status`  — a lifecycle transition plus retry bookkeeping
//!   - `conflict` — upsert of a conflict record (conflicts ride the log so
//!     the durable layout stays at exactly three stores)
//!
//! Every append is fsync'd before the call returns, so an acknowledged
//! enqueue survives a process crash immediately after. On open the file is
//! replayed into an in-memory index; a torn final line (crash mid-append)
//! is dropped with a warning, any other malformed line is a fatal error.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use vellum_core::types::{
    unix_now, unix_now_ms, Conflict, ConflictStatus, OpPayload, OpStatus, Operation,
    RemoteSnapshot, SyncStatusSummary,
};
use vellum_core::{VellumError, VellumResult};

/// Retry and validation limits applied by the log.
#[derive(Debug, Clone)]
pub struct LogPolicy {
    /// Attempts before an operation is marked Failed.
    pub max_attempts: u32,
    /// First retry delay in milliseconds.
    pub retry_base_ms: u64,
    /// Retry delay ceiling in milliseconds.
    pub retry_cap_ms: u64,
    /// Maximum payload size accepted at enqueue.
    pub max_payload_bytes: usize,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            retry_base_ms: 2_000,
            retry_cap_ms: 300_000,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

impl LogPolicy {
    /// Delay before retry number `attempt` (0-based): base·2ⁿ, capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.retry_base_ms
            .saturating_mul(1u64 << attempt.min(32))
            .min(self.retry_cap_ms)
    }
}

impl From<&vellum_core::config::SyncConfig> for LogPolicy {
    fn from(cfg: &vellum_core::config::SyncConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            retry_base_ms: cfg.retry_base_ms,
            retry_cap_ms: cfg.retry_cap_ms,
            max_payload_bytes: cfg.max_payload_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rec", rename_all = "snake_case")]
enum LogRecord {
    Enqueue {
        op: Operation,
    },
    Status {
        op_id: Uuid,
        status: OpStatus,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        retry_count: u32,
        #[serde(default)]
        not_before_ms: u64,
        #[serde(default)]
        remote_cursor: Option<u64>,
        at: u64,
    },
    Conflict {
        conflict: Conflict,
    },
}

/// Append-only write-ahead log of operations, with an in-memory index.
#[derive(Debug)]
pub struct OperationLog {
    path: PathBuf,
    file: File,
    policy: LogPolicy,
    ops: HashMap<Uuid, Operation>,
    by_idempotency: HashMap<String, Uuid>,
    seq_by_device: HashMap<String, u64>,
    /// Paths with an operation currently Syncing (single-flight lock).
    in_flight: HashSet<String>,
    conflicts: HashMap<Uuid, Conflict>,
    /// Path → open conflict id. At most one open conflict per path.
    open_by_path: HashMap<String, Uuid>,
}

impl OperationLog {
    /// Open (or create) the log at `path` and replay it into memory.
    pub fn open(path: &Path, policy: LogPolicy) -> VellumResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut log = OperationLog {
            path: path.to_path_buf(),
            file: OpenOptions::new().create(true).append(true).open(path)?,
            policy,
            ops: HashMap::new(),
            by_idempotency: HashMap::new(),
            seq_by_device: HashMap::new(),
            in_flight: HashSet::new(),
            conflicts: HashMap::new(),
            open_by_path: HashMap::new(),
        };
        log.replay()?;
        Ok(log)
    }

    fn replay(&mut self) -> VellumResult<()> {
        let content = std::fs::read_to_string(&self.path)?;
        let lines: Vec<&str> = content.lines().collect();

        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) if i == lines.len() - 1 => {
                    // Torn final line from a crash mid-append
                    tracing::warn!(path = %self.path.display(), "dropping torn log tail: {e}");
                    continue;
                }
                Err(e) => {
                    return Err(VellumError::Fatal(format!(
                        "corrupt log record at {}:{}: {e}",
                        self.path.display(),
                        i + 1
                    )));
                }
            };
            self.index(record);
        }

        tracing::debug!(
            path = %self.path.display(),
            ops = self.ops.len(),
            conflicts = self.conflicts.len(),
            "operation log replayed"
        );
        Ok(())
    }

    fn index(&mut self, record: LogRecord) {
        match record {
            LogRecord::Enqueue { op } => {
                let seq = self.seq_by_device.entry(op.device_id.clone()).or_insert(0);
                *seq = (*seq).max(op.local_seq);
                if op.status == OpStatus::Syncing {
                    self.in_flight.insert(op.target_path.clone());
                }
                self.by_idempotency.insert(op.idempotency_key.clone(), op.id);
                self.ops.insert(op.id, op);
            }
            LogRecord::Status {
                op_id,
                status,
                error,
                retry_count,
                not_before_ms,
                remote_cursor,
                ..
            } => {
                if let Some(op) = self.ops.get_mut(&op_id) {
                    if op.status == OpStatus::Syncing && status != OpStatus::Syncing {
                        self.in_flight.remove(&op.target_path);
                    }
                    if status == OpStatus::Syncing {
                        self.in_flight.insert(op.target_path.clone());
                    }
                    op.status = status;
                    op.last_error = error;
                    op.retry_count = retry_count;
                    op.not_before_ms = not_before_ms;
                    op.remote_cursor = remote_cursor;
                }
            }
            LogRecord::Conflict { conflict } => {
                match conflict.status {
                    ConflictStatus::Unresolved => {
                        self.open_by_path.insert(conflict.path.clone(), conflict.id);
                    }
                    ConflictStatus::Resolved => {
                        if self.open_by_path.get(&conflict.path) == Some(&conflict.id) {
                            self.open_by_path.remove(&conflict.path);
                        }
                    }
                }
                self.conflicts.insert(conflict.id, conflict);
            }
        }
    }

    /// Serialize a record, append it, and fsync before returning.
    fn append(&mut self, record: &LogRecord) -> VellumResult<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| VellumError::Fatal(format!("serializing log record: {e}")))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;
        Ok(())
    }

    // ── Enqueue ──────────────────────────────────────────────────────────────

    /// Validate and durably append a new operation.
    ///
    /// Re-submitting a known `idempotency_key` returns the existing id
    /// without writing a duplicate record. The call does no network I/O.
    pub fn enqueue(
        &mut self,
        device_id: &str,
        target_path: &str,
        payload: OpPayload,
        based_on_version: u64,
        idempotency_key: &str,
    ) -> VellumResult<Uuid> {
        if let Some(&existing) = self.by_idempotency.get(idempotency_key) {
            tracing::debug!(key = idempotency_key, "enqueue replay, returning existing op");
            return Ok(existing);
        }

        validate_operation(target_path, &payload, self.policy.max_payload_bytes)?;
        if idempotency_key.is_empty() {
            return Err(VellumError::Validation("idempotency key is empty".into()));
        }
        if device_id.is_empty() {
            return Err(VellumError::Validation("device id is empty".into()));
        }

        let seq = self.seq_by_device.entry(device_id.to_string()).or_insert(0);
        *seq += 1;

        let op = Operation {
            id: Uuid::new_v4(),
            idempotency_key: idempotency_key.to_string(),
            device_id: device_id.to_string(),
            target_path: target_path.to_string(),
            payload,
            based_on_version,
            local_seq: *seq,
            created_at: unix_now(),
            status: OpStatus::Pending,
            retry_count: 0,
            last_error: None,
            not_before_ms: 0,
            remote_cursor: None,
        };
        let id = op.id;

        self.append(&LogRecord::Enqueue { op: op.clone() })?;
        self.by_idempotency.insert(op.idempotency_key.clone(), id);
        self.ops.insert(id, op);

        tracing::debug!(op_id = %id, path = target_path, "operation enqueued");
        Ok(id)
    }

    // ── Scheduling ───────────────────────────────────────────────────────────

    /// Claim the next ready operation for `device_id`.
    ///
    /// Returns the oldest Pending operation whose path has no operation
    /// currently Syncing and no open conflict (a conflict's own resolution
    /// operation is allowed through), and whose backoff window has elapsed.
    /// The operation is transitioned Pending→Syncing before being returned,
    /// so two workers can never claim the same path concurrently.
    pub fn next_ready(&mut self, device_id: &str) -> VellumResult<Option<Operation>> {
        self.next_ready_at(device_id, unix_now_ms())
    }

    pub fn next_ready_at(
        &mut self,
        device_id: &str,
        now_ms: u64,
    ) -> VellumResult<Option<Operation>> {
        let mut head: Option<&Operation> = None;

        for op in self.ops.values() {
            if op.device_id != device_id
                || op.status != OpStatus::Pending
                || op.not_before_ms > now_ms
                || self.in_flight.contains(&op.target_path)
            {
                continue;
            }
            if let Some(conflict_id) = self.open_by_path.get(&op.target_path) {
                // The resolution op itself may pass the pause, and once a
                // marker-stage attempt exists, so may follow-up edits built
                // on the attempt's result (marker cleanup). Everything at or
                // before the attempt's base stays paused.
                let allowed = match self.conflicts.get(conflict_id).and_then(|c| c.resolution_op_id)
                {
                    Some(rid) if rid == op.id => true,
                    Some(rid) => self
                        .ops
                        .get(&rid)
                        .is_some_and(|r| op.based_on_version > r.based_on_version),
                    None => false,
                };
                if !allowed {
                    continue;
                }
            }

            let better = match head {
                None => true,
                // Causal order within a path, submission order across paths
                Some(h) if h.target_path == op.target_path => {
                    (op.based_on_version, op.local_seq) < (h.based_on_version, h.local_seq)
                }
                Some(h) => op.local_seq < h.local_seq,
            };
            if better {
                head = Some(op);
            }
        }

        let Some(id) = head.map(|op| op.id) else {
            return Ok(None);
        };
        self.mark(id, OpStatus::Syncing, None)?;
        Ok(self.ops.get(&id).cloned())
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Transition an operation's status, appending the change durably.
    pub fn mark(&mut self, op_id: Uuid, status: OpStatus, error: Option<String>) -> VellumResult<()> {
        let op = self
            .ops
            .get(&op_id)
            .ok_or_else(|| VellumError::NotFound(format!("operation {op_id}")))?;

        let legal = matches!(
            (op.status, status),
            (OpStatus::Pending, OpStatus::Syncing)
                // A pulled echo of our own push acknowledges a Pending op
                | (OpStatus::Pending, OpStatus::Applied)
                // A pulled divergence conflicts a Pending op
                | (OpStatus::Pending, OpStatus::Conflicted)
                | (OpStatus::Syncing, OpStatus::Applied)
                | (OpStatus::Syncing, OpStatus::Conflicted)
                | (OpStatus::Syncing, OpStatus::Failed)
                | (OpStatus::Syncing, OpStatus::Pending)
                | (OpStatus::Failed, OpStatus::Pending)
        );
        if !legal {
            return Err(VellumError::Fatal(format!(
                "illegal transition {:?} → {status:?} for operation {op_id}",
                op.status
            )));
        }

        let mut updated = op.clone();
        updated.status = status;
        updated.last_error = error;
        if status == OpStatus::Pending && op.status == OpStatus::Failed {
            // Operator re-queue: fresh retry budget
            updated.retry_count = 0;
            updated.not_before_ms = 0;
        }
        self.commit_status(updated)
    }

    /// Mark an operation Applied, recording the remote-assigned cursor used
    /// later for compaction.
    pub fn mark_applied(&mut self, op_id: Uuid, remote_cursor: Option<u64>) -> VellumResult<()> {
        let op = self
            .ops
            .get(&op_id)
            .ok_or_else(|| VellumError::NotFound(format!("operation {op_id}")))?;
        if !matches!(op.status, OpStatus::Syncing | OpStatus::Pending) {
            return Err(VellumError::Fatal(format!(
                "illegal transition {:?} → Applied for operation {op_id}",
                op.status
            )));
        }

        let mut updated = op.clone();
        updated.status = OpStatus::Applied;
        updated.last_error = None;
        updated.remote_cursor = remote_cursor;
        self.commit_status(updated)
    }

    /// Record a transient failure: bump the retry counter and either
    /// re-queue with backoff or, once the attempt budget is spent, mark the
    /// operation Failed. Returns the resulting status.
    pub fn record_transient_failure(&mut self, op_id: Uuid, error: &str) -> VellumResult<OpStatus> {
        self.record_transient_failure_at(op_id, error, unix_now_ms())
    }

    pub fn record_transient_failure_at(
        &mut self,
        op_id: Uuid,
        error: &str,
        now_ms: u64,
    ) -> VellumResult<OpStatus> {
        let op = self
            .ops
            .get(&op_id)
            .ok_or_else(|| VellumError::NotFound(format!("operation {op_id}")))?;
        if op.status != OpStatus::Syncing {
            return Err(VellumError::Fatal(format!(
                "transient failure recorded for non-Syncing operation {op_id}"
            )));
        }

        let mut updated = op.clone();
        updated.retry_count += 1;
        updated.last_error = Some(error.to_string());

        if updated.retry_count >= self.policy.max_attempts {
            updated.status = OpStatus::Failed;
            tracing::warn!(
                op_id = %op_id,
                attempts = updated.retry_count,
                "operation failed after exhausting retries"
            );
        } else {
            updated.status = OpStatus::Pending;
            updated.not_before_ms = now_ms + self.policy.delay_ms(updated.retry_count - 1);
        }

        let status = updated.status;
        self.commit_status(updated)?;
        Ok(status)
    }

    /// Cancellation: an in-flight operation goes back to Pending untouched,
    /// with no retry penalty, so a retry is always safe.
    pub fn release(&mut self, op_id: Uuid) -> VellumResult<()> {
        self.mark(op_id, OpStatus::Pending, None)
    }

    /// Operator decision: re-queue a Failed operation.
    pub fn requeue_failed(&mut self, op_id: Uuid) -> VellumResult<()> {
        self.mark(op_id, OpStatus::Pending, None)
    }

    fn commit_status(&mut self, updated: Operation) -> VellumResult<()> {
        self.append(&LogRecord::Status {
            op_id: updated.id,
            status: updated.status,
            error: updated.last_error.clone(),
            retry_count: updated.retry_count,
            not_before_ms: updated.not_before_ms,
            remote_cursor: updated.remote_cursor,
            at: unix_now(),
        })?;

        let old = self.ops.get(&updated.id);
        if let Some(old) = old {
            if old.status == OpStatus::Syncing && updated.status != OpStatus::Syncing {
                self.in_flight.remove(&updated.target_path);
            }
        }
        if updated.status == OpStatus::Syncing {
            self.in_flight.insert(updated.target_path.clone());
        }
        self.ops.insert(updated.id, updated);
        Ok(())
    }

    // ── Conflicts ────────────────────────────────────────────────────────────

    /// Open a conflict for `path`, or extend the existing open one.
    ///
    /// A second divergence on an already-conflicted path updates the remote
    /// snapshot on the existing record rather than creating a sibling; the
    /// original base version (the true common ancestor) is kept.
    pub fn open_conflict(
        &mut self,
        path: &str,
        base_version: u64,
        local_op_id: Uuid,
        remote_snapshot: RemoteSnapshot,
    ) -> VellumResult<Uuid> {
        if let Some(&existing) = self.open_by_path.get(path) {
            let mut conflict = self
                .conflicts
                .get(&existing)
                .cloned()
                .ok_or_else(|| VellumError::Fatal(format!("dangling conflict index for {path}")))?;
            conflict.remote_snapshot = remote_snapshot;
            self.append(&LogRecord::Conflict {
                conflict: conflict.clone(),
            })?;
            self.conflicts.insert(existing, conflict);
            tracing::debug!(path, conflict_id = %existing, "conflict extended");
            return Ok(existing);
        }

        let conflict = Conflict {
            id: Uuid::new_v4(),
            path: path.to_string(),
            base_version,
            local_op_id,
            remote_snapshot,
            status: ConflictStatus::Unresolved,
            resolution_strategy: None,
            resolution_op_id: None,
            resolved_op_id: None,
            detected_at: unix_now(),
        };
        let id = conflict.id;
        self.append(&LogRecord::Conflict {
            conflict: conflict.clone(),
        })?;
        self.open_by_path.insert(path.to_string(), id);
        self.conflicts.insert(id, conflict);
        tracing::info!(path, conflict_id = %id, "conflict opened");
        Ok(id)
    }

    /// Record a resolution attempt that leaves the conflict open (a merge
    /// with markers). The produced operation may pass the conflict pause.
    pub fn set_resolution_attempt(
        &mut self,
        conflict_id: Uuid,
        strategy: &str,
        resolution_op_id: Uuid,
    ) -> VellumResult<()> {
        let mut conflict = self
            .conflicts
            .get(&conflict_id)
            .cloned()
            .ok_or_else(|| VellumError::NotFound(format!("conflict {conflict_id}")))?;
        conflict.resolution_strategy = Some(strategy.to_string());
        conflict.resolution_op_id = Some(resolution_op_id);
        self.append(&LogRecord::Conflict {
            conflict: conflict.clone(),
        })?;
        self.conflicts.insert(conflict_id, conflict);
        Ok(())
    }

    /// Close a conflict, recording the operation that resolved it.
    pub fn close_conflict(
        &mut self,
        conflict_id: Uuid,
        strategy: &str,
        resolved_op_id: Uuid,
    ) -> VellumResult<()> {
        let mut conflict = self
            .conflicts
            .get(&conflict_id)
            .cloned()
            .ok_or_else(|| VellumError::NotFound(format!("conflict {conflict_id}")))?;
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution_strategy = Some(strategy.to_string());
        conflict.resolution_op_id = Some(resolved_op_id);
        conflict.resolved_op_id = Some(resolved_op_id);
        self.append(&LogRecord::Conflict {
            conflict: conflict.clone(),
        })?;
        if self.open_by_path.get(&conflict.path) == Some(&conflict_id) {
            self.open_by_path.remove(&conflict.path);
        }
        self.conflicts.insert(conflict_id, conflict);
        tracing::info!(conflict_id = %conflict_id, strategy, "conflict resolved");
        Ok(())
    }

    pub fn conflict(&self, id: Uuid) -> Option<&Conflict> {
        self.conflicts.get(&id)
    }

    pub fn open_conflict_for(&self, path: &str) -> Option<&Conflict> {
        self.open_by_path.get(path).and_then(|id| self.conflicts.get(id))
    }

    /// List conflicts, optionally filtered by path, newest first.
    pub fn conflicts(&self, path: Option<&str>) -> Vec<Conflict> {
        let mut out: Vec<Conflict> = self
            .conflicts
            .values()
            .filter(|c| path.map_or(true, |p| c.path == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(a.id.cmp(&b.id)));
        out
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn op(&self, id: Uuid) -> Option<&Operation> {
        self.ops.get(&id)
    }

    pub fn find_by_idempotency(&self, key: &str) -> Option<&Operation> {
        self.by_idempotency.get(key).and_then(|id| self.ops.get(id))
    }

    /// Unapplied (Pending or Syncing) operations on a path, causal order.
    pub fn unapplied_for_path(&self, path: &str) -> Vec<&Operation> {
        let mut out: Vec<&Operation> = self
            .ops
            .values()
            .filter(|op| {
                op.target_path == path
                    && matches!(op.status, OpStatus::Pending | OpStatus::Syncing)
            })
            .collect();
        out.sort_by_key(|op| (op.based_on_version, op.local_seq));
        out
    }

    /// Operations stuck in Syncing (crash recovery input).
    pub fn syncing_ops(&self) -> Vec<Operation> {
        self.ops
            .values()
            .filter(|op| op.status == OpStatus::Syncing)
            .cloned()
            .collect()
    }

    pub fn status_counts(&self, device_id: &str) -> SyncStatusSummary {
        let mut summary = SyncStatusSummary::default();
        for op in self.ops.values() {
            if op.device_id != device_id {
                continue;
            }
            match op.status {
                OpStatus::Pending => summary.pending += 1,
                OpStatus::Syncing => summary.syncing += 1,
                OpStatus::Applied => summary.applied += 1,
                OpStatus::Failed => summary.failed += 1,
                OpStatus::Conflicted => summary.conflicted += 1,
            }
        }
        summary
    }

    pub fn pending_count(&self, device_id: &str) -> usize {
        self.ops
            .values()
            .filter(|op| op.device_id == device_id && op.status == OpStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    /// Drop Applied operations acked at or below `watermark` (and resolved
    /// conflicts), rewriting the log atomically. Returns how many operations
    /// were discarded.
    pub fn compact(&mut self, watermark: u64) -> VellumResult<usize> {
        let before = self.ops.len();
        self.ops.retain(|_, op| {
            !(op.status == OpStatus::Applied
                && op.remote_cursor.is_some_and(|c| c <= watermark))
        });
        self.conflicts
            .retain(|_, c| c.status == ConflictStatus::Unresolved);
        self.by_idempotency
            .retain({
                let ops = &self.ops;
                move |_, id| ops.contains_key(id)
            });
        let dropped = before - self.ops.len();

        // Rewrite: folded state, one enqueue record per surviving op
        let mut ops: Vec<&Operation> = self.ops.values().collect();
        ops.sort_by(|a, b| {
            (&a.device_id, a.local_seq).cmp(&(&b.device_id, b.local_seq))
        });

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            for op in ops {
                let line = serde_json::to_string(&LogRecord::Enqueue { op: (*op).clone() })
                    .map_err(|e| VellumError::Fatal(format!("serializing log record: {e}")))?;
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            for conflict in self.conflicts.values() {
                let line = serde_json::to_string(&LogRecord::Conflict {
                    conflict: conflict.clone(),
                })
                .map_err(|e| VellumError::Fatal(format!("serializing log record: {e}")))?;
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;

        tracing::info!(watermark, dropped, "operation log compacted");
        Ok(dropped)
    }
}

/// Shape validation applied once at the log boundary.
pub fn validate_operation(
    target_path: &str,
    payload: &OpPayload,
    max_payload_bytes: usize,
) -> VellumResult<()> {
    if target_path.is_empty() {
        return Err(VellumError::Validation("target path is empty".into()));
    }
    if target_path.starts_with('/') {
        return Err(VellumError::Validation(format!(
            "target path must be vault-relative: {target_path}"
        )));
    }
    if target_path.split('/').any(|seg| seg == "..") {
        return Err(VellumError::Validation(format!(
            "target path escapes the vault: {target_path}"
        )));
    }
    if payload.len() > max_payload_bytes {
        return Err(VellumError::Validation(format!(
            "payload of {} bytes exceeds the {max_payload_bytes} byte limit",
            payload.len()
        )));
    }
    if let OpPayload::Append { delta } = payload {
        if delta.is_empty() {
            return Err(VellumError::Validation("append delta is empty".into()));
        }
    }
    Ok(())
}
