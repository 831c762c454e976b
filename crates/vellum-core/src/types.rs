//! Shared data model for the vellum sync engine.
//!
//! All entities are referenced by id through their owning store (operations
//! by the log, notes by the version store, devices by the registry); nothing
//! holds a direct pointer to anything else.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an operation in the log.
///
/// Transitions: Pending → Syncing → {Applied | Conflicted | Failed}.
/// Failed operations may be re-queued as Pending by an operator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Syncing,
    Applied,
    Conflicted,
    Failed,
}

/// Mutation payload, tagged by kind.
///
/// The shape is validated once at the log boundary; downstream code matches
/// exhaustively and never sees an unknown kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpPayload {
    /// Full content for a path that does not exist yet.
    Create { content: String },
    /// Full replacement content for an existing path.
    Update { content: String },
    /// Delta concatenated onto the current content.
    Append { delta: String },
    /// Tombstone the path.
    Delete,
}

impl OpPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            OpPayload::Create { .. } => "create",
            OpPayload::Update { .. } => "update",
            OpPayload::Append { .. } => "append",
            OpPayload::Delete => "delete",
        }
    }

    /// Payload size in bytes (0 for deletes).
    pub fn len(&self) -> usize {
        match self {
            OpPayload::Create { content } | OpPayload::Update { content } => content.len(),
            OpPayload::Append { delta } => delta.len(),
            OpPayload::Delete => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A durable record of an intended mutation.
///
/// Once `status` reaches Applied the record is immutable except for
/// compaction; corrections are always new operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    /// Client-chosen key, stable across retries of the same submission.
    pub idempotency_key: String,
    /// Device that authored the mutation.
    pub device_id: String,
    /// Vault path the mutation targets.
    pub target_path: String,
    pub payload: OpPayload,
    /// The version the author believed was current when editing.
    pub based_on_version: u64,
    /// Monotonic per-device submission counter.
    pub local_seq: u64,
    /// Wall clock at enqueue, unix seconds. Advisory only; never used for
    /// correctness, only as a tie-break component.
    pub created_at: u64,
    pub status: OpStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest unix-millisecond instant the next sync attempt may run.
    #[serde(default)]
    pub not_before_ms: u64,
    /// Remote-assigned cursor once acked. Compaction input.
    #[serde(default)]
    pub remote_cursor: Option<u64>,
}

/// Current state of a vault path in the version store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub path: String,
    pub content: String,
    /// Strictly increasing per successful apply; never reused.
    pub version: u64,
    pub last_writer_device: String,
    pub last_applied_op_id: Uuid,
    /// Deleted paths keep their entry so the version sequence survives a
    /// later re-create.
    #[serde(default)]
    pub deleted: bool,
}

/// One applied mutation in a path's history, kept for audit/undo and as
/// the common-ancestor source for three-way merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedOp {
    pub op_id: Uuid,
    pub device_id: String,
    pub kind: String,
    pub version: u64,
    /// Content snapshot after the apply.
    pub content: String,
    pub applied_at: u64,
}

/// Content + version of a path as seen from the remote replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub path: String,
    pub content: String,
    pub version: u64,
    pub device_id: String,
    pub written_at: u64,
    /// True when the remote state is a deletion.
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

/// A divergence between a local operation and the remote state of a path,
/// both derived from the same base version.
///
/// At most one open conflict exists per path; a new divergence on an
/// already-conflicted path extends the existing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub path: String,
    /// Common ancestor version both sides diverged from.
    pub base_version: u64,
    pub local_op_id: Uuid,
    pub remote_snapshot: RemoteSnapshot,
    pub status: ConflictStatus,
    pub resolution_strategy: Option<String>,
    /// Operation produced by the latest resolution attempt. Allowed through
    /// the conflict pause so marker merges can still propagate.
    #[serde(default)]
    pub resolution_op_id: Option<Uuid>,
    /// Set once the conflict is closed.
    pub resolved_op_id: Option<Uuid>,
    pub detected_at: u64,
}

/// A registered replica and its position in the remote operation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    /// Human-readable device name (e.g., "yoga-laptop").
    pub name: String,
    /// Remote-assigned sequence this device has acknowledged.
    pub last_cursor: u64,
    /// Unix seconds of the last heartbeat.
    pub last_sync_at: u64,
    /// Snapshot of the device's pending-operation count at last heartbeat.
    #[serde(default)]
    pub pending_count: u64,
    pub enrolled_at: u64,
    pub revoked: bool,
    /// Set when the device went silent past the freshness window; it gets a
    /// full resync on reconnect instead of an incremental pull.
    #[serde(default)]
    pub needs_full_resync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// Ephemeral record of one sync engine run, for observability and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: Uuid,
    pub device_id: String,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub pulled: usize,
    pub pushed: usize,
    pub status: SessionStatus,
}

/// Per-device operation counts surfaced to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusSummary {
    pub pending: usize,
    pub syncing: usize,
    pub applied: usize,
    pub failed: usize,
    pub conflicted: usize,
    pub last_cursor: u64,
    pub last_sync_at: u64,
}

/// Current unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix timestamp in milliseconds.
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
