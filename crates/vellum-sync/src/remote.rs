//! Remote replica contract and reference implementations.
//!
//! The wire protocol is two calls: `push(ops) -> acks` and
//! `pull(since_cursor) -> remote_ops`. The remote keeps a linear per-vault
//! operation stream (each entry bumps its path's version by one) and an
//! idempotency cache, so a retried push of unknown outcome is answered with
//! the cached ack instead of a double apply.
//!
//! Two implementations ship with the engine:
//!   - [`InMemoryRemote`] — test double with transient-failure injection
//!   - [`DirRemote`] — the same replica state persisted to a shared
//!     directory (a mounted folder acting as the cloud mirror)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use vellum_core::types::{unix_now, OpPayload, Operation, RemoteSnapshot};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Timeout, 5xx, connection reset. The caller retries with backoff.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The remote rejected the call outright; retrying cannot help.
    #[error("fatal remote error: {0}")]
    Fatal(String),
}

/// One entry in the remote operation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOp {
    /// Position in the stream (starts at 1, dense per vault).
    pub cursor: u64,
    /// Id of the originating operation.
    pub op_id: Uuid,
    /// Idempotency key of the originating operation.
    pub idempotency_key: String,
    /// Path version this change was based on; the resulting version is
    /// `base_version + 1`.
    pub base_version: u64,
    /// Resulting state of the path.
    pub snapshot: RemoteSnapshot,
}

/// Acknowledgment for one pushed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub op_id: Uuid,
    pub idempotency_key: String,
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AckOutcome {
    /// Applied fresh; the stream position is assigned.
    Applied { version: u64, cursor: u64 },
    /// Idempotency replay: the cached result of the first apply.
    Duplicate { version: u64, cursor: u64 },
    /// The operation was based on a version the remote has moved past.
    /// Carries the remote's current state so a conflict can be recorded.
    Stale { snapshot: RemoteSnapshot },
    /// Shape rejection (e.g. create on a live path). Never retried.
    Rejected { reason: String },
}

/// Transport to a remote replica.
///
/// Implementations must deduplicate pushes by idempotency key and serve the
/// stream in cursor order. All calls are bounded by the engine's request
/// timeout and may be cancelled; neither leaves local state half-written.
pub trait RemoteReplica: Send + Sync {
    /// Send local operations; one ack per operation, in order.
    fn push(
        &self,
        ops: &[Operation],
    ) -> impl Future<Output = Result<Vec<Ack>, RemoteError>> + Send;

    /// Fetch stream entries after `since_cursor`, in cursor order.
    fn pull(
        &self,
        since_cursor: u64,
    ) -> impl Future<Output = Result<Vec<RemoteOp>, RemoteError>> + Send;
}

// ── Replica state (shared by both implementations) ───────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplicaNote {
    content: String,
    version: u64,
    deleted: bool,
    device_id: String,
    written_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAck {
    version: u64,
    cursor: u64,
}

/// Server-side state of one replica: note heads, the operation stream, and
/// the idempotency cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaState {
    notes: HashMap<String, ReplicaNote>,
    stream: Vec<RemoteOp>,
    acks_by_key: HashMap<String, CachedAck>,
    next_cursor: u64,
}

impl ReplicaState {
    fn snapshot_of(&self, path: &str) -> RemoteSnapshot {
        match self.notes.get(path) {
            Some(note) => RemoteSnapshot {
                path: path.to_string(),
                content: note.content.clone(),
                version: note.version,
                device_id: note.device_id.clone(),
                written_at: note.written_at,
                deleted: note.deleted,
            },
            None => RemoteSnapshot {
                path: path.to_string(),
                content: String::new(),
                version: 0,
                device_id: String::new(),
                written_at: 0,
                deleted: false,
            },
        }
    }

    /// Apply one pushed operation, mirroring the version store's rules.
    fn push_one(&mut self, op: &Operation) -> Ack {
        if let Some(cached) = self.acks_by_key.get(&op.idempotency_key) {
            tracing::debug!(key = %op.idempotency_key, "push replay, echoing cached ack");
            return Ack {
                op_id: op.id,
                idempotency_key: op.idempotency_key.clone(),
                outcome: AckOutcome::Duplicate {
                    version: cached.version,
                    cursor: cached.cursor,
                },
            };
        }

        let path = op.target_path.as_str();
        let current = self.notes.get(path).map(|n| n.version).unwrap_or(0);
        if op.based_on_version != current {
            return Ack {
                op_id: op.id,
                idempotency_key: op.idempotency_key.clone(),
                outcome: AckOutcome::Stale {
                    snapshot: self.snapshot_of(path),
                },
            };
        }

        let live = self.notes.get(path).map(|n| !n.deleted).unwrap_or(false);
        let (content, deleted) = match &op.payload {
            OpPayload::Create { content } => {
                if live {
                    return self.reject(op, "create on a live path");
                }
                (content.clone(), false)
            }
            OpPayload::Update { content } => {
                if !live {
                    return self.reject(op, "update on a missing path");
                }
                (content.clone(), false)
            }
            OpPayload::Append { delta } => {
                if !live {
                    return self.reject(op, "append on a missing path");
                }
                let mut content = self.notes[path].content.clone();
                content.push_str(delta);
                (content, false)
            }
            OpPayload::Delete => {
                if current == 0 {
                    return self.reject(op, "delete on an unknown path");
                }
                (String::new(), true)
            }
        };

        let version = current + 1;
        self.next_cursor += 1;
        let cursor = self.next_cursor;
        let written_at = unix_now();

        self.notes.insert(
            path.to_string(),
            ReplicaNote {
                content: content.clone(),
                version,
                deleted,
                device_id: op.device_id.clone(),
                written_at,
            },
        );
        self.stream.push(RemoteOp {
            cursor,
            op_id: op.id,
            idempotency_key: op.idempotency_key.clone(),
            base_version: current,
            snapshot: RemoteSnapshot {
                path: path.to_string(),
                content,
                version,
                device_id: op.device_id.clone(),
                written_at,
                deleted,
            },
        });
        self.acks_by_key
            .insert(op.idempotency_key.clone(), CachedAck { version, cursor });

        Ack {
            op_id: op.id,
            idempotency_key: op.idempotency_key.clone(),
            outcome: AckOutcome::Applied { version, cursor },
        }
    }

    fn reject(&self, op: &Operation, reason: &str) -> Ack {
        Ack {
            op_id: op.id,
            idempotency_key: op.idempotency_key.clone(),
            outcome: AckOutcome::Rejected {
                reason: reason.to_string(),
            },
        }
    }

    fn pull(&self, since_cursor: u64) -> Vec<RemoteOp> {
        self.stream
            .iter()
            .filter(|rop| rop.cursor > since_cursor)
            .cloned()
            .collect()
    }

    fn head_cursor(&self) -> u64 {
        self.next_cursor
    }
}

// ── In-memory remote (tests) ─────────────────────────────────────────────────

/// In-memory remote replica with failure injection.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<ReplicaState>,
    /// Next N calls fail with a transient error before touching state.
    fail_next: AtomicU32,
    /// The next push applies server-side, then reports a transient error —
    /// the "timeout of unknown outcome" case.
    fail_after_apply: AtomicBool,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next push apply, then report a transient error.
    pub fn fail_once_after_apply(&self) {
        self.fail_after_apply.store(true, Ordering::SeqCst);
    }

    /// Current (version, content) of a path, for assertions.
    pub fn note(&self, path: &str) -> Option<(u64, String)> {
        let state = self.state.lock().expect("replica state lock");
        state
            .notes
            .get(path)
            .filter(|n| !n.deleted)
            .map(|n| (n.version, n.content.clone()))
    }

    pub fn head_cursor(&self) -> u64 {
        self.state.lock().expect("replica state lock").head_cursor()
    }

    fn take_injected_failure(&self) -> Option<RemoteError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Some(RemoteError::Transient("injected 503".into()));
        }
        None
    }
}

impl RemoteReplica for InMemoryRemote {
    async fn push(&self, ops: &[Operation]) -> Result<Vec<Ack>, RemoteError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }

        let mut state = self.state.lock().expect("replica state lock");
        let acks: Vec<Ack> = ops.iter().map(|op| state.push_one(op)).collect();
        drop(state);

        if self.fail_after_apply.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Transient(
                "connection reset before response".into(),
            ));
        }
        Ok(acks)
    }

    async fn pull(&self, since_cursor: u64) -> Result<Vec<RemoteOp>, RemoteError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        Ok(self.state.lock().expect("replica state lock").pull(since_cursor))
    }
}

// ── Directory-backed remote ──────────────────────────────────────────────────

/// Remote replica persisted to a shared directory (e.g. a mounted folder).
///
/// The whole replica state lives in `replica.json`, rewritten atomically
/// after each accepted push.
pub struct DirRemote {
    db_path: PathBuf,
    state: Mutex<ReplicaState>,
}

impl DirRemote {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("creating remote dir {}: {e}", dir.display()))?;
        let db_path = dir.join("replica.json");

        let state = if db_path.exists() {
            let content = std::fs::read_to_string(&db_path)
                .map_err(|e| anyhow::anyhow!("reading replica state {}: {e}", db_path.display()))?;
            serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("parsing replica state {}: {e}", db_path.display()))?
        } else {
            ReplicaState::default()
        };

        Ok(DirRemote {
            db_path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &ReplicaState) -> Result<(), RemoteError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| RemoteError::Fatal(format!("serializing replica state: {e}")))?;
        let tmp = self.db_path.with_extension("tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| RemoteError::Transient(format!("writing replica state: {e}")))?;
        std::fs::rename(&tmp, &self.db_path)
            .map_err(|e| RemoteError::Transient(format!("renaming replica state: {e}")))?;
        Ok(())
    }
}

impl RemoteReplica for DirRemote {
    async fn push(&self, ops: &[Operation]) -> Result<Vec<Ack>, RemoteError> {
        let mut state = self.state.lock().expect("replica state lock");
        let acks: Vec<Ack> = ops.iter().map(|op| state.push_one(op)).collect();
        self.persist(&state)?;
        Ok(acks)
    }

    async fn pull(&self, since_cursor: u64) -> Result<Vec<RemoteOp>, RemoteError> {
        Ok(self.state.lock().expect("replica state lock").pull(since_cursor))
    }
}
