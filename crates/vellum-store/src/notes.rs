//! Version store — authoritative current content and monotonic version per
//! vault path, with the applied history kept for audit, undo, and
//! common-ancestor lookup during merges.
//!
//! The whole store is one JSON document, flushed atomically (temp + rename)
//! after every successful apply, so local persistence completes before the
//! caller is acknowledged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use vellum_core::types::{unix_now, AppliedOp, Note, OpPayload, Operation, RemoteSnapshot};

#[derive(Debug, Error)]
pub enum ApplyError {
    /// `based_on_version` no longer matches the current version. The sync
    /// engine converts this into a conflict rather than overwriting.
    #[error("stale version on {path}: based on {based_on}, current is {current}")]
    StaleVersion {
        path: String,
        based_on: u64,
        current: u64,
    },

    /// Payload kind does not apply to the path's current state (create on a
    /// live path, update/append/delete on a missing one).
    #[error("{kind} does not apply to {path}")]
    KindMismatch { path: String, kind: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    notes: HashMap<String, Note>,
    #[serde(default)]
    history: HashMap<String, Vec<AppliedOp>>,
}

/// Durable note content keyed by path.
pub struct VersionStore {
    db_path: PathBuf,
    notes: HashMap<String, Note>,
    history: HashMap<String, Vec<AppliedOp>>,
}

impl VersionStore {
    /// Load or create the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self, ApplyError> {
        let doc: StoreDoc = if db_path.exists() {
            let content = std::fs::read_to_string(db_path)?;
            serde_json::from_str(&content)?
        } else {
            StoreDoc::default()
        };

        Ok(VersionStore {
            db_path: db_path.to_path_buf(),
            notes: doc.notes,
            history: doc.history,
        })
    }

    /// Apply a local operation.
    ///
    /// Atomically validates `based_on_version` against the current version,
    /// applies the payload by kind, bumps the version, records the writer,
    /// and flushes to disk before returning. Re-applying an operation that
    /// is already the head of its path is a no-op returning the current
    /// version (this is what makes crash recovery and duplicate acks safe).
    pub fn apply(&mut self, op: &Operation) -> Result<u64, ApplyError> {
        let path = op.target_path.as_str();

        if let Some(note) = self.notes.get(path) {
            if note.last_applied_op_id == op.id {
                return Ok(note.version);
            }
        }

        let current = self.head_version(path);
        if op.based_on_version != current {
            return Err(ApplyError::StaleVersion {
                path: path.to_string(),
                based_on: op.based_on_version,
                current,
            });
        }

        let live = self.read(path).is_some();
        let (content, deleted) = match &op.payload {
            OpPayload::Create { content } => {
                if live {
                    return Err(ApplyError::KindMismatch {
                        path: path.to_string(),
                        kind: "create",
                    });
                }
                (content.clone(), false)
            }
            OpPayload::Update { content } => {
                if !live {
                    return Err(ApplyError::KindMismatch {
                        path: path.to_string(),
                        kind: "update",
                    });
                }
                (content.clone(), false)
            }
            OpPayload::Append { delta } => {
                if !live {
                    return Err(ApplyError::KindMismatch {
                        path: path.to_string(),
                        kind: "append",
                    });
                }
                let mut content = self.notes[path].content.clone();
                content.push_str(delta);
                (content, false)
            }
            OpPayload::Delete => {
                // A delete of an already-tombstoned path is a plain version
                // bump; resolution acknowledgments rely on this.
                if current == 0 {
                    return Err(ApplyError::KindMismatch {
                        path: path.to_string(),
                        kind: "delete",
                    });
                }
                (String::new(), true)
            }
        };

        self.commit(
            path,
            content,
            deleted,
            current + 1,
            &op.device_id,
            op.id,
            op.payload.kind(),
        )
    }

    /// Fast-forward application of remote state.
    ///
    /// Used by the sync engine when the remote change is based on exactly
    /// our current version. The remote writer goes into the history like
    /// any other apply.
    pub fn apply_remote(
        &mut self,
        op_id: Uuid,
        base_version: u64,
        snapshot: &RemoteSnapshot,
    ) -> Result<u64, ApplyError> {
        let path = snapshot.path.as_str();

        if let Some(note) = self.notes.get(path) {
            if note.last_applied_op_id == op_id {
                return Ok(note.version);
            }
        }

        let current = self.head_version(path);
        if base_version != current {
            return Err(ApplyError::StaleVersion {
                path: path.to_string(),
                based_on: base_version,
                current,
            });
        }

        let kind = if snapshot.deleted { "delete" } else { "update" };
        let content = if snapshot.deleted {
            String::new()
        } else {
            snapshot.content.clone()
        };
        self.commit(
            path,
            content,
            snapshot.deleted,
            current + 1,
            &snapshot.device_id,
            op_id,
            kind,
        )
    }

    /// Jump the path to a remote snapshot's state.
    ///
    /// Used by the conflict resolver to accept the remote side as the new
    /// base: the remote branch folds into a single local version equal to
    /// the snapshot's, so later stream entries at or below it are already
    /// incorporated. A no-op when the path is already there or past it.
    pub fn accept_snapshot(
        &mut self,
        op_id: Uuid,
        snapshot: &RemoteSnapshot,
    ) -> Result<u64, ApplyError> {
        let path = snapshot.path.as_str();
        let current = self.head_version(path);
        if snapshot.version <= current {
            return Ok(current);
        }

        let kind = if snapshot.deleted { "delete" } else { "update" };
        let content = if snapshot.deleted {
            String::new()
        } else {
            snapshot.content.clone()
        };
        self.commit(
            path,
            content,
            snapshot.deleted,
            snapshot.version,
            &snapshot.device_id,
            op_id,
            kind,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &mut self,
        path: &str,
        content: String,
        deleted: bool,
        version: u64,
        device_id: &str,
        op_id: Uuid,
        kind: &str,
    ) -> Result<u64, ApplyError> {
        self.notes.insert(
            path.to_string(),
            Note {
                path: path.to_string(),
                content: content.clone(),
                version,
                last_writer_device: device_id.to_string(),
                last_applied_op_id: op_id,
                deleted,
            },
        );
        self.history.entry(path.to_string()).or_default().push(AppliedOp {
            op_id,
            device_id: device_id.to_string(),
            kind: kind.to_string(),
            version,
            content,
            applied_at: unix_now(),
        });
        self.flush()?;

        tracing::debug!(path, version, writer = device_id, "note applied");
        Ok(version)
    }

    /// Current note for a path. Tombstoned (deleted) paths read as absent.
    pub fn read(&self, path: &str) -> Option<&Note> {
        self.notes.get(path).filter(|n| !n.deleted)
    }

    /// Applied history for a path, oldest first.
    pub fn read_history(&self, path: &str) -> &[AppliedOp] {
        self.history.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Current version including tombstones (0 for a never-written path).
    /// This is the version a new operation must be based on.
    pub fn head_version(&self, path: &str) -> u64 {
        self.notes.get(path).map(|n| n.version).unwrap_or(0)
    }

    /// Id of the operation at the head of a path, if any. Crash recovery
    /// compares this against operations stuck in Syncing.
    pub fn last_applied_op(&self, path: &str) -> Option<Uuid> {
        self.notes.get(path).map(|n| n.last_applied_op_id)
    }

    /// Content of a path as of `version` (the empty string for version 0).
    /// Merge ancestors are looked up here.
    pub fn content_at(&self, path: &str, version: u64) -> Option<String> {
        if version == 0 {
            return Some(String::new());
        }
        self.read_history(path)
            .iter()
            .find(|entry| entry.version == version)
            .map(|entry| entry.content.clone())
    }

    pub fn len(&self) -> usize {
        self.notes.values().filter(|n| !n.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomic write: temp file, then rename over the store.
    fn flush(&self) -> Result<(), ApplyError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let doc = StoreDoc {
            notes: self.notes.clone(),
            history: self.history.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let tmp_path = self.db_path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.db_path)?;
        Ok(())
    }
}
