//! Conflict resolution strategies.
//!
//! Every resolution produces a new operation appended to the log; the
//! resolver never edits note content in place, so the full history stays
//! replayable. The superseded side of a conflict always survives in the
//! conflict record and the applied history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use vellum_core::types::{ConflictStatus, OpPayload, Operation, RemoteSnapshot};
use vellum_core::{VellumError, VellumResult};

use crate::engine::SyncEngine;
use crate::merge::{has_conflict_markers, merge_labeled, MergeOutcome};
use crate::remote::RemoteReplica;

/// How to resolve a divergence between a local operation and the remote
/// state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Accept the remote snapshot as the new base. The local edit is not
    /// applied; it survives in the conflict record and the history.
    ServerWins,
    /// Push the local edit's content as a new version superseding remote.
    ClientWins,
    /// Three-way text merge against the common ancestor. Overlapping edits
    /// are left as conflict markers and keep the conflict open.
    MergeContent,
    /// Delegate the merge to the configured [`MergeAssistant`]. Its output
    /// is untrusted and validated like any other update.
    External,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ServerWins => "server_wins",
            Strategy::ClientWins => "client_wins",
            Strategy::MergeContent => "merge_content",
            Strategy::External => "external",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = VellumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server_wins" => Ok(Strategy::ServerWins),
            "client_wins" => Ok(Strategy::ClientWins),
            "merge_content" => Ok(Strategy::MergeContent),
            "external" => Ok(Strategy::External),
            other => Err(VellumError::Validation(format!(
                "unknown resolution strategy: {other}"
            ))),
        }
    }
}

/// Out-of-process merge collaborator for the [`Strategy::External`] path.
///
/// Takes the common ancestor plus both sides and returns merged content.
pub trait MergeAssistant: Send + Sync {
    fn merge(&self, ancestor: &str, local: &str, remote: &str) -> anyhow::Result<String>;
}

impl<R: RemoteReplica> SyncEngine<R> {
    /// Resolve a conflict with the given strategy.
    ///
    /// Returns the id of the operation the resolution produced. Resolving
    /// an already-resolved conflict returns the recorded operation again.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        strategy: Strategy,
    ) -> VellumResult<Uuid> {
        let mut log = self.log_handle().lock().await;
        let mut notes = self.notes_handle().lock().await;

        let conflict = log
            .conflict(conflict_id)
            .cloned()
            .ok_or_else(|| VellumError::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.status == ConflictStatus::Resolved {
            return conflict.resolved_op_id.ok_or_else(|| {
                VellumError::Fatal(format!("resolved conflict {conflict_id} lacks an operation"))
            });
        }

        let local_op = log.op(conflict.local_op_id).cloned().ok_or_else(|| {
            VellumError::Fatal(format!("conflict {conflict_id} references a missing operation"))
        })?;
        let path = conflict.path.clone();
        let snapshot = conflict.remote_snapshot.clone();
        let ancestor = notes.content_at(&path, conflict.base_version);

        // After a marker-bearing merge attempt, the note head (the attempt
        // plus any cleanup edits that followed it) is the local side; before
        // that, the local side is the conflicted operation's intent.
        let marker_stage = conflict.resolution_op_id.is_some();
        let local = if marker_stage {
            notes.read(&path).map(|n| n.content.clone())
        } else {
            materialize(ancestor.as_deref(), &local_op.payload)?
        };
        let remote = (!snapshot.deleted).then(|| snapshot.content.clone());

        if marker_stage
            && strategy != Strategy::ServerWins
            && local.as_deref().is_some_and(has_conflict_markers)
        {
            return Err(VellumError::Validation(format!(
                "{path} still contains conflict markers; remove them before resolving"
            )));
        }

        // Decide the target content before touching any state, so a failing
        // merge or assistant leaves the conflict exactly as it was.
        let (content, clean) = match strategy {
            Strategy::ServerWins => (remote.clone(), true),
            Strategy::ClientWins => (local.clone(), true),
            Strategy::MergeContent => {
                let ancestor = require_ancestor(&ancestor, &path, conflict.base_version)?;
                let outcome = merge_sides(
                    ancestor,
                    &local_op,
                    local.as_deref(),
                    &snapshot,
                    remote.as_deref(),
                );
                (Some(outcome.content), outcome.clean)
            }
            Strategy::External => {
                let assistant = self.assistant.clone().ok_or_else(|| {
                    VellumError::Validation(
                        "no merge assistant configured for the external strategy".into(),
                    )
                })?;
                let ancestor = require_ancestor(&ancestor, &path, conflict.base_version)?;
                let merged = assistant
                    .merge(
                        ancestor,
                        local.as_deref().unwrap_or(""),
                        remote.as_deref().unwrap_or(""),
                    )
                    .map_err(|e| VellumError::Fatal(format!("merge assistant: {e}")))?;
                validate_assistant_output(&merged, self.config().max_payload_bytes)?;
                (Some(merged), true)
            }
        };

        // Fold the remote branch in as the new base, then append the
        // resolution as a fresh operation on top of it.
        let based_on = notes
            .accept_snapshot(Uuid::new_v4(), &snapshot)
            .map_err(|e| VellumError::Fatal(format!("accepting remote base on {path}: {e}")))?;

        let live = notes.read(&path).is_some();
        let payload = match content {
            None => OpPayload::Delete,
            Some(content) if live => OpPayload::Update { content },
            Some(content) => OpPayload::Create { content },
        };

        let key = format!("resolve-{conflict_id}-{strategy}-{based_on}");
        let op_id = log.enqueue(self.device_id(), &path, payload, based_on, &key)?;

        if clean {
            log.close_conflict(conflict_id, strategy.as_str(), op_id)?;
        } else {
            log.set_resolution_attempt(conflict_id, strategy.as_str(), op_id)?;
            tracing::info!(
                conflict_id = %conflict_id,
                path = %path,
                "merge left conflict markers; conflict stays open until they are removed"
            );
        }
        Ok(op_id)
    }
}

/// The content the local operation intended, replayed against its ancestor.
/// `None` means the intent was a deletion.
fn materialize(ancestor: Option<&str>, payload: &OpPayload) -> VellumResult<Option<String>> {
    Ok(match payload {
        OpPayload::Create { content } | OpPayload::Update { content } => Some(content.clone()),
        OpPayload::Append { delta } => {
            let base = ancestor.ok_or_else(|| {
                VellumError::Fatal("ancestor content for an append is no longer available".into())
            })?;
            let mut content = base.to_string();
            content.push_str(delta);
            Some(content)
        }
        OpPayload::Delete => None,
    })
}

fn require_ancestor<'a>(
    ancestor: &'a Option<String>,
    path: &str,
    version: u64,
) -> VellumResult<&'a str> {
    ancestor.as_deref().ok_or_else(|| {
        VellumError::Fatal(format!(
            "ancestor of {path} at version {version} is no longer available"
        ))
    })
}

/// Order the sides with the deterministic `(version, created_at, device_id)`
/// tuple and run the line merge. The ordering only picks which side is
/// "left"; neither side is ever discarded by it.
fn merge_sides(
    ancestor: &str,
    local_op: &Operation,
    local: Option<&str>,
    snapshot: &RemoteSnapshot,
    remote: Option<&str>,
) -> MergeOutcome {
    let local_key = (
        local_op.based_on_version + 1,
        local_op.created_at,
        local_op.device_id.as_str(),
    );
    let remote_key = (
        snapshot.version,
        snapshot.written_at,
        snapshot.device_id.as_str(),
    );

    let (local, remote) = (local.unwrap_or(""), remote.unwrap_or(""));
    if local_key <= remote_key {
        merge_labeled(ancestor, local, remote, &local_op.device_id, &snapshot.device_id)
    } else {
        merge_labeled(ancestor, remote, local, &snapshot.device_id, &local_op.device_id)
    }
}

fn validate_assistant_output(merged: &str, max_bytes: usize) -> VellumResult<()> {
    if merged.len() > max_bytes {
        return Err(VellumError::Validation(format!(
            "assistant output of {} bytes exceeds the {max_bytes} byte limit",
            merged.len()
        )));
    }
    if has_conflict_markers(merged) {
        return Err(VellumError::Validation(
            "assistant output still contains conflict markers".into(),
        ));
    }
    if merged.replace("\r\n", "").contains('\r') {
        return Err(VellumError::Validation(
            "assistant output contains a bare carriage return".into(),
        ));
    }
    Ok(())
}
