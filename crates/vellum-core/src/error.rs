use thiserror::Error;

pub type VellumResult<T> = Result<T, VellumError>;

/// Engine-level error taxonomy.
///
/// Transient errors are absorbed inside the sync engine (the operation stays
/// Pending and is retried with backoff); conflicts and fatal errors are
/// surfaced to the caller through the status/conflict queries.
#[derive(Debug, Error)]
pub enum VellumError {
    /// Malformed operation. Rejected at enqueue, never enters the log.
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout or 5xx-equivalent from the remote replica.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A divergence was captured as a conflict record. Not a failure: sync
    /// on the path pauses until the conflict is resolved.
    #[error("conflict detected on {path}")]
    ConflictDetected { path: String },

    /// Corrupted store entry or exhausted retries. Surfaced, never
    /// auto-retried.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
