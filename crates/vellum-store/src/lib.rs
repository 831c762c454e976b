//! vellum-store: the three durable stores behind the sync engine.
//!
//! - [`oplog::OperationLog`] — append-only, crash-safe record of mutation
//!   intents (conflict records ride the same log).
//! - [`notes::VersionStore`] — authoritative content + monotonic version per
//!   vault path, with applied history.
//! - [`devices::DeviceRegistry`] — per-replica sync cursors and liveness.

pub mod devices;
pub mod notes;
pub mod oplog;

pub use devices::DeviceRegistry;
pub use notes::{ApplyError, VersionStore};
pub use oplog::{LogPolicy, OperationLog};
