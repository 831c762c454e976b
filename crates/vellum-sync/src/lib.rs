//! vellum-sync: sync engine with pull/push/reconcile, conflict resolution,
//! and a bounded worker scheduler.

pub mod engine;
pub mod merge;
pub mod remote;
pub mod resolver;
pub mod scheduler;

pub use engine::{PushResult, SyncEngine};
pub use remote::{Ack, AckOutcome, DirRemote, InMemoryRemote, RemoteError, RemoteOp, RemoteReplica};
pub use resolver::{MergeAssistant, Strategy};
pub use scheduler::Scheduler;
