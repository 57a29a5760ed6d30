//! State management for the v6lab engine.
//!
//! This module persists the snapshot of applied resources: provider ids,
//! the properties each object was applied with, its outputs and the
//! dependencies recorded at apply time, plus a short run history.

mod commit;
mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use commit::StateCommitter;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{
    DeposedObject, MAX_HISTORY, RunHistoryEntry, RunOutcome, STATE_VERSION, SnapshotEntry, StateSnapshot,
};
