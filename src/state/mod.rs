//! State management module.
//!
//! This module records the last-applied state of every resource:
//! - The [`StateStore`] contract with per-record optimistic serials
//! - In-memory and local JSON file backends
//! - An advisory run lock and a bounded run history

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, StateLock, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use store::{forget_record, move_record, StateStore};
pub use types::{
    RunHistoryEntry, RunOperation, StateDocument, StateRecord, StateSnapshot, MAX_HISTORY,
    STATE_VERSION,
};
