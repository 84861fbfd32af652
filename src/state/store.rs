//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every mutation goes through `put`/`remove`, which check the caller's
//! expected serial against the stored one.

use async_trait::async_trait;
use tracing::info;

use crate::config::ResourceAddress;
use crate::error::{ForgeError, PlanError, Result, StateError};

use super::lock::LockInfo;
use super::types::{RunHistoryEntry, RunOperation, StateRecord, StateSnapshot};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the backing data. Must be called before any other operation.
    async fn open(&self) -> Result<()>;

    /// Persists any buffered data.
    async fn flush(&self) -> Result<()>;

    /// Returns the record at an address.
    async fn get(&self, address: &ResourceAddress) -> Result<Option<StateRecord>>;

    /// Commits a record.
    ///
    /// `expected_serial` is the serial of the record the caller last saw,
    /// or 0 if it saw none. Returns the committed record with its new serial.
    async fn put(
        &self,
        address: &ResourceAddress,
        record: StateRecord,
        expected_serial: u64,
    ) -> Result<StateRecord>;

    /// Removes a record, with the same serial check as `put`.
    async fn remove(&self, address: &ResourceAddress, expected_serial: u64) -> Result<Option<StateRecord>>;

    /// Returns a consistent copy of all records in address order.
    async fn snapshot(&self) -> Result<StateSnapshot>;

    /// Appends a run history entry.
    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()>;

    /// Returns the run history, oldest first.
    async fn history(&self) -> Result<Vec<RunHistoryEntry>>;

    /// Acquires the run lock.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the run lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn open(&self) -> Result<()> {
        (**self).open().await
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }

    async fn get(&self, address: &ResourceAddress) -> Result<Option<StateRecord>> {
        (**self).get(address).await
    }

    async fn put(
        &self,
        address: &ResourceAddress,
        record: StateRecord,
        expected_serial: u64,
    ) -> Result<StateRecord> {
        (**self).put(address, record, expected_serial).await
    }

    async fn remove(&self, address: &ResourceAddress, expected_serial: u64) -> Result<Option<StateRecord>> {
        (**self).remove(address, expected_serial).await
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        (**self).snapshot().await
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        (**self).append_history(entry).await
    }

    async fn history(&self) -> Result<Vec<RunHistoryEntry>> {
        (**self).history().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Moves a record to a new address through the conflict-checked path.
///
/// Returns the record committed at `to`.
///
/// # Errors
///
/// Returns [`PlanError::InvalidMove`] if `from` is not recorded or `to`
/// already is, and a state error if either write conflicts.
pub async fn move_record<S>(store: &S, from: &ResourceAddress, to: &ResourceAddress) -> Result<StateRecord>
where
    S: StateStore + ?Sized,
{
    let invalid = |reason: &str| {
        ForgeError::Plan(PlanError::InvalidMove {
            from: from.clone(),
            to: to.clone(),
            reason: reason.to_string(),
        })
    };

    let Some(record) = store.get(from).await? else {
        return Err(invalid("source address is not in state"));
    };
    if store.get(to).await?.is_some() {
        return Err(invalid("destination address is already in state"));
    }

    let serial = record.serial;
    let mut moved = record;
    moved.address = to.clone();
    let committed = store.put(to, moved, 0).await?;
    store.remove(from, serial).await?;

    info!("Moved {from} to {to}");
    Ok(committed)
}

/// Removes a record regardless of its serial, for `state rm`.
///
/// # Errors
///
/// Returns an error if the record does not exist or the write fails.
pub async fn forget_record<S>(store: &S, address: &ResourceAddress) -> Result<StateRecord>
where
    S: StateStore + ?Sized,
{
    let record = store.get(address).await?.ok_or_else(|| {
        ForgeError::State(StateError::storage(format!("{address} is not in state")))
    })?;
    store.remove(address, record.serial).await?;

    let mut entry = RunHistoryEntry::new(RunOperation::Remove);
    entry.succeeded = 1;
    store.append_history(entry).await?;
    info!("Removed {address} from state");
    Ok(record)
}
