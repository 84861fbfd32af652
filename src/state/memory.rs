//! In-memory state storage backend.
//!
//! Used by tests, by embedding callers, and by the `memory` backend
//! setting. Shares the commit rules of [`StateDocument`] with the local
//! backend.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ResourceAddress;
use crate::error::{ForgeError, Result, StateError};

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::{RunHistoryEntry, StateDocument, StateRecord, StateSnapshot};

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    document: Mutex<Option<StateDocument>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates a store that must be opened before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with an existing document.
    #[must_use]
    pub fn with_document(document: StateDocument) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            lock: Mutex::new(None),
        }
    }

    async fn with_document_mut<T>(
        &self,
        f: impl FnOnce(&mut StateDocument) -> std::result::Result<T, StateError> + Send,
    ) -> Result<T> {
        let mut guard = self.document.lock().await;
        let document = guard.as_mut().ok_or(StateError::NotOpen)?;
        Ok(f(document)?)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn open(&self) -> Result<()> {
        let mut guard = self.document.lock().await;
        if guard.is_none() {
            debug!("Opening empty in-memory state");
            *guard = Some(StateDocument::new());
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, address: &ResourceAddress) -> Result<Option<StateRecord>> {
        self.with_document_mut(|doc| Ok(doc.records.get(address).cloned()))
            .await
    }

    async fn put(
        &self,
        address: &ResourceAddress,
        record: StateRecord,
        expected_serial: u64,
    ) -> Result<StateRecord> {
        self.with_document_mut(|doc| doc.put(address, record, expected_serial))
            .await
    }

    async fn remove(&self, address: &ResourceAddress, expected_serial: u64) -> Result<Option<StateRecord>> {
        self.with_document_mut(|doc| doc.remove(address, expected_serial))
            .await
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        self.with_document_mut(|doc| Ok(doc.snapshot())).await
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        self.with_document_mut(|doc| {
            doc.add_history(entry);
            Ok(())
        })
        .await
    }

    async fn history(&self) -> Result<Vec<RunHistoryEntry>> {
        self.with_document_mut(|doc| Ok(doc.history.clone())).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        if let Some(existing) = guard.as_ref()
            && !existing.is_expired()
        {
            return Err(ForgeError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }
        let info = LockInfo::new(holder);
        *guard = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attributes;
    use std::sync::Arc;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn record(address: &str, id: &str) -> StateRecord {
        StateRecord::new(addr(address), "null_resource", id, Attributes::new())
    }

    #[tokio::test]
    async fn test_requires_open() {
        let store = MemoryStateStore::new();
        let err = store.get(&addr("null_resource.a")).await.unwrap_err();
        assert!(matches!(err, ForgeError::State(StateError::NotOpen)));
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryStateStore::new();
        store.open().await.unwrap();

        let a = addr("null_resource.a");
        let committed = store.put(&a, record("null_resource.a", "r1"), 0).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap().unwrap().real_id, "r1");

        store.remove(&a, committed.serial).await.unwrap();
        assert!(store.get(&a).await.unwrap().is_none());
        assert_eq!(store.snapshot().await.unwrap().serial, 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_observe_conflict() {
        let store = Arc::new(MemoryStateStore::new());
        store.open().await.unwrap();
        let a = addr("null_resource.a");

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                store.put(&a, record("null_resource.a", &format!("r{i}")), 0).await
            }));
        }

        let mut committed = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => committed += 1,
                Err(ForgeError::State(StateError::Conflict { .. })) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(committed, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_snapshot_is_address_ordered() {
        let store = MemoryStateStore::new();
        store.open().await.unwrap();
        for name in ["null_resource.c", "local_file.z", "null_resource.a"] {
            store.put(&addr(name), record(name, "x"), 0).await.unwrap();
        }
        let snapshot = store.snapshot().await.unwrap();
        let order: Vec<String> = snapshot.records.keys().map(ToString::to_string).collect();
        assert_eq!(order, vec!["local_file.z", "null_resource.a", "null_resource.c"]);
    }
}
