//! Local file-based state storage backend.
//!
//! The whole document lives in one JSON file. Every successful `put` or
//! `remove` is written through immediately: the new document goes to a
//! temporary file, is synced, and is renamed over the old one. The
//! in-memory copy only changes once the file write succeeded.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ResourceAddress;
use crate::error::{ForgeError, Result, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{RunHistoryEntry, StateDocument, StateRecord, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".forgeplan";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Loaded document, `None` until opened.
    document: Mutex<Option<StateDocument>>,
}

impl LocalStateStore {
    /// Creates a new local state store under `.forgeplan` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ForgeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_state_path(base_dir.into().join(STATE_FILE))
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = state_path.with_extension("lock");

        Self {
            base_dir,
            state_path,
            lock_path,
            document: Mutex::new(None),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_document(&self) -> Result<Option<StateDocument>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let document: StateDocument = serde_json::from_str(&content).map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;
        document.check_version()?;

        Ok(Some(document))
    }

    /// Writes the document to a temporary file, syncs it and renames it into place.
    async fn write_document(&self, document: &StateDocument) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::storage(format!("Failed to create temp state file: {e}"))
        })?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename state file: {e}")))?;

        debug!("State written at serial {}", document.serial);
        Ok(())
    }

    /// Applies a change to a copy of the document, persists it, then swaps it in.
    ///
    /// The change returns its value and whether it modified the document;
    /// unmodified documents are not rewritten.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut StateDocument) -> std::result::Result<(T, bool), StateError> + Send,
    ) -> Result<T> {
        let mut guard = self.document.lock().await;
        let current = guard.as_ref().ok_or(StateError::NotOpen)?;

        let mut next = current.clone();
        let (value, dirty) = change(&mut next)?;
        if dirty {
            self.write_document(&next).await?;
            *guard = Some(next);
        }
        Ok(value)
    }

    async fn read<T>(&self, f: impl FnOnce(&StateDocument) -> T + Send) -> Result<T> {
        let guard = self.document.lock().await;
        let document = guard.as_ref().ok_or(StateError::NotOpen)?;
        Ok(f(document))
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Writes the lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let lock_failed = |message: String| ForgeError::State(StateError::LockFailed { message });

        let mut file = fs::File::create(&self.lock_path)
            .await
            .map_err(|e| lock_failed(format!("Failed to create lock file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed(format!("Failed to write lock file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| lock_failed(format!("Failed to sync lock file: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn open(&self) -> Result<()> {
        let mut guard = self.document.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let document = if let Some(document) = self.read_document().await? {
            document
        } else {
            let document = StateDocument::new();
            info!(
                "Creating new state at {} (lineage {})",
                self.state_path.display(),
                document.lineage
            );
            self.write_document(&document).await?;
            document
        };
        *guard = Some(document);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let guard = self.document.lock().await;
        if let Some(document) = guard.as_ref() {
            self.write_document(document).await?;
        }
        Ok(())
    }

    async fn get(&self, address: &ResourceAddress) -> Result<Option<StateRecord>> {
        self.read(|doc| doc.records.get(address).cloned()).await
    }

    async fn put(
        &self,
        address: &ResourceAddress,
        record: StateRecord,
        expected_serial: u64,
    ) -> Result<StateRecord> {
        self.commit(|doc| doc.put(address, record, expected_serial).map(|r| (r, true)))
            .await
    }

    async fn remove(&self, address: &ResourceAddress, expected_serial: u64) -> Result<Option<StateRecord>> {
        self.commit(|doc| {
            let removed = doc.remove(address, expected_serial)?;
            let dirty = removed.is_some();
            Ok((removed, dirty))
        })
        .await
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        self.read(StateDocument::snapshot).await
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        self.commit(|doc| {
            doc.add_history(entry);
            Ok(((), true))
        })
        .await
    }

    async fn history(&self) -> Result<Vec<RunHistoryEntry>> {
        self.read(|doc| doc.history.clone()).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(ForgeError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(holder);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                fs::remove_file(&self.lock_path).await.map_err(|e| {
                    ForgeError::State(StateError::LockFailed {
                        message: format!("Failed to delete lock file: {e}"),
                    })
                })?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock_file().await?.filter(|l| !l.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Attributes, InstanceKey, Value};
    use crate::state::{RunOperation, MAX_HISTORY};
    use tempfile::TempDir;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    async fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        store.open().await.expect("Failed to open store");
        (store, temp_dir)
    }

    fn record(address: &str) -> StateRecord {
        let attributes: Attributes = [
            ("content".to_string(), Value::from("hi")),
            (
                "meta".to_string(),
                Value::Object([("size".to_string(), Value::from(2_i64))].into()),
            ),
        ]
        .into();
        StateRecord::new(addr(address), "local_file", "/tmp/x", attributes)
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let (store, temp) = create_test_store().await;
        assert!(temp.path().join("state.json").exists());
        assert_eq!(store.backend_type(), "local");
    }

    #[tokio::test]
    async fn test_writes_survive_reopen() {
        let (store, temp) = create_test_store().await;
        let a = addr("local_file.a");
        let committed = store.put(&a, record("local_file.a"), 0).await.unwrap();
        let lineage = store.snapshot().await.unwrap().lineage;

        let reopened = LocalStateStore::with_base_dir(temp.path());
        reopened.open().await.unwrap();
        let snapshot = reopened.snapshot().await.unwrap();

        assert_eq!(snapshot.lineage, lineage);
        assert_eq!(snapshot.get(&a), Some(&committed));
    }

    #[tokio::test]
    async fn test_conflict_leaves_file_untouched() {
        let (store, temp) = create_test_store().await;
        let a = addr("local_file.a");
        store.put(&a, record("local_file.a"), 0).await.unwrap();
        let before = std::fs::read_to_string(temp.path().join("state.json")).unwrap();

        let err = store.put(&a, record("local_file.a"), 0).await.unwrap_err();
        assert!(matches!(err, ForgeError::State(StateError::Conflict { .. })));

        let after = std::fs::read_to_string(temp.path().join("state.json")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_history_at_capacity_is_written_through() {
        let (store, temp) = create_test_store().await;
        for _ in 0..MAX_HISTORY {
            store
                .append_history(RunHistoryEntry::new(RunOperation::Apply))
                .await
                .unwrap();
        }
        store
            .append_history(RunHistoryEntry::new(RunOperation::Destroy))
            .await
            .unwrap();

        let reopened = LocalStateStore::with_base_dir(temp.path());
        reopened.open().await.unwrap();
        let history = reopened.history().await.unwrap();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.last().unwrap().operation, RunOperation::Destroy);
    }

    #[tokio::test]
    async fn test_quoted_instance_key_survives_reopen() {
        let (store, temp) = create_test_store().await;
        let key = addr("null_resource.n").with_index(InstanceKey::Key(r#"a"]b"#.to_string()));
        store
            .put(&key, StateRecord::new(key.clone(), "null_resource", "n-1", Attributes::new()), 0)
            .await
            .unwrap();

        let reopened = LocalStateStore::with_base_dir(temp.path());
        reopened.open().await.unwrap();
        assert!(reopened.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("state.json"), "{ not json").unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let err = store.open().await.unwrap_err();
        assert!(matches!(err, ForgeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store().await;

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.lock_info().await.unwrap().is_some());

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(store.lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store().await;

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(ForgeError::State(StateError::LockedByOther { .. }))
        ));
    }
}
