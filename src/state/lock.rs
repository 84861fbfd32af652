//! Run locking.
//!
//! The run lock is advisory: it keeps two forgeplan processes from
//! applying against the same state at once. Per-record serials still
//! guard every individual write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

use super::store::StateStore;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Information about a run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

/// A held run lock. Release it with [`StateLock::release`].
#[derive(Debug)]
pub struct StateLock {
    info: LockInfo,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

impl StateLock {
    /// Acquires the run lock on a store.
    ///
    /// An empty holder gets a generated one.
    ///
    /// # Errors
    ///
    /// Returns an error if another live lock is held.
    pub async fn acquire<S>(store: &S, holder: &str) -> Result<Self>
    where
        S: StateStore + ?Sized,
    {
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = store.acquire_lock(&holder).await?;
        Ok(Self { info })
    }

    /// Gets the lock ID.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.info.lock_id
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Releases the lock, logging instead of failing.
    pub async fn release<S>(self, store: &S)
    where
        S: StateStore + ?Sized,
    {
        if let Err(e) = store.release_lock(&self.info.lock_id).await {
            warn!("Failed to release state lock {}: {e}", self.info.lock_id);
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;

    #[test]
    fn test_lock_info_expiry() {
        let info = LockInfo::new("test-holder");
        assert_eq!(info.holder, "test-holder");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_state_lock_acquire_release() {
        let store = MemoryStateStore::new();
        store.open().await.unwrap();

        let lock = StateLock::acquire(&store, "").await.unwrap();
        assert!(StateLock::acquire(&store, "other").await.is_err());
        assert_eq!(
            store.lock_info().await.unwrap().map(|i| i.lock_id),
            Some(lock.lock_id().to_string())
        );

        lock.release(&store).await;
        assert!(store.lock_info().await.unwrap().is_none());
    }
}
