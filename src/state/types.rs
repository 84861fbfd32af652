//! State types.
//!
//! These types represent what was last applied for every resource. The
//! commit rules (serial checks, monotonic store serial, bounded history)
//! live on [`StateDocument`] so every backend shares them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::{Attributes, LifecyclePolicy, ResourceAddress};
use crate::error::StateError;

/// Current version of the state format.
pub const STATE_VERSION: u32 = 1;

/// Number of run history entries kept.
pub const MAX_HISTORY: usize = 100;

/// Last-applied state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Address of the resource.
    pub address: ResourceAddress,
    /// Provisioner that manages the real object.
    pub provider: String,
    /// Provider-assigned identifier of the real object.
    pub real_id: String,
    /// Attributes as returned by the provisioner.
    pub attributes: Attributes,
    /// Store serial at which this record was committed.
    pub serial: u64,
    /// Dependencies at apply time, used to order destroys.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Lifecycle policy at apply time.
    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
    /// Real objects replaced create-first and not yet destroyed.
    #[serde(default)]
    pub deposed: Vec<String>,
    /// When the real object was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// A consistent read of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Identity of the state history.
    pub lineage: String,
    /// Store serial at the time of the read.
    pub serial: u64,
    /// Records in address order.
    pub records: BTreeMap<ResourceAddress, StateRecord>,
}

/// The persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub version: u32,
    /// Identity of the state history, fixed at creation.
    pub lineage: String,
    /// Incremented on every committed change.
    pub serial: u64,
    /// Records by address.
    #[serde(default)]
    pub records: BTreeMap<ResourceAddress, StateRecord>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
    /// When the document was last changed.
    pub last_updated: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: RunOperation,
    /// Plan executed, if any.
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Number of execution nodes that succeeded.
    pub succeeded: usize,
    /// Number of execution nodes that failed.
    pub failed: usize,
    /// Number of execution nodes skipped after a failure.
    pub skipped: usize,
    /// Number of execution nodes never dispatched due to cancellation.
    #[serde(default)]
    pub cancelled: usize,
    /// First error, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Plan execution.
    Apply,
    /// Destroy-everything execution.
    Destroy,
    /// State refresh from the real objects.
    Refresh,
    /// Manual address move.
    Move,
    /// Manual record removal.
    Remove,
}

impl StateRecord {
    /// Creates a record for a freshly created object.
    #[must_use]
    pub fn new(
        address: ResourceAddress,
        provider: impl Into<String>,
        real_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        let now = Utc::now();
        Self {
            address,
            provider: provider.into(),
            real_id: real_id.into(),
            attributes,
            serial: 0,
            dependencies: BTreeSet::new(),
            lifecycle: LifecyclePolicy::default(),
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<ResourceAddress>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the recorded lifecycle policy.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecyclePolicy) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

impl StateSnapshot {
    /// An empty snapshot with the given lineage.
    #[must_use]
    pub fn empty(lineage: impl Into<String>) -> Self {
        Self {
            lineage: lineage.into(),
            serial: 0,
            records: BTreeMap::new(),
        }
    }

    /// Returns the record at an address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&StateRecord> {
        self.records.get(address)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in address order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceAddress, &StateRecord)> {
        self.records.iter()
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl StateDocument {
    /// Creates an empty document with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            records: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Checks that this build can read the document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] for newer formats.
    pub fn check_version(&self) -> Result<(), StateError> {
        if self.version > STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }

    fn current_serial(&self, address: &ResourceAddress) -> u64 {
        self.records.get(address).map_or(0, |r| r.serial)
    }

    /// Commits a record if `expected_serial` matches the current one.
    ///
    /// The committed record carries the new store serial.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] on a serial mismatch.
    pub fn put(
        &mut self,
        address: &ResourceAddress,
        mut record: StateRecord,
        expected_serial: u64,
    ) -> Result<StateRecord, StateError> {
        let found = self.current_serial(address);
        if found != expected_serial {
            return Err(StateError::Conflict {
                address: address.clone(),
                expected: expected_serial,
                found,
            });
        }

        self.serial += 1;
        self.last_updated = Utc::now();
        if let Some(previous) = self.records.get(address) {
            record.created_at = previous.created_at;
        }
        record.address = address.clone();
        record.serial = self.serial;
        record.updated_at = self.last_updated;
        self.records.insert(address.clone(), record.clone());
        Ok(record)
    }

    /// Removes a record if `expected_serial` matches the current one.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] on a serial mismatch, including
    /// when the record does not exist and `expected_serial` is not 0.
    pub fn remove(
        &mut self,
        address: &ResourceAddress,
        expected_serial: u64,
    ) -> Result<Option<StateRecord>, StateError> {
        let found = self.current_serial(address);
        if found != expected_serial {
            return Err(StateError::Conflict {
                address: address.clone(),
                expected: expected_serial,
                found,
            });
        }
        let removed = self.records.remove(address);
        if removed.is_some() {
            self.serial += 1;
            self.last_updated = Utc::now();
        }
        Ok(removed)
    }

    /// A consistent copy of the records.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            lineage: self.lineage.clone(),
            serial: self.serial,
            records: self.records.clone(),
        }
    }

    /// Adds a history entry, keeping only the last [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry with zero counts.
    #[must_use]
    pub fn new(operation: RunOperation) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            plan_id: None,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            error: None,
        }
    }

    /// Returns true if nothing failed, was skipped or was cancelled.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0 && self.error.is_none()
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
            Self::Move => "move",
            Self::Remove => "remove",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn record(address: &str) -> StateRecord {
        StateRecord::new(addr(address), "null_resource", "id-1", Attributes::new())
    }

    #[test]
    fn test_put_assigns_monotonic_serials() {
        let mut doc = StateDocument::new();
        let a = doc.put(&addr("null_resource.a"), record("null_resource.a"), 0).unwrap();
        let b = doc.put(&addr("null_resource.b"), record("null_resource.b"), 0).unwrap();
        assert_eq!(a.serial, 1);
        assert_eq!(b.serial, 2);

        let a2 = doc.put(&addr("null_resource.a"), record("null_resource.a"), 1).unwrap();
        assert_eq!(a2.serial, 3);
        assert_eq!(a2.created_at, a.created_at);
        assert_eq!(doc.serial, 3);
    }

    #[test]
    fn test_stale_serial_conflicts() {
        let mut doc = StateDocument::new();
        doc.put(&addr("null_resource.a"), record("null_resource.a"), 0).unwrap();

        let err = doc
            .put(&addr("null_resource.a"), record("null_resource.a"), 0)
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict { expected: 0, found: 1, .. }));

        let err = doc.remove(&addr("null_resource.a"), 7).unwrap_err();
        assert!(matches!(err, StateError::Conflict { expected: 7, found: 1, .. }));
        assert_eq!(doc.records.len(), 1);
    }

    #[test]
    fn test_remove_absent_with_zero_serial_is_noop() {
        let mut doc = StateDocument::new();
        assert!(doc.remove(&addr("null_resource.a"), 0).unwrap().is_none());
        assert_eq!(doc.serial, 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut doc = StateDocument::new();
        for _ in 0..(MAX_HISTORY + 5) {
            doc.add_history(RunHistoryEntry::new(RunOperation::Apply));
        }
        assert_eq!(doc.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_document_json_round_trip() {
        let mut doc = StateDocument::new();
        doc.put(&addr(r#"local_file.site["blue"]"#), record(r#"local_file.site["blue"]"#), 0)
            .unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let back: StateDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.snapshot(), doc.snapshot());
    }

    #[test]
    fn test_newer_version_rejected() {
        let doc = StateDocument {
            version: STATE_VERSION + 1,
            ..StateDocument::new()
        };
        assert!(matches!(doc.check_version(), Err(StateError::VersionMismatch { .. })));
    }
}
