//! Drift detection and state refresh.
//!
//! Every recorded object is read back through its provisioning client and
//! compared with the attributes in state. Attributes a client does not
//! report keep their recorded value.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Attributes, PlannedValue, ResourceAddress};
use crate::error::Result;
use crate::planner::AttributeDiff;
use crate::provider::ProviderRegistry;
use crate::state::{RunHistoryEntry, RunOperation, StateRecord, StateStore};

/// How a real object differs from its record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "attributes", rename_all = "snake_case")]
pub enum Drift {
    /// The object no longer exists.
    Missing,
    /// The object's attributes changed outside the engine.
    Changed(Vec<AttributeDiff>),
}

/// Drift of one recorded address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    /// Recorded address.
    pub address: ResourceAddress,
    /// Provider identifier of the object.
    pub real_id: String,
    /// How it drifted.
    pub drift: Drift,
}

/// Result of a drift check or refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Drifted addresses in address order.
    pub entries: Vec<DriftEntry>,
    /// Number of records read.
    pub checked: usize,
    /// Addresses that could not be read or written.
    pub errors: BTreeMap<ResourceAddress, String>,
}

/// Reads recorded objects back and reconciles state with them.
pub struct Refresher {
    store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
}

/// An observed record and its merged attributes.
struct Observation {
    record: StateRecord,
    merged: Option<Attributes>,
    drift: Drift,
}

impl Refresher {
    /// Creates a new refresher.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, registry: ProviderRegistry) -> Self {
        Self { store, registry }
    }

    /// Reports drift without writing to state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state snapshot cannot be read. Per-object
    /// read failures are collected in [`DriftReport::errors`].
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let (observed, mut report) = self.observe().await?;
        report.entries = observed.into_iter().map(Observation::into_entry).collect();
        info!(
            "Drift check: {} checked, {} drifted, {} error(s)",
            report.checked,
            report.entries.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Commits read attributes to state and removes records whose object
    /// is gone. A record that still tracks deposed objects is kept and
    /// reported as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the state snapshot cannot be read. Per-object
    /// failures, including write conflicts, are collected in
    /// [`DriftReport::errors`].
    pub async fn refresh(&self) -> Result<DriftReport> {
        let (observed, mut report) = self.observe().await?;

        for observation in observed {
            let address = observation.record.address.clone();
            let serial = observation.record.serial;
            if observation.merged.is_none() && !observation.record.deposed.is_empty() {
                warn!(
                    "{address}: object is gone but {} deposed object(s) remain; keeping the record",
                    observation.record.deposed.len()
                );
                report.errors.insert(
                    address,
                    format!(
                        "object is gone but deposed objects {} are still tracked; apply to clean them up",
                        observation.record.deposed.join(", ")
                    ),
                );
                continue;
            }
            let written = match &observation.merged {
                Some(merged) => {
                    let mut record = observation.record.clone();
                    record.attributes = merged.clone();
                    self.store.put(&address, record, serial).await.map(|_| ())
                }
                None => self.store.remove(&address, serial).await.map(|_| ()),
            };
            match written {
                Ok(()) => {
                    debug!("{address}: refreshed");
                    report.entries.push(observation.into_entry());
                }
                Err(e) => {
                    warn!("{address}: refresh not recorded: {e}");
                    report.errors.insert(address, e.to_string());
                }
            }
        }

        let mut entry = RunHistoryEntry::new(RunOperation::Refresh);
        entry.succeeded = report.entries.len();
        entry.failed = report.errors.len();
        entry.error = report
            .errors
            .iter()
            .next()
            .map(|(address, message)| format!("{address}: {message}"));
        if let Err(e) = self.store.append_history(entry).await {
            warn!("Failed to record refresh history: {e}");
        }

        info!(
            "Refresh: {} checked, {} updated, {} error(s)",
            report.checked,
            report.entries.len(),
            report.errors.len()
        );
        Ok(report)
    }

    async fn observe(&self) -> Result<(Vec<Observation>, DriftReport)> {
        let snapshot = self.store.snapshot().await?;
        let mut report = DriftReport::default();
        let mut observed = Vec::new();

        for (address, record) in snapshot.iter() {
            report.checked += 1;
            let Some(provisioner) = self.registry.get(&record.provider) else {
                report
                    .errors
                    .insert(address.clone(), format!("no provisioner for '{}'", record.provider));
                continue;
            };

            match provisioner.read(&record.real_id).await {
                Ok(None) => {
                    warn!("{address}: {} no longer exists", record.real_id);
                    observed.push(Observation {
                        record: record.clone(),
                        merged: None,
                        drift: Drift::Missing,
                    });
                }
                Ok(Some(read)) => {
                    let diffs = attribute_drift(&record.attributes, &read);
                    if diffs.is_empty() {
                        continue;
                    }
                    debug!("{address}: {} attribute(s) drifted", diffs.len());
                    let mut merged = record.attributes.clone();
                    merged.extend(read);
                    observed.push(Observation {
                        record: record.clone(),
                        merged: Some(merged),
                        drift: Drift::Changed(diffs),
                    });
                }
                Err(e) => {
                    warn!("{address}: read failed: {e}");
                    report.errors.insert(address.clone(), e.to_string());
                }
            }
        }
        Ok((observed, report))
    }
}

impl Observation {
    fn into_entry(self) -> DriftEntry {
        DriftEntry {
            address: self.record.address,
            real_id: self.record.real_id,
            drift: self.drift,
        }
    }
}

/// Attributes whose read value differs from the recorded one.
fn attribute_drift(recorded: &Attributes, read: &Attributes) -> Vec<AttributeDiff> {
    read.iter()
        .filter(|(key, value)| recorded.get(*key) != Some(*value))
        .map(|(key, value)| AttributeDiff {
            path: key.clone(),
            before: recorded.get(key).cloned(),
            after: Some(PlannedValue::Known(value.clone())),
            forces_replacement: false,
        })
        .collect()
}

impl DriftReport {
    /// Returns true if nothing drifted and every object was read.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.entries.is_empty() && self.errors.is_empty()
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Changed(diffs) => {
                let paths: Vec<&str> = diffs.iter().map(|d| d.path.as_str()).collect();
                write!(f, "changed: {}", paths.join(", "))
            }
        }
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected ({} checked)", self.checked);
        }
        for entry in &self.entries {
            writeln!(f, "  {} ({}): {}", entry.address, entry.real_id, entry.drift)?;
        }
        for (address, message) in &self.errors {
            writeln!(f, "  {address}: error: {message}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refresher")
            .field("backend", &self.store.backend_type())
            .field("registry", &self.registry)
            .finish()
    }
}
