//! Lifecycle policy lookups.
//!
//! Policies travel with specs. Addresses that only exist in state use the
//! policy recorded when they were last applied.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::{
    lookup_path, remove_path, set_path, Attributes, LifecyclePolicy, PlannedValue, ResourceAddress,
    ResourceSpec,
};
use crate::state::StateSnapshot;

static DEFAULT_POLICY: LifecyclePolicy = LifecyclePolicy {
    prevent_destroy: false,
    create_before_destroy: false,
    ignore_changes: BTreeSet::new(),
};

/// Order of the two halves of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    /// Destroy the old object, then create the new one.
    DestroyFirst,
    /// Create the new object, then destroy the old one.
    CreateFirst,
}

/// Address to lifecycle policy.
#[derive(Debug, Clone, Default)]
pub struct LifecycleTable {
    policies: BTreeMap<ResourceAddress, LifecyclePolicy>,
}

impl LifecycleTable {
    /// Builds the table from desired specs and recorded state.
    ///
    /// A spec's policy wins over the recorded one.
    #[must_use]
    pub fn build(specs: &[ResourceSpec], snapshot: &StateSnapshot) -> Self {
        let mut table = Self::from_snapshot(snapshot);
        for spec in specs {
            table
                .policies
                .insert(spec.address.clone(), spec.lifecycle.clone());
        }
        table
    }

    /// Builds the table from recorded state only.
    #[must_use]
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        Self {
            policies: snapshot
                .iter()
                .map(|(address, record)| (address.clone(), record.lifecycle.clone()))
                .collect(),
        }
    }

    /// Policy for an address; the default policy when unknown.
    #[must_use]
    pub fn policy(&self, address: &ResourceAddress) -> &LifecyclePolicy {
        self.policies.get(address).unwrap_or(&DEFAULT_POLICY)
    }

    /// Returns true if the address may not be destroyed.
    #[must_use]
    pub fn prevents_destroy(&self, address: &ResourceAddress) -> bool {
        self.policy(address).prevent_destroy
    }

    /// Ordering of a replacement of the address.
    #[must_use]
    pub fn replace_mode(&self, address: &ResourceAddress) -> ReplaceMode {
        if self.policy(address).create_before_destroy {
            ReplaceMode::CreateFirst
        } else {
            ReplaceMode::DestroyFirst
        }
    }

    /// Attributes with every `ignore_changes` path removed.
    #[must_use]
    pub fn mask(&self, address: &ResourceAddress, attributes: &Attributes) -> Attributes {
        let mut masked = attributes.clone();
        for path in &self.policy(address).ignore_changes {
            remove_path(&mut masked, &split_path(path));
        }
        masked
    }

    /// Planned attributes with every `ignore_changes` path removed.
    ///
    /// A nested path under an unknown value masks nothing.
    #[must_use]
    pub fn mask_planned(
        &self,
        address: &ResourceAddress,
        attributes: &BTreeMap<String, PlannedValue>,
    ) -> BTreeMap<String, PlannedValue> {
        let mut masked = attributes.clone();
        for path in &self.policy(address).ignore_changes {
            let segments = split_path(path);
            let Some((first, rest)) = segments.split_first() else {
                continue;
            };
            if rest.is_empty() {
                masked.remove(*first);
            } else if let Some(PlannedValue::Known(value)) = masked.get_mut(*first) {
                value.remove_path(rest);
            }
        }
        masked
    }

    /// Copies ignored attributes from `prior` into `target`.
    ///
    /// An ignored path that is absent from `prior` is removed from `target`.
    pub fn carry_ignored(&self, address: &ResourceAddress, target: &mut Attributes, prior: &Attributes) {
        carry_ignored(self.policy(address), target, prior);
    }

    /// Planned counterpart of [`LifecycleTable::carry_ignored`].
    pub fn carry_ignored_planned(
        &self,
        address: &ResourceAddress,
        target: &mut BTreeMap<String, PlannedValue>,
        prior: &Attributes,
    ) {
        for path in &self.policy(address).ignore_changes {
            let segments = split_path(path);
            let Some((first, rest)) = segments.split_first() else {
                continue;
            };
            let recorded = lookup_path(prior, &segments).cloned();
            if rest.is_empty() {
                match recorded {
                    Some(value) => {
                        target.insert((*first).to_string(), PlannedValue::Known(value));
                    }
                    None => {
                        target.remove(*first);
                    }
                }
            } else if let Some(PlannedValue::Known(value)) = target.get_mut(*first) {
                match recorded {
                    Some(recorded) => {
                        value.set_path(rest, recorded);
                    }
                    None => {
                        value.remove_path(rest);
                    }
                }
            }
        }
    }
}

/// Copies the attributes `policy` ignores from `prior` into `target`.
pub fn carry_ignored(policy: &LifecyclePolicy, target: &mut Attributes, prior: &Attributes) {
    for path in &policy.ignore_changes {
        let segments = split_path(path);
        match lookup_path(prior, &segments) {
            Some(value) => {
                set_path(target, &segments, value.clone());
            }
            None => {
                remove_path(target, &segments);
            }
        }
    }
}

/// Splits a dotted attribute path.
#[must_use]
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

impl fmt::Display for ReplaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestroyFirst => write!(f, "destroy first"),
            Self::CreateFirst => write!(f, "create first"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;
    use crate::state::StateRecord;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn tagged() -> Attributes {
        [
            ("size".to_string(), Value::from("small")),
            (
                "tags".to_string(),
                Value::Map(
                    [
                        ("env".to_string(), Value::from("prod")),
                        ("owner".to_string(), Value::from("ops")),
                    ]
                    .into(),
                ),
            ),
        ]
        .into()
    }

    #[test]
    fn test_spec_policy_wins_over_recorded() {
        let a = addr("null_resource.a");
        let mut snapshot = StateSnapshot::empty("lineage");
        snapshot.records.insert(
            a.clone(),
            StateRecord::new(a.clone(), "null_resource", "1", Attributes::new())
                .with_lifecycle(LifecyclePolicy::protected()),
        );
        let only_state = LifecycleTable::build(&[], &snapshot);
        assert!(only_state.prevents_destroy(&a));

        let spec = ResourceSpec::new(a.clone(), Attributes::new()).unwrap();
        let with_spec = LifecycleTable::build(&[spec], &snapshot);
        assert!(!with_spec.prevents_destroy(&a));
        assert_eq!(with_spec.replace_mode(&a), ReplaceMode::DestroyFirst);
        assert!(!with_spec.prevents_destroy(&addr("null_resource.unknown")));
    }

    #[test]
    fn test_mask_nested_path() {
        let a = addr("null_resource.a");
        let spec = ResourceSpec::new(a.clone(), Attributes::new())
            .unwrap()
            .with_lifecycle(LifecyclePolicy::ignoring(["tags.owner"]));
        let table = LifecycleTable::build(&[spec], &StateSnapshot::empty("l"));

        let masked = table.mask(&a, &tagged());
        let tags = masked["tags"].as_map().unwrap();
        assert!(tags.contains_key("env"));
        assert!(!tags.contains_key("owner"));
        assert_eq!(masked["size"], Value::from("small"));
    }

    #[test]
    fn test_carry_ignored() {
        let a = addr("null_resource.a");
        let spec = ResourceSpec::new(a.clone(), Attributes::new())
            .unwrap()
            .with_lifecycle(LifecyclePolicy::ignoring(["size", "tags.owner", "missing"]));
        let table = LifecycleTable::build(&[spec], &StateSnapshot::empty("l"));

        let mut desired: Attributes = [
            ("size".to_string(), Value::from("large")),
            ("missing".to_string(), Value::from("x")),
            (
                "tags".to_string(),
                Value::Map([("owner".to_string(), Value::from("dev"))].into()),
            ),
        ]
        .into();
        table.carry_ignored(&a, &mut desired, &tagged());

        assert_eq!(desired["size"], Value::from("small"));
        assert!(!desired.contains_key("missing"));
        assert_eq!(
            desired["tags"].get_path(&["owner"]),
            Some(&Value::from("ops"))
        );
    }

    #[test]
    fn test_create_before_destroy_mode() {
        let a = addr("null_resource.a");
        let spec = ResourceSpec::new(a.clone(), Attributes::new())
            .unwrap()
            .with_lifecycle(LifecyclePolicy::create_before_destroy());
        let table = LifecycleTable::build(&[spec], &StateSnapshot::empty("l"));
        assert_eq!(table.replace_mode(&a), ReplaceMode::CreateFirst);
    }
}
