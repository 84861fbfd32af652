//! Diff engine for comparing desired specs with recorded state.
//!
//! Every address present in either the spec set or the state snapshot
//! gets exactly one [`ResourceChange`]. Output is sorted by address and
//! depends only on its inputs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::config::{
    resolve_attributes, Attributes, PlannedValue, Reference, ResourceAddress, ResourceSpec, Value,
};
use crate::error::{ConfigError, ForgeError, PlanError, Result};
use crate::graph::ResourceGraph;
use crate::provider::{ProviderRegistry, ResourceSchema};
use crate::state::{StateRecord, StateSnapshot};

use super::lifecycle::{LifecycleTable, ReplaceMode};

/// Engine for computing changes between desired specs and state.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    registry: &'a ProviderRegistry,
}

/// What has to happen to one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Already up to date.
    NoOp,
    /// Not in state yet.
    Create,
    /// Changed attributes that can be updated in place.
    Update,
    /// No longer in configuration.
    Destroy,
    /// Changed attributes that force a new object.
    Replace(ReplaceMode),
}

/// Difference of a single top-level attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDiff {
    /// Attribute name.
    pub path: String,
    /// Recorded value, if any.
    pub before: Option<Value>,
    /// Planned value, if any.
    pub after: Option<PlannedValue>,
    /// Whether this difference forces replacement.
    pub forces_replacement: bool,
}

/// The planned change for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Address the change applies to.
    pub address: ResourceAddress,
    /// What happens to the address.
    pub action: ChangeAction,
    /// Desired spec; absent for destroys.
    pub desired: Option<ResourceSpec>,
    /// Recorded state; absent for creates.
    pub prior: Option<StateRecord>,
    /// Planned attributes after the change; absent for destroys.
    pub after: Option<BTreeMap<String, PlannedValue>>,
    /// Attribute-level differences.
    pub diffs: Vec<AttributeDiff>,
    /// Deposed objects this change cleans up.
    pub deposed: Vec<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Changes sorted by address.
    pub changes: Vec<ResourceChange>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine that reads schemas from `registry`.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes changes for an apply.
    ///
    /// `graph` must be the graph built from `specs`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DestroyBlocked`] if a protected resource would
    /// be destroyed or replaced, and [`ConfigError::UnknownResourceType`]
    /// if a spec or record has no provisioner.
    pub fn compute(
        &self,
        specs: &[ResourceSpec],
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> Result<DiffResult> {
        self.registry.check(specs)?;
        let table = LifecycleTable::build(specs, snapshot);
        let by_address: BTreeMap<&ResourceAddress, &ResourceSpec> =
            specs.iter().map(|s| (&s.address, s)).collect();

        let mut changes = BTreeMap::new();
        for (address, record) in snapshot.iter() {
            if by_address.contains_key(address) {
                continue;
            }
            if table.prevents_destroy(address) {
                return Err(PlanError::DestroyBlocked {
                    address: address.clone(),
                }
                .into());
            }
            self.schema_for(&record.provider, address)?;
            changes.insert(address.clone(), destroy_change(record));
        }

        let mut planned: BTreeMap<ResourceAddress, (ChangeAction, BTreeMap<String, PlannedValue>)> =
            BTreeMap::new();
        for address in graph.topological_order() {
            let Some(spec) = by_address.get(address) else {
                continue;
            };
            let schema = self.schema_for(&spec.provider, address)?;
            let mut lookup = |reference: &Reference| lookup_planned(&planned, reference);
            let desired =
                resolve_attributes(&spec.attributes, &spec.address.module_path, &mut lookup)?;

            let change = match snapshot.get(address) {
                None => create_change(spec, desired),
                Some(record) => compare(spec, record, desired, &schema, &table)?,
            };
            debug!("{}: {}", address, change.action);

            if let Some(after) = &change.after {
                planned.insert(address.clone(), (change.action, after.clone()));
            }
            changes.insert(address.clone(), change);
        }

        promote_create_before_destroy(&mut changes, graph);
        Ok(DiffResult {
            changes: changes.into_values().collect(),
        })
    }

    /// Computes an all-destroy diff for the recorded state.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DestroyBlocked`] for the first protected
    /// record and [`ConfigError::UnknownResourceType`] if a record has no
    /// provisioner.
    pub fn compute_destroy(&self, snapshot: &StateSnapshot) -> Result<DiffResult> {
        let table = LifecycleTable::from_snapshot(snapshot);
        let mut changes = Vec::with_capacity(snapshot.len());
        for (address, record) in snapshot.iter() {
            if table.prevents_destroy(address) {
                return Err(PlanError::DestroyBlocked {
                    address: address.clone(),
                }
                .into());
            }
            self.schema_for(&record.provider, address)?;
            changes.push(destroy_change(record));
        }
        Ok(DiffResult { changes })
    }

    fn schema_for(&self, provider: &str, address: &ResourceAddress) -> Result<ResourceSchema> {
        self.registry.schema(provider).ok_or_else(|| {
            ForgeError::Config(ConfigError::UnknownResourceType {
                resource_type: provider.to_string(),
                address: address.to_string(),
            })
        })
    }
}

/// Resolves a reference against the changes planned so far.
///
/// Attributes of a resource being created or replaced that are not set in
/// configuration are only known after apply.
fn lookup_planned(
    planned: &BTreeMap<ResourceAddress, (ChangeAction, BTreeMap<String, PlannedValue>)>,
    reference: &Reference,
) -> PlannedValue {
    let Some((_, after)) = planned.get(&reference.target) else {
        return PlannedValue::Unknown;
    };
    let Some((first, rest)) = reference.attribute.split_first() else {
        return PlannedValue::Unknown;
    };
    match after.get(first) {
        Some(PlannedValue::Known(value)) => value
            .get_path(rest)
            .cloned()
            .map_or(PlannedValue::Unknown, PlannedValue::Known),
        _ => PlannedValue::Unknown,
    }
}

fn create_change(spec: &ResourceSpec, desired: BTreeMap<String, PlannedValue>) -> ResourceChange {
    let diffs = desired
        .iter()
        .map(|(key, value)| AttributeDiff {
            path: key.clone(),
            before: None,
            after: Some(value.clone()),
            forces_replacement: false,
        })
        .collect();
    ResourceChange {
        address: spec.address.clone(),
        action: ChangeAction::Create,
        desired: Some(spec.clone()),
        prior: None,
        after: Some(desired),
        diffs,
        deposed: Vec::new(),
    }
}

fn destroy_change(record: &StateRecord) -> ResourceChange {
    ResourceChange {
        address: record.address.clone(),
        action: ChangeAction::Destroy,
        desired: None,
        prior: Some(record.clone()),
        after: None,
        diffs: Vec::new(),
        deposed: record.deposed.clone(),
    }
}

fn compare(
    spec: &ResourceSpec,
    record: &StateRecord,
    desired: BTreeMap<String, PlannedValue>,
    schema: &ResourceSchema,
    table: &LifecycleTable,
) -> Result<ResourceChange> {
    let address = &spec.address;
    let masked_before = table.mask(address, &record.attributes);
    let masked_after = table.mask_planned(address, &desired);

    let keys: BTreeSet<&String> = masked_before.keys().chain(masked_after.keys()).collect();
    let mut diffs = Vec::new();
    for key in keys {
        if schema.is_computed(key) && !desired.contains_key(key) {
            continue;
        }
        let before = masked_before.get(key);
        let after = masked_after.get(key);
        let equal = match (before, after) {
            (Some(b), Some(PlannedValue::Known(a))) => a == b,
            (None, None) => true,
            _ => false,
        };
        if !equal {
            diffs.push(AttributeDiff {
                path: key.clone(),
                before: before.cloned(),
                after: after.cloned(),
                forces_replacement: schema.forces_replacement(key),
            });
        }
    }

    let action = if diffs.is_empty() {
        ChangeAction::NoOp
    } else if diffs.iter().any(|d| d.forces_replacement) {
        ChangeAction::Replace(table.replace_mode(address))
    } else {
        ChangeAction::Update
    };

    if matches!(action, ChangeAction::Replace(_)) && table.prevents_destroy(address) {
        return Err(PlanError::DestroyBlocked {
            address: address.clone(),
        }
        .into());
    }

    let after = match action {
        ChangeAction::NoOp => known(&record.attributes),
        ChangeAction::Update => {
            let mut after = desired;
            table.carry_ignored_planned(address, &mut after, &record.attributes);
            for (key, value) in &record.attributes {
                if schema.is_computed(key) && !after.contains_key(key) {
                    after.insert(key.clone(), PlannedValue::Known(value.clone()));
                }
            }
            after
        }
        _ => desired,
    };

    Ok(ResourceChange {
        address: address.clone(),
        action,
        desired: Some(spec.clone()),
        prior: Some(record.clone()),
        after: Some(after),
        diffs,
        deposed: record.deposed.clone(),
    })
}

fn known(attributes: &Attributes) -> BTreeMap<String, PlannedValue> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), PlannedValue::Known(v.clone())))
        .collect()
}

/// Promotes destroy-first replacements that a create-first replacement
/// depends on, directly or transitively.
fn promote_create_before_destroy(
    changes: &mut BTreeMap<ResourceAddress, ResourceChange>,
    graph: &ResourceGraph,
) {
    let create_first: Vec<ResourceAddress> = changes
        .values()
        .filter(|c| c.action == ChangeAction::Replace(ReplaceMode::CreateFirst))
        .map(|c| c.address.clone())
        .collect();

    for address in create_first {
        if !graph.contains(&address) {
            continue;
        }
        for dependency in graph.transitive_dependencies(&address) {
            if let Some(change) = changes.get_mut(dependency)
                && change.action == ChangeAction::Replace(ReplaceMode::DestroyFirst)
            {
                debug!("{dependency}: promoted to create first by {address}");
                change.action = ChangeAction::Replace(ReplaceMode::CreateFirst);
            }
        }
    }
}

impl ChangeAction {
    /// Short symbol used in plan output.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Destroy => "-",
            Self::Replace(ReplaceMode::DestroyFirst) => "-/+",
            Self::Replace(ReplaceMode::CreateFirst) => "+/-",
        }
    }
}

impl ResourceChange {
    /// Returns true if executing this change does anything.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.action != ChangeAction::NoOp || !self.deposed.is_empty()
    }

    /// Provisioner name of the change.
    #[must_use]
    pub fn provider(&self) -> &str {
        self.desired
            .as_ref()
            .map(|s| s.provider.as_str())
            .or_else(|| self.prior.as_ref().map(|r| r.provider.as_str()))
            .unwrap_or_default()
    }
}

impl DiffResult {
    /// Returns true if any change has work to do.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(ResourceChange::has_work)
    }

    /// Number of changes with the given action.
    #[must_use]
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Changes that have work to do.
    #[must_use]
    pub fn actionable(&self) -> Vec<&ResourceChange> {
        self.changes.iter().filter(|c| c.has_work()).collect()
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "no-op"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Destroy => write!(f, "destroy"),
            Self::Replace(mode) => write!(f, "replace ({mode})"),
        }
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.action.symbol(), self.address, self.action)?;
        if !self.diffs.is_empty() && self.action != ChangeAction::Create {
            let fields: Vec<&str> = self.diffs.iter().map(|d| d.path.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        if !self.deposed.is_empty() {
            write!(f, " [{} deposed]", self.deposed.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecyclePolicy;
    use crate::provider::fake::FakeCloud;

    const TYPES: &[&str] = &["vpc", "subnet", "instance", "db"];

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn spec(address: &str, attrs: &[(&str, Value)]) -> ResourceSpec {
        let attributes = attrs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        ResourceSpec::new(addr(address), attributes).unwrap()
    }

    fn record(address: &str, attrs: &[(&str, Value)]) -> StateRecord {
        let attributes = attrs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        let a = addr(address);
        let provider = a.resource_type.clone();
        StateRecord::new(a, provider, format!("{address}-id"), attributes)
    }

    fn snapshot(records: Vec<StateRecord>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::empty("test");
        for (i, mut r) in records.into_iter().enumerate() {
            r.serial = i as u64 + 1;
            snapshot.records.insert(r.address.clone(), r);
        }
        snapshot.serial = snapshot.records.len() as u64;
        snapshot
    }

    fn diff(specs: &[ResourceSpec], state: &StateSnapshot) -> Result<DiffResult> {
        let registry = FakeCloud::new().registry(TYPES);
        let graph = ResourceGraph::build(specs).unwrap();
        DiffEngine::new(&registry).compute(specs, &graph, state)
    }

    fn action_of(result: &DiffResult, address: &str) -> ChangeAction {
        result
            .changes
            .iter()
            .find(|c| c.address == addr(address))
            .map(|c| c.action)
            .unwrap()
    }

    #[test]
    fn test_create_on_empty_state() {
        let specs = vec![
            spec("vpc.main", &[("cidr", Value::from("10.0.0.0/16"))]),
            spec("subnet.a", &[("vpc_id", Value::from("${vpc.main.id}"))]),
        ];
        let result = diff(&specs, &StateSnapshot::empty("t")).unwrap();

        assert_eq!(result.count(ChangeAction::Create), 2);
        let subnet = &result.changes[0];
        assert_eq!(subnet.address, addr("subnet.a"));
        let after = subnet.after.as_ref().unwrap();
        assert!(after["vpc_id"].is_unknown());
    }

    #[test]
    fn test_noop_when_equal() {
        let specs = vec![spec("vpc.main", &[("cidr", Value::from("10.0.0.0/16"))])];
        let state = snapshot(vec![record(
            "vpc.main",
            &[
                ("cidr", Value::from("10.0.0.0/16")),
                ("id", Value::from("vpc-1")),
                ("arn", Value::from("arn:fake:vpc-1")),
            ],
        )]);
        let result = diff(&specs, &state).unwrap();
        assert_eq!(action_of(&result, "vpc.main"), ChangeAction::NoOp);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_reference_to_unchanged_resource_is_known() {
        let specs = vec![
            spec("vpc.main", &[("cidr", Value::from("10.0.0.0/16"))]),
            spec("subnet.a", &[("vpc_id", Value::from("${vpc.main.id}"))]),
        ];
        let state = snapshot(vec![
            record(
                "vpc.main",
                &[("cidr", Value::from("10.0.0.0/16")), ("id", Value::from("vpc-1"))],
            ),
            record(
                "subnet.a",
                &[("vpc_id", Value::from("vpc-1")), ("id", Value::from("subnet-1"))],
            ),
        ]);
        let result = diff(&specs, &state).unwrap();
        assert_eq!(action_of(&result, "subnet.a"), ChangeAction::NoOp);
    }

    #[test]
    fn test_update_vs_replace() {
        let specs = vec![spec(
            "instance.web",
            &[("image", Value::from("v1")), ("size", Value::from("large"))],
        )];
        let state = snapshot(vec![record(
            "instance.web",
            &[("image", Value::from("v1")), ("size", Value::from("small"))],
        )]);
        let result = diff(&specs, &state).unwrap();
        assert_eq!(action_of(&result, "instance.web"), ChangeAction::Update);
        assert_eq!(result.changes[0].diffs.len(), 1);
        assert_eq!(result.changes[0].diffs[0].path, "size");

        let specs = vec![spec(
            "instance.web",
            &[("image", Value::from("v2")), ("size", Value::from("small"))],
        )];
        let result = diff(&specs, &state).unwrap();
        assert_eq!(
            action_of(&result, "instance.web"),
            ChangeAction::Replace(ReplaceMode::DestroyFirst)
        );
        assert!(result.changes[0].diffs[0].forces_replacement);
    }

    #[test]
    fn test_create_before_destroy_mode() {
        let specs = vec![spec("instance.web", &[("image", Value::from("v2"))])
            .with_lifecycle(LifecyclePolicy::create_before_destroy())];
        let state = snapshot(vec![record("instance.web", &[("image", Value::from("v1"))])]);
        let result = diff(&specs, &state).unwrap();
        assert_eq!(
            action_of(&result, "instance.web"),
            ChangeAction::Replace(ReplaceMode::CreateFirst)
        );
    }

    #[test]
    fn test_ignore_changes_masks_both_sides() {
        let specs = vec![spec(
            "instance.web",
            &[("image", Value::from("v2")), ("size", Value::from("small"))],
        )
        .with_lifecycle(LifecyclePolicy::ignoring(["image"]))];
        let state = snapshot(vec![record(
            "instance.web",
            &[("image", Value::from("v1")), ("size", Value::from("small"))],
        )]);
        let result = diff(&specs, &state).unwrap();
        assert_eq!(action_of(&result, "instance.web"), ChangeAction::NoOp);
    }

    #[test]
    fn test_update_keeps_ignored_recorded_values() {
        let specs = vec![spec(
            "instance.web",
            &[("image", Value::from("v2")), ("size", Value::from("large"))],
        )
        .with_lifecycle(LifecyclePolicy::ignoring(["image"]))];
        let state = snapshot(vec![record(
            "instance.web",
            &[
                ("image", Value::from("v1")),
                ("size", Value::from("small")),
                ("id", Value::from("i-1")),
            ],
        )]);
        let result = diff(&specs, &state).unwrap();
        let change = &result.changes[0];
        assert_eq!(change.action, ChangeAction::Update);
        let after = change.after.as_ref().unwrap();
        assert_eq!(after["image"], PlannedValue::Known(Value::from("v1")));
        assert_eq!(after["id"], PlannedValue::Known(Value::from("i-1")));
    }

    #[test]
    fn test_destroy_blocked_by_prevent_destroy() {
        let state = snapshot(vec![
            record("db.main", &[]).with_lifecycle(LifecyclePolicy::protected())
        ]);
        let err = diff(&[], &state).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::Plan(PlanError::DestroyBlocked { ref address }) if *address == addr("db.main")
        ));
    }

    #[test]
    fn test_replace_blocked_by_prevent_destroy() {
        let specs = vec![spec("db.main", &[("image", Value::from("v2"))])
            .with_lifecycle(LifecyclePolicy::protected())];
        let state = snapshot(vec![record("db.main", &[("image", Value::from("v1"))])]);
        assert!(matches!(
            diff(&specs, &state),
            Err(ForgeError::Plan(PlanError::DestroyBlocked { .. }))
        ));
    }

    #[test]
    fn test_destroy_orphan() {
        let state = snapshot(vec![record("vpc.old", &[])]);
        let result = diff(&[], &state).unwrap();
        assert_eq!(action_of(&result, "vpc.old"), ChangeAction::Destroy);
    }

    #[test]
    fn test_dependency_of_create_first_is_promoted() {
        let specs = vec![
            spec("vpc.main", &[("zone", Value::from("b"))]),
            spec(
                "instance.web",
                &[("image", Value::from("v2")), ("vpc", Value::from("${vpc.main.id}"))],
            )
            .with_lifecycle(LifecyclePolicy::create_before_destroy()),
        ];
        let state = snapshot(vec![
            record("vpc.main", &[("zone", Value::from("a")), ("id", Value::from("vpc-1"))]),
            record(
                "instance.web",
                &[("image", Value::from("v1")), ("vpc", Value::from("vpc-1"))],
            ),
        ]);
        let result = diff(&specs, &state).unwrap();
        assert_eq!(
            action_of(&result, "vpc.main"),
            ChangeAction::Replace(ReplaceMode::CreateFirst)
        );
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let specs = vec![spec("bucket.logs", &[])];
        assert!(matches!(
            diff(&specs, &StateSnapshot::empty("t")),
            Err(ForgeError::Config(ConfigError::UnknownResourceType { .. }))
        ));
    }

    #[test]
    fn test_compute_destroy() {
        let registry = FakeCloud::new().registry(TYPES);
        let engine = DiffEngine::new(&registry);
        let state = snapshot(vec![record("vpc.main", &[]), record("subnet.a", &[])]);
        let result = engine.compute_destroy(&state).unwrap();
        assert_eq!(result.count(ChangeAction::Destroy), 2);

        let protected = snapshot(vec![
            record("db.main", &[]).with_lifecycle(LifecyclePolicy::protected())
        ]);
        assert!(engine.compute_destroy(&protected).is_err());
    }

    #[test]
    fn test_diff_is_deterministic() {
        let specs = vec![
            spec("vpc.main", &[("cidr", Value::from("10.1.0.0/16"))]),
            spec("subnet.b", &[("vpc_id", Value::from("${vpc.main.id}"))]),
            spec("subnet.a", &[("vpc_id", Value::from("${vpc.main.id}"))]),
            spec("instance.web", &[("image", Value::from("v2"))]),
        ];
        let state = snapshot(vec![
            record("vpc.main", &[("cidr", Value::from("10.0.0.0/16")), ("id", Value::from("v"))]),
            record("instance.web", &[("image", Value::from("v1"))]),
            record("vpc.gone", &[]),
        ]);

        let first = serde_json::to_string(&diff(&specs, &state).unwrap().changes).unwrap();
        for _ in 0..5 {
            let again = serde_json::to_string(&diff(&specs, &state).unwrap().changes).unwrap();
            assert_eq!(first, again);
        }
    }
}
