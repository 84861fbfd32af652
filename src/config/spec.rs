//! Configuration types.
//!
//! The raw types map one-to-one onto `forgeplan.yaml`. The parser turns
//! them into a [`Configuration`]: a flat, address-sorted list of
//! [`ResourceSpec`]s with every load-time expression substituted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::ConfigError;

use super::address::ResourceAddress;
use super::reference::find_references;
use super::value::Attributes;

/// The root of a `forgeplan.yaml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Engine settings.
    #[serde(default)]
    pub settings: Settings,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Input variables.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableConfig>,
    /// Root module resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Child modules, keyed by module name.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
    /// Recorded renames.
    #[serde(default)]
    pub moved: Vec<MovedConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Engine settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Deadline applied to actions without their own timeout.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State file path for the local backend, relative to the config file.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON file on the local filesystem.
    #[default]
    Local,
    /// Process memory only; nothing survives the run.
    Memory,
}

/// Declaration of an input variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariableConfig {
    /// Value used when neither the CLI nor the environment sets one.
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A resource block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type, selects the provisioner.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name, unique per type within a module.
    pub name: String,
    /// Number of instances to create.
    #[serde(default)]
    pub count: Option<u64>,
    /// Instance keys, as a list of strings or a map of key to value.
    #[serde(default)]
    pub for_each: Option<serde_yaml::Value>,
    /// Explicit dependencies, relative to the enclosing module.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
    /// Lifecycle overrides.
    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
    /// Per-action deadline in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A module block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModuleConfig {
    /// Resources declared in this module.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Nested modules.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

/// A `moved` block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MovedConfig {
    /// Previous address.
    pub from: String,
    /// New address.
    pub to: String,
}

/// Per-resource lifecycle overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LifecyclePolicy {
    /// Refuse any plan that would destroy the real object.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Create the replacement before destroying the old object.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Dotted attribute paths excluded from comparison.
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
}

/// The desired state of one resource instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Address of the instance.
    pub address: ResourceAddress,
    /// Name of the provisioner handling this resource.
    pub provider: String,
    /// Desired attributes, possibly containing `${...}` references.
    pub attributes: Attributes,
    /// Lifecycle overrides.
    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceAddress>,
    /// Resources referenced from attribute values.
    #[serde(default)]
    pub references: BTreeSet<ResourceAddress>,
    /// Per-action deadline in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A recorded rename from one address to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Move {
    /// Previous address.
    pub from: ResourceAddress,
    /// New address.
    pub to: ResourceAddress,
}

/// A fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Engine settings.
    pub settings: Settings,
    /// State backend configuration.
    pub state: StateConfig,
    /// Resource specs sorted by address.
    pub resources: Vec<ResourceSpec>,
    /// Recorded renames.
    pub moves: Vec<Move>,
}

const fn default_parallelism() -> usize {
    10
}

const fn default_timeout_secs() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Settings {
    /// Default per-action deadline.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl ResourceSpec {
    /// Creates a spec, inferring references from the attribute values.
    ///
    /// The provisioner defaults to the resource type.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute contains a malformed template.
    pub fn new(address: ResourceAddress, attributes: Attributes) -> Result<Self, ConfigError> {
        let mut references = BTreeSet::new();
        for value in attributes.values() {
            for reference in find_references(value, &address.module_path)? {
                references.insert(reference.target);
            }
        }
        Ok(Self {
            provider: address.resource_type.clone(),
            address,
            attributes,
            lifecycle: LifecyclePolicy::default(),
            depends_on: BTreeSet::new(),
            references,
            timeout_secs: None,
        })
    }

    /// Sets the lifecycle policy.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecyclePolicy) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, address: ResourceAddress) -> Self {
        self.depends_on.insert(address);
        self
    }

    /// Sets the per-action deadline.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Every address this resource must be created after.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceAddress> {
        self.depends_on.union(&self.references).cloned().collect()
    }

    /// Per-action deadline, if configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl LifecyclePolicy {
    /// Policy with `prevent_destroy` set.
    #[must_use]
    pub fn protected() -> Self {
        Self {
            prevent_destroy: true,
            ..Self::default()
        }
    }

    /// Policy with `create_before_destroy` set.
    #[must_use]
    pub fn create_before_destroy() -> Self {
        Self {
            create_before_destroy: true,
            ..Self::default()
        }
    }

    /// Policy ignoring the given dotted paths.
    #[must_use]
    pub fn ignoring<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignore_changes: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl Configuration {
    /// Returns the spec at the given address.
    #[must_use]
    pub fn resource(&self, address: &ResourceAddress) -> Option<&ResourceSpec> {
        self.resources
            .binary_search_by(|spec| spec.address.cmp(address))
            .ok()
            .map(|i| &self.resources[i])
    }

    /// Resource addresses in order.
    #[must_use]
    pub fn addresses(&self) -> Vec<&ResourceAddress> {
        self.resources.iter().map(|spec| &spec.address).collect()
    }

    /// Distinct resource types used by the configuration.
    #[must_use]
    pub fn resource_types(&self) -> BTreeSet<&str> {
        self.resources
            .iter()
            .map(|spec| spec.address.resource_type.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;

    #[test]
    fn test_spec_infers_references() {
        let address: ResourceAddress = "module.app.local_file.cfg".parse().unwrap();
        let attributes: Attributes = [
            ("path".to_string(), Value::from("/tmp/${null_resource.seed.id}")),
            ("content".to_string(), Value::from("static")),
        ]
        .into();
        let spec = ResourceSpec::new(address, attributes).unwrap();

        assert_eq!(spec.provider, "local_file");
        let refs: Vec<String> = spec.references.iter().map(ToString::to_string).collect();
        assert_eq!(refs, vec!["module.app.null_resource.seed"]);
    }

    #[test]
    fn test_dependencies_union() {
        let spec = ResourceSpec::new(
            "null_resource.b".parse().unwrap(),
            [("x".to_string(), Value::from("${null_resource.a.id}"))].into(),
        )
        .unwrap()
        .with_dependency("null_resource.c".parse().unwrap())
        .with_dependency("null_resource.a".parse().unwrap());

        assert_eq!(spec.dependencies().len(), 2);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.parallelism, 10);
        assert_eq!(settings.default_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_lifecycle_yaml() {
        let policy: LifecyclePolicy =
            serde_yaml::from_str("{prevent_destroy: true, ignore_changes: [tags.owner]}").unwrap();
        assert!(policy.prevent_destroy);
        assert!(!policy.create_before_destroy);
        assert!(policy.ignore_changes.contains("tags.owner"));
    }
}
