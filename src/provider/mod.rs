//! Provisioning clients.
//!
//! A [`Provisioner`] manages the real objects of one resource type. The
//! engine only talks to provisioners through this trait; the
//! [`ProviderRegistry`] maps resource types to their provisioner.

mod local;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Attributes, ResourceSpec};
use crate::error::{ConfigError, ProvisionResult};

pub use local::{LocalFileProvisioner, NullResourceProvisioner};

/// What a provisioner declares about its attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Top-level attributes that cannot be updated in place.
    pub requires_replacement: BTreeSet<String>,
    /// Top-level attributes set by the provisioner, not by configuration.
    pub computed: BTreeSet<String>,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Provider-assigned identifier of the new object.
    pub real_id: String,
    /// Attributes of the new object, including computed ones.
    pub attributes: Attributes,
}

/// Client for the real objects of one resource type.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Attribute schema of the resource type.
    fn schema(&self) -> ResourceSchema;

    /// Creates a new object.
    async fn create(&self, attributes: &Attributes) -> ProvisionResult<Created>;

    /// Reads an object. Returns `None` if it no longer exists.
    ///
    /// Attributes the provisioner cannot observe may be omitted.
    async fn read(&self, real_id: &str) -> ProvisionResult<Option<Attributes>>;

    /// Updates an object in place.
    async fn update(&self, real_id: &str, attributes: &Attributes) -> ProvisionResult<Attributes>;

    /// Deletes an object.
    async fn delete(&self, real_id: &str) -> ProvisionResult<()>;
}

/// Maps resource types to provisioners.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    provisioners: BTreeMap<String, Arc<dyn Provisioner>>,
}

impl ResourceSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks attributes as requiring replacement.
    #[must_use]
    pub fn with_replacement<I: IntoIterator<Item = &'static str>>(mut self, attributes: I) -> Self {
        self.requires_replacement
            .extend(attributes.into_iter().map(String::from));
        self
    }

    /// Marks attributes as computed.
    #[must_use]
    pub fn with_computed<I: IntoIterator<Item = &'static str>>(mut self, attributes: I) -> Self {
        self.computed.extend(attributes.into_iter().map(String::from));
        self
    }

    /// Returns true if a change to `attribute` forces replacement.
    #[must_use]
    pub fn forces_replacement(&self, attribute: &str) -> bool {
        self.requires_replacement.contains(attribute)
    }

    /// Returns true if `attribute` is set by the provisioner.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        self.computed.contains(attribute)
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `local_file` and `null_resource` types.
    ///
    /// Relative `local_file` paths resolve against `base_dir`.
    #[must_use]
    pub fn with_builtins(base_dir: impl Into<PathBuf>) -> Self {
        Self::new()
            .with("local_file", Arc::new(LocalFileProvisioner::new(base_dir)))
            .with("null_resource", Arc::new(NullResourceProvisioner::new()))
    }

    /// Registers a provisioner, replacing any previous one for the type.
    pub fn register(&mut self, resource_type: impl Into<String>, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.insert(resource_type.into(), provisioner);
    }

    /// Builder form of [`ProviderRegistry::register`].
    #[must_use]
    pub fn with(mut self, resource_type: impl Into<String>, provisioner: Arc<dyn Provisioner>) -> Self {
        self.register(resource_type, provisioner);
        self
    }

    /// Returns the provisioner for a provider name.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<dyn Provisioner>> {
        self.provisioners.get(provider).cloned()
    }

    /// Returns the schema for a provider name.
    #[must_use]
    pub fn schema(&self, provider: &str) -> Option<ResourceSchema> {
        self.provisioners.get(provider).map(|p| p.schema())
    }

    /// Registered provider names.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.provisioners.keys().map(String::as_str)
    }

    /// Checks that every spec has a registered provisioner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownResourceType`] for the first spec
    /// whose provisioner is missing.
    pub fn check(&self, specs: &[ResourceSpec]) -> Result<(), ConfigError> {
        for spec in specs {
            if !self.provisioners.contains_key(&spec.provider) {
                return Err(ConfigError::UnknownResourceType {
                    resource_type: spec.provider.clone(),
                    address: spec.address.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.provisioners.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ProviderRegistry::with_builtins(".");
        let types: Vec<&str> = registry.types().collect();
        assert_eq!(types, vec!["local_file", "null_resource"]);

        let schema = registry.schema("local_file").unwrap();
        assert!(schema.forces_replacement("path"));
        assert!(!schema.forces_replacement("content"));
        assert!(schema.is_computed("content_sha256"));
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let registry = ProviderRegistry::with_builtins(".");
        let spec = ResourceSpec::new("aws_instance.web".parse().unwrap(), Attributes::new()).unwrap();
        let err = registry.check(&[spec]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownResourceType { ref resource_type, .. } if resource_type == "aws_instance"
        ));
    }

    #[tokio::test]
    async fn test_registry_dispatches_to_mock() {
        let mut mock = MockProvisioner::new();
        mock.expect_schema().returning(ResourceSchema::new);
        mock.expect_delete()
            .withf(|id| id == "obj-1")
            .times(1)
            .returning(|_| Ok(()));

        let registry = ProviderRegistry::new().with("mock_thing", Arc::new(mock));
        let provisioner = registry.get("mock_thing").unwrap();
        provisioner.delete("obj-1").await.unwrap();
        assert!(registry.get("other").is_none());
    }
}
