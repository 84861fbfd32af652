//! Built-in resource types that act on the local machine.
//!
//! `local_file` writes a file; its `path` cannot change in place.
//! `null_resource` has no real object; changing its `triggers` replaces it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::config::{hash_bytes, Attributes, Value};
use crate::error::{ProvisionError, ProvisionResult};

use super::{Created, Provisioner, ResourceSchema};

/// Provisioner for `local_file`.
#[derive(Debug, Clone)]
pub struct LocalFileProvisioner {
    base_dir: PathBuf,
}

/// Provisioner for `null_resource`.
#[derive(Debug, Clone, Default)]
pub struct NullResourceProvisioner;

impl LocalFileProvisioner {
    /// Creates a provisioner resolving relative paths against `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    async fn write(&self, path: &str, content: &str) -> ProvisionResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProvisionError::api(format!("cannot create {}: {e}", parent.display())))?;
        }
        fs::write(&full, content)
            .await
            .map_err(|e| ProvisionError::api(format!("cannot write {}: {e}", full.display())))?;
        debug!("Wrote {} byte(s) to {}", content.len(), full.display());
        Ok(())
    }
}

fn string_attribute<'a>(attributes: &'a Attributes, name: &str) -> ProvisionResult<Option<&'a str>> {
    match attributes.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ProvisionError::invalid(format!(
            "'{name}' must be a string, got {other}"
        ))),
    }
}

fn file_attributes(path: &str, content: &str) -> Attributes {
    [
        ("path".to_string(), Value::from(path)),
        ("content".to_string(), Value::from(content)),
        ("id".to_string(), Value::from(path)),
        ("content_sha256".to_string(), Value::from(hash_bytes(content.as_bytes()))),
        ("size".to_string(), Value::from(content.len() as u64)),
    ]
    .into()
}

#[async_trait]
impl Provisioner for LocalFileProvisioner {
    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new()
            .with_replacement(["path"])
            .with_computed(["id", "content_sha256", "size"])
    }

    async fn create(&self, attributes: &Attributes) -> ProvisionResult<Created> {
        let path = string_attribute(attributes, "path")?
            .ok_or_else(|| ProvisionError::invalid("'path' is required"))?;
        let content = string_attribute(attributes, "content")?.unwrap_or_default();

        self.write(path, content).await?;
        Ok(Created {
            real_id: path.to_string(),
            attributes: file_attributes(path, content),
        })
    }

    async fn read(&self, real_id: &str) -> ProvisionResult<Option<Attributes>> {
        match fs::read_to_string(self.resolve(real_id)).await {
            Ok(content) => Ok(Some(file_attributes(real_id, &content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProvisionError::api(format!("cannot read {real_id}: {e}"))),
        }
    }

    async fn update(&self, real_id: &str, attributes: &Attributes) -> ProvisionResult<Attributes> {
        let content = string_attribute(attributes, "content")?.unwrap_or_default();
        self.write(real_id, content).await?;
        Ok(file_attributes(real_id, content))
    }

    async fn delete(&self, real_id: &str) -> ProvisionResult<()> {
        match fs::remove_file(self.resolve(real_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProvisionError::NotFound {
                real_id: real_id.to_string(),
            }),
            Err(e) => Err(ProvisionError::api(format!("cannot delete {real_id}: {e}"))),
        }
    }
}

impl NullResourceProvisioner {
    /// Creates the provisioner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provisioner for NullResourceProvisioner {
    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new()
            .with_replacement(["triggers"])
            .with_computed(["id"])
    }

    async fn create(&self, attributes: &Attributes) -> ProvisionResult<Created> {
        if let Some(triggers) = attributes.get("triggers")
            && triggers.as_map().is_none()
        {
            return Err(ProvisionError::invalid("'triggers' must be a map"));
        }
        let real_id = Uuid::new_v4().simple().to_string();
        let mut created = attributes.clone();
        created.insert("id".to_string(), Value::from(real_id.as_str()));
        Ok(Created {
            real_id,
            attributes: created,
        })
    }

    async fn read(&self, real_id: &str) -> ProvisionResult<Option<Attributes>> {
        Ok(Some([("id".to_string(), Value::from(real_id))].into()))
    }

    async fn update(&self, real_id: &str, attributes: &Attributes) -> ProvisionResult<Attributes> {
        let mut updated = attributes.clone();
        updated.insert("id".to_string(), Value::from(real_id));
        Ok(updated)
    }

    async fn delete(&self, _real_id: &str) -> ProvisionResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attrs(path: &str, content: &str) -> Attributes {
        [
            ("path".to_string(), Value::from(path)),
            ("content".to_string(), Value::from(content)),
        ]
        .into()
    }

    #[tokio::test]
    async fn test_local_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let provisioner = LocalFileProvisioner::new(dir.path());

        let created = provisioner.create(&attrs("out/motd.txt", "hello")).await.unwrap();
        assert_eq!(created.real_id, "out/motd.txt");
        assert_eq!(created.attributes["size"], Value::from(5_u64));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/motd.txt")).unwrap(),
            "hello"
        );

        let updated = provisioner
            .update("out/motd.txt", &attrs("out/motd.txt", "bye"))
            .await
            .unwrap();
        assert_eq!(updated["content"], Value::from("bye"));

        let read = provisioner.read("out/motd.txt").await.unwrap().unwrap();
        assert_eq!(read, updated);

        provisioner.delete("out/motd.txt").await.unwrap();
        assert!(provisioner.read("out/motd.txt").await.unwrap().is_none());
        assert!(matches!(
            provisioner.delete("out/motd.txt").await,
            Err(ProvisionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_file_requires_path() {
        let provisioner = LocalFileProvisioner::new(".");
        let err = provisioner.create(&Attributes::new()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidAttributes { .. }));
    }

    #[tokio::test]
    async fn test_null_resource_assigns_id() {
        let provisioner = NullResourceProvisioner::new();
        let triggers: Attributes = [(
            "triggers".to_string(),
            Value::Map([("v".to_string(), Value::from("1"))].into()),
        )]
        .into();
        let created = provisioner.create(&triggers).await.unwrap();
        assert_eq!(created.attributes["id"], Value::from(created.real_id.as_str()));
        assert!(created.attributes.contains_key("triggers"));

        let bad: Attributes = [("triggers".to_string(), Value::from("x"))].into();
        assert!(provisioner.create(&bad).await.is_err());
    }
}
