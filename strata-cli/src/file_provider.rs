//! File-backed provider
//!
//! Realizes any resource kind by recording it in a JSON file keyed by the
//! identifier it assigns (`kind-<8 hex>`). Useful for trying configurations
//! end to end without touching real infrastructure.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use strata_core::provider::{BoxFuture, Provider, ProviderError, ProviderResult, ResourceType};
use strata_core::resource::{Resource, ResourceId, State, Value};

type Stored = HashMap<String, HashMap<String, serde_json::Value>>;

pub struct FileProvider {
    path: PathBuf,
    /// Serializes read-modify-write cycles of concurrent operations
    guard: Mutex<()>,
}

impl FileProvider {
    pub const FILE_NAME: &'static str = "resources.json";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(Self::FILE_NAME),
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> ProviderResult<Stored> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ProviderError::new(format!("Failed to parse {}", self.path.display())).with_cause(e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(ProviderError::retryable(format!("Failed to read {}", self.path.display())).with_cause(e)),
        }
    }

    fn save(&self, stored: &Stored) -> ProviderResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProviderError::new("Failed to create resource directory").with_cause(e))?;
        }
        let content = serde_json::to_string_pretty(stored)
            .map_err(|e| ProviderError::new("Failed to serialize resources").with_cause(e))?;
        fs::write(&self.path, content)
            .map_err(|e| ProviderError::retryable(format!("Failed to write {}", self.path.display())).with_cause(e))
    }

    /// Run a read-modify-write cycle on the stored resources
    fn modify<T>(&self, change: impl FnOnce(&mut Stored) -> ProviderResult<T>) -> ProviderResult<T> {
        let _held = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stored = self.load()?;
        let result = change(&mut stored)?;
        self.save(&stored)?;
        Ok(result)
    }

    fn to_json(attributes: &HashMap<String, Value>) -> HashMap<String, serde_json::Value> {
        attributes.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
    }

    fn from_json(attributes: &HashMap<String, serde_json::Value>) -> HashMap<String, Value> {
        attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect()
    }

    fn new_identifier(kind: &str) -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", kind, &hex[..8])
    }
}

impl Provider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        vec![]
    }

    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            let stored = self.load()?;
            match stored.get(&identifier) {
                Some(attrs) => Ok(State::existing(id, Self::from_json(attrs)).with_identifier(identifier)),
                None => Ok(State::not_found(id)),
            }
        })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move {
            let identifier = Self::new_identifier(&resource.id.kind);
            self.modify(|stored| {
                stored.insert(identifier.clone(), Self::to_json(&resource.attributes));
                Ok(())
            })
            .map_err(|e| e.for_resource(resource.id.clone()))?;

            Ok(State::existing(resource.id, resource.attributes).with_identifier(identifier))
        })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        _from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let to = to.clone();
        Box::pin(async move {
            self.modify(|stored| match stored.get_mut(&identifier) {
                Some(attrs) => {
                    *attrs = Self::to_json(&to.attributes);
                    Ok(())
                }
                None => Err(ProviderError::new(format!("{} does not exist", identifier))),
            })
            .map_err(|e| e.for_resource(id.clone()))?;

            Ok(State::existing(id, to.attributes).with_identifier(identifier))
        })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            self.modify(|stored| {
                if stored.remove(&identifier).is_none() {
                    log::warn!("{} ({}) was already gone", id, identifier);
                }
                Ok(())
            })
            .map_err(|e| e.for_resource(id.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(name: &str) -> Resource {
        Resource::new(ResourceId::new("bucket", name))
            .with_attribute("acl", Value::String("private".to_string()))
    }

    #[tokio::test]
    async fn create_read_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileProvider::new(dir.path());
        let resource = bucket("logs");

        let created = provider.create(&resource).await.unwrap();
        let identifier = created.identifier.clone().unwrap();
        assert!(identifier.starts_with("bucket-"));
        assert_eq!(identifier.len(), "bucket-".len() + 8);

        let read = provider.read(&resource.id, &identifier).await.unwrap();
        assert!(read.exists);
        assert_eq!(read.attributes["acl"], Value::String("private".to_string()));

        let changed = Resource::new(resource.id.clone())
            .with_attribute("acl", Value::String("public-read".to_string()));
        provider
            .update(&resource.id, &identifier, &read, &changed)
            .await
            .unwrap();
        let read = provider.read(&resource.id, &identifier).await.unwrap();
        assert_eq!(read.attributes["acl"], Value::String("public-read".to_string()));

        provider.delete(&resource.id, &identifier).await.unwrap();
        assert!(!provider.read(&resource.id, &identifier).await.unwrap().exists);
    }

    #[tokio::test]
    async fn identifiers_are_unique_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileProvider::new(dir.path());

        let a = provider.create(&bucket("a")).await.unwrap().identifier;
        let b = provider.create(&bucket("b")).await.unwrap().identifier;
        assert_ne!(a, b);
        assert_eq!(provider.load().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_of_missing_resource_fails() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileProvider::new(dir.path());
        let resource = bucket("ghost");
        let from = State::not_found(resource.id.clone());

        let err = provider
            .update(&resource.id, "bucket-00000000", &from, &resource)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.resource_id, Some(resource.id));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(FileProvider::FILE_NAME), "not json").unwrap();
        let provider = FileProvider::new(dir.path());

        assert!(provider.create(&bucket("x")).await.is_err());
    }
}
