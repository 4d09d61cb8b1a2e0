//! Config - Load the declarative configuration document
//!
//! The document is JSON: a list of resources (kind/name/count/attributes) and
//! an optional `settings` block. The resource of kind `backend` is reserved
//! and describes where state is stored; it never enters the resource graph.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::expression::Expression;
use crate::resource::{ResourceId, Value};

/// Resource kind reserved for the state backend
pub const BACKEND_KIND: &str = "backend";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "strata.json";

/// A resource as declared in the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    pub kind: String,
    pub name: String,
    pub attributes: HashMap<String, Expression>,
    /// Number of homogeneous replicas; `None` means a single, unindexed instance
    pub count: Option<usize>,
}

impl ResourceDefinition {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attributes: HashMap::new(),
            count: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, expr: Expression) -> Self {
        self.attributes.insert(key.into(), expr);
        self
    }

    /// Convenience for tests and embedders: parse the attribute from JSON
    pub fn with_json_attribute(
        mut self,
        key: impl Into<String>,
        json: serde_json::Value,
    ) -> Result<Self, ConfigError> {
        let key = key.into();
        let expr = Expression::from_json(&json).map_err(|message| ConfigError::InvalidExpression {
            resource: format!("{}.{}", self.kind, self.name),
            attribute: key.clone(),
            message,
        })?;
        self.attributes.insert(key, expr);
        Ok(self)
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Identity of the definition itself (no index)
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.kind, &self.name)
    }
}

/// The reserved backend resource
#[derive(Debug, Clone, PartialEq)]
pub struct BackendBlock {
    pub name: String,
    /// Backend type (e.g., "local", "memory")
    pub backend_type: String,
    pub attributes: HashMap<String, Value>,
}

/// Engine settings; every field can be overridden from the command line
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Maximum number of provider operations in flight
    pub parallelism: usize,
    /// Retries for errors the provider classifies as retryable
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// 0 fails fast when the state is locked
    pub lock_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: 10,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            lock_timeout_secs: 0,
        }
    }
}

/// A fully loaded configuration document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    /// Resource definitions in declaration order
    pub resources: Vec<ResourceDefinition>,
    pub backend: Option<BackendBlock>,
    pub settings: Settings,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    kind: String,
    name: String,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

/// Read and parse a configuration file
pub fn load(path: &Path) -> Result<Configuration, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content)
}

/// Parse a configuration document
pub fn parse(content: &str) -> Result<Configuration, ConfigError> {
    let raw: RawDocument = serde_json::from_str(content)?;

    let mut config = Configuration {
        settings: raw.settings,
        ..Default::default()
    };
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for resource in raw.resources {
        if resource.kind == BACKEND_KIND {
            let block = parse_backend(resource)?;
            if let Some(existing) = &config.backend {
                return Err(ConfigError::DuplicateBackend(
                    existing.name.clone(),
                    block.name,
                ));
            }
            config.backend = Some(block);
            continue;
        }

        if !seen.insert((resource.kind.clone(), resource.name.clone())) {
            return Err(ConfigError::DuplicateResource(ResourceId::new(
                resource.kind,
                resource.name,
            )));
        }

        let mut definition = ResourceDefinition::new(&resource.kind, &resource.name);
        definition.count = resource.count;
        for (key, json) in resource.attributes {
            let expr =
                Expression::from_json(&json).map_err(|message| ConfigError::InvalidExpression {
                    resource: format!("{}.{}", resource.kind, resource.name),
                    attribute: key.clone(),
                    message,
                })?;
            definition.attributes.insert(key, expr);
        }
        config.resources.push(definition);
    }

    log::debug!(
        "loaded {} resource definitions (backend: {})",
        config.resources.len(),
        config
            .backend
            .as_ref()
            .map(|b| b.backend_type.as_str())
            .unwrap_or("default")
    );

    Ok(config)
}

fn parse_backend(resource: RawResource) -> Result<BackendBlock, ConfigError> {
    if resource.count.is_some() {
        return Err(ConfigError::InvalidBackend(
            "the backend resource cannot be repeated".to_string(),
        ));
    }

    let mut attributes: HashMap<String, Value> = resource
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect();

    if attributes.values().any(|v| matches!(v, Value::String(s) if s.contains("${"))) {
        return Err(ConfigError::InvalidBackend(
            "backend attributes cannot reference other resources".to_string(),
        ));
    }

    let backend_type = match attributes.remove("type") {
        Some(Value::String(t)) => t,
        Some(other) => {
            return Err(ConfigError::InvalidBackend(format!(
                "type must be a string, got {}",
                other
            )));
        }
        None => "local".to_string(),
    };

    Ok(BackendBlock {
        name: resource.name,
        backend_type,
        attributes,
    })
}
