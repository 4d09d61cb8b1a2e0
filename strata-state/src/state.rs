//! State file structures for persisting infrastructure state

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use strata_core::resource::{ResourceId, Value};
use strata_core::snapshot::{StateRecord, StateSnapshot};

use crate::backend::{BackendError, BackendResult};

/// The main state file structure that persists to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of Strata that last modified this state
    pub strata_version: String,
    /// Realized resources, in the order they were first realized
    pub resources: Vec<ResourceState>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            strata_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Increment serial and update the tool version for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.strata_version = env!("CARGO_PKG_VERSION").to_string();
    }

    pub fn find_resource(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources.iter().find(|r| r.matches(id))
    }

    /// Add or update a resource; an existing entry keeps its position
    pub fn upsert_resource(&mut self, resource: ResourceState) {
        match self.resources.iter_mut().find(|r| r.matches(&resource.id())) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
    }

    pub fn remove_resource(&mut self, id: &ResourceId) -> Option<ResourceState> {
        let pos = self.resources.iter().position(|r| r.matches(id))?;
        Some(self.resources.remove(pos))
    }

    /// Convert into the planner's view of the state
    pub fn to_snapshot(&self) -> BackendResult<StateSnapshot> {
        let records = self
            .resources
            .iter()
            .map(ResourceState::to_record)
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(StateSnapshot::from_records(records))
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a single realized resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Provider-assigned identifier
    pub identifier: String,
    /// Resolved attributes as JSON values
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    /// Addresses of the resources this one referenced (e.g. "vpc.main")
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ResourceState {
    pub fn new(id: &ResourceId, identifier: impl Into<String>) -> Self {
        Self {
            kind: id.kind.clone(),
            name: id.name.clone(),
            index: id.index,
            identifier: identifier.into(),
            attributes: HashMap::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            kind: self.kind.clone(),
            name: self.name.clone(),
            index: self.index,
        }
    }

    fn matches(&self, id: &ResourceId) -> bool {
        self.kind == id.kind && self.name == id.name && self.index == id.index
    }

    pub fn from_record(record: &StateRecord) -> Self {
        Self {
            attributes: record
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
            dependencies: record.dependencies.iter().map(|d| d.to_string()).collect(),
            ..Self::new(&record.id, record.identifier.clone())
        }
    }

    pub fn to_record(&self) -> BackendResult<StateRecord> {
        let dependencies = self
            .dependencies
            .iter()
            .map(|d| {
                ResourceId::parse(d).ok_or_else(|| {
                    BackendError::InvalidState(format!(
                        "{} has malformed dependency address '{}'",
                        self.id(),
                        d
                    ))
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        Ok(StateRecord {
            id: self.id(),
            identifier: self.identifier.clone(),
            attributes: self
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
            dependencies,
        })
    }
}
