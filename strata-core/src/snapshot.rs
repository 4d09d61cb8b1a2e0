//! Snapshot - Last-known realized state as seen by the planner and executor
//!
//! The durable store lives in `strata-state`; the core only needs a read-only
//! snapshot for diffing and a narrow writer interface for recording results.

use std::collections::HashMap;

use crate::provider::BoxFuture;
use crate::resource::{ResourceId, Value};

/// Record of a previously realized resource instance
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub id: ResourceId,
    /// Provider-assigned identifier
    pub identifier: String,
    /// Resolved attributes as returned by the provider
    pub attributes: HashMap<String, Value>,
    /// Resources this one referenced when it was realized
    pub dependencies: Vec<ResourceId>,
}

impl StateRecord {
    pub fn new(id: ResourceId, identifier: impl Into<String>) -> Self {
        Self {
            id,
            identifier: identifier.into(),
            attributes: HashMap::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.dependencies.push(id);
        self
    }

    /// Look up an attribute for reference resolution; `id` falls back to the identifier
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match self.attributes.get(name) {
            Some(v) => Some(v.clone()),
            None if name == "id" => Some(Value::String(self.identifier.clone())),
            None => None,
        }
    }
}

/// All records, in the order they were first realized
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    records: Vec<StateRecord>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<StateRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[StateRecord] {
        &self.records
    }

    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn position_of(&self, id: &ResourceId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }

    /// Insert or replace a record, keeping the original position of existing ones
    pub fn upsert(&mut self, record: StateRecord) {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn remove(&mut self, id: &ResourceId) -> Option<StateRecord> {
        let pos = self.position_of(id)?;
        Some(self.records.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to write state: {0}")]
pub struct StateWriteError(pub String);

/// Durable sink for per-node results
///
/// The executor calls this from a single task, immediately after each
/// operation finishes, so implementations never see concurrent writes.
pub trait StateWriter: Send {
    fn record_success(&mut self, record: StateRecord) -> BoxFuture<'_, Result<(), StateWriteError>>;

    fn record_removal(&mut self, id: &ResourceId) -> BoxFuture<'_, Result<(), StateWriteError>>;
}

/// In-memory writer: a snapshot can absorb results directly
impl StateWriter for StateSnapshot {
    fn record_success(&mut self, record: StateRecord) -> BoxFuture<'_, Result<(), StateWriteError>> {
        self.upsert(record);
        Box::pin(async { Ok(()) })
    }

    fn record_removal(&mut self, id: &ResourceId) -> BoxFuture<'_, Result<(), StateWriteError>> {
        self.remove(id);
        Box::pin(async { Ok(()) })
    }
}
