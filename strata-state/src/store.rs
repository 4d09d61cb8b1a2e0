//! StateStore - Durable record of realized resources
//!
//! Wraps a backend and the loaded `StateFile`. Every change is written
//! through immediately with a new serial, so an interrupted run leaves state
//! that matches what was actually realized.

use std::sync::Arc;

use strata_core::provider::BoxFuture;
use strata_core::resource::ResourceId;
use strata_core::snapshot::{StateRecord, StateSnapshot, StateWriteError, StateWriter};

use crate::backend::{BackendResult, StateBackend};
use crate::state::{ResourceState, StateFile};

pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    file: StateFile,
}

impl StateStore {
    /// Load the current state, starting a fresh lineage if none exists
    pub async fn load(backend: Arc<dyn StateBackend>) -> BackendResult<Self> {
        let file = match backend.read_state().await? {
            Some(file) => file,
            None => {
                log::debug!("no existing state; starting a new lineage");
                StateFile::new()
            }
        };
        Ok(Self { backend, file })
    }

    pub fn file(&self) -> &StateFile {
        &self.file
    }

    pub fn snapshot(&self) -> BackendResult<StateSnapshot> {
        self.file.to_snapshot()
    }

    /// Record a resource that was created, updated or replaced
    pub async fn record_success(&mut self, record: StateRecord) -> BackendResult<()> {
        let resource = ResourceState::from_record(&record);
        self.commit(|file| file.upsert_resource(resource)).await
    }

    /// Forget a resource that was deleted
    pub async fn record_removal(&mut self, id: &ResourceId) -> BackendResult<()> {
        self.commit(|file| {
            file.remove_resource(id);
        })
        .await
    }

    /// Apply `change` to a copy, write it, and keep it only if the write succeeded
    async fn commit<F>(&mut self, change: F) -> BackendResult<()>
    where
        F: FnOnce(&mut StateFile),
    {
        let mut next = self.file.clone();
        change(&mut next);
        next.increment_serial();
        self.backend.write_state(&next).await?;
        self.file = next;
        Ok(())
    }
}

impl StateWriter for StateStore {
    fn record_success(&mut self, record: StateRecord) -> BoxFuture<'_, Result<(), StateWriteError>> {
        Box::pin(async move {
            StateStore::record_success(self, record)
                .await
                .map_err(|e| StateWriteError(e.to_string()))
        })
    }

    fn record_removal(&mut self, id: &ResourceId) -> BoxFuture<'_, Result<(), StateWriteError>> {
        let id = id.clone();
        Box::pin(async move {
            StateStore::record_removal(self, &id)
                .await
                .map_err(|e| StateWriteError(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use strata_core::resource::Value;

    #[tokio::test]
    async fn each_change_is_written_with_a_new_serial() {
        let backend = MemoryBackend::new();
        let mut store = StateStore::load(Arc::new(backend.clone())).await.unwrap();
        assert!(store.snapshot().unwrap().is_empty());

        let vpc = ResourceId::new("vpc", "main");
        store
            .record_success(
                StateRecord::new(vpc.clone(), "vpc-1")
                    .with_attribute("cidr_block", Value::String("10.0.0.0/16".to_string())),
            )
            .await
            .unwrap();
        store
            .record_success(StateRecord::new(ResourceId::new("subnet", "a"), "subnet-1").with_dependency(vpc.clone()))
            .await
            .unwrap();
        store.record_removal(&vpc).await.unwrap();

        let persisted = backend.read_state().await.unwrap().unwrap();
        assert_eq!(persisted.serial, 3);
        assert_eq!(backend.writes(), 3);
        assert_eq!(persisted.resources.len(), 1);
        assert_eq!(persisted.resources[0].name, "a");

        let reloaded = StateStore::load(Arc::new(backend)).await.unwrap();
        assert_eq!(reloaded.file().lineage, store.file().lineage);
    }

    #[tokio::test]
    async fn failed_write_leaves_store_unchanged() {
        let backend = MemoryBackend::new();
        let mut store = StateStore::load(Arc::new(backend.clone())).await.unwrap();
        backend.fail_writes_after(0);

        let result = store
            .record_success(StateRecord::new(ResourceId::new("vpc", "main"), "vpc-1"))
            .await;
        assert!(result.is_err());
        assert_eq!(store.file().serial, 0);
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn writer_interface_reports_errors_as_strings() {
        let backend = MemoryBackend::new();
        let mut store = StateStore::load(Arc::new(backend.clone())).await.unwrap();
        backend.fail_writes_after(0);

        let writer: &mut dyn StateWriter = &mut store;
        let err = writer
            .record_removal(&ResourceId::new("vpc", "main"))
            .await
            .unwrap_err();
        assert!(err.0.contains("simulated write failure"));
    }
}
