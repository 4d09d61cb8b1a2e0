//! In-process backend for tests and dry runs
//!
//! Clones share the same storage, so a test can hand one clone to the code
//! under test and inspect the other.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::lock::LockInfo;
use crate::state::StateFile;

#[derive(Debug, Default)]
struct Inner {
    state: Option<StateFile>,
    lock: Option<LockInfo>,
    /// Remaining successful writes before writes start failing
    writes_before_failure: Option<usize>,
    writes: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    key: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            key: "memory".to_string(),
            inner: Arc::default(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let key = config.string_or("key", "memory")?;
        Ok(Self {
            key: key.to_string(),
            inner: Arc::default(),
        })
    }

    /// Make every write after the next `n` fail with an I/O error
    pub fn fail_writes_after(&self, n: usize) {
        self.inner().writes_before_failure = Some(n);
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.inner().writes
    }

    pub fn current_lock(&self) -> Option<LockInfo> {
        self.inner().lock.clone()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        Ok(self.inner().state.clone())
    }

    async fn write_state(&self, state: &StateFile) -> BackendResult<()> {
        let mut inner = self.inner();
        if let Some(remaining) = inner.writes_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(BackendError::Io("simulated write failure".to_string()));
            }
            *remaining -= 1;
        }
        if let Some(existing) = &inner.state
            && existing.lineage != state.lineage
        {
            return Err(BackendError::LineageMismatch {
                expected: existing.lineage.clone(),
                actual: state.lineage.clone(),
            });
        }
        inner.state = Some(state.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        let mut inner = self.inner();
        if let Some(existing) = &inner.lock {
            if !existing.is_expired() {
                return Err(BackendError::locked(existing));
            }
            log::warn!("taking over expired state lock {}", existing);
        }
        let lock = LockInfo::new(&self.key, operation);
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        self.force_unlock(&lock.id).await
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let mut inner = self.inner();
        let Some(existing) = &inner.lock else {
            return Err(BackendError::LockNotFound(lock_id.to_string()));
        };
        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id.clone(),
            });
        }
        inner.lock = None;
        Ok(())
    }

    async fn init(&self) -> BackendResult<()> {
        let mut inner = self.inner();
        if inner.state.is_none() {
            inner.state = Some(StateFile::new());
        }
        Ok(())
    }

    async fn bucket_exists(&self) -> BackendResult<bool> {
        Ok(true)
    }

    async fn create_bucket(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_storage() {
        let backend = MemoryBackend::new();
        let observer = backend.clone();

        let mut state = StateFile::new();
        state.increment_serial();
        backend.write_state(&state).await.unwrap();

        assert_eq!(observer.read_state().await.unwrap(), Some(state));
        assert_eq!(observer.writes(), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let backend = MemoryBackend::new();
        let lock = backend.acquire_lock("apply").await.unwrap();
        assert!(backend.acquire_lock("apply").await.unwrap_err().is_locked());

        backend.release_lock(&lock).await.unwrap();
        assert!(backend.current_lock().is_none());
        assert!(matches!(
            backend.release_lock(&lock).await,
            Err(BackendError::LockNotFound(_))
        ));
    }

    #[tokio::test]
    async fn writes_fail_on_demand() {
        let backend = MemoryBackend::new();
        backend.fail_writes_after(1);
        let state = StateFile::new();
        backend.write_state(&state).await.unwrap();
        assert!(matches!(
            backend.write_state(&state).await,
            Err(BackendError::Io(_))
        ));
    }
}
