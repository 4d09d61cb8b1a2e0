//! Local file backend for state storage
//!
//! The bucket is a directory; the state for `key` lives at
//! `<bucket>/<key>.state.json` and its lock at
//! `<bucket>/<lock_table>/<key>.lock`. Lock files are created exclusively, so
//! two processes racing for the same key cannot both win.

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::lock::LockInfo;
use crate::state::StateFile;

/// Local file backend for development and single-machine use
pub struct LocalBackend {
    bucket: PathBuf,
    key: String,
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl LocalBackend {
    pub const DEFAULT_BUCKET: &'static str = ".strata";
    pub const DEFAULT_KEY: &'static str = "default";
    pub const DEFAULT_LOCK_TABLE: &'static str = "locks";

    pub fn new(bucket: impl Into<PathBuf>, key: &str, lock_table: &str) -> Self {
        let bucket = bucket.into();
        let state_path = bucket.join(format!("{}.state.json", key));
        let lock_path = bucket.join(lock_table).join(format!("{}.lock", key));
        Self {
            bucket,
            key: key.to_string(),
            state_path,
            lock_path,
        }
    }

    /// Create a LocalBackend from configuration (`bucket`, `key`, `lock_table`)
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config.string_or("bucket", Self::DEFAULT_BUCKET)?;
        let key = config.string_or("key", Self::DEFAULT_KEY)?;
        let lock_table = config.string_or("lock_table", Self::DEFAULT_LOCK_TABLE)?;

        if key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(BackendError::configuration(format!("invalid state key '{}'", key)));
        }

        Ok(Self::new(bucket, key, lock_table))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        let content = match std::fs::read_to_string(&self.lock_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io(format!("Failed to read lock file: {}", e))),
        };
        let lock = serde_json::from_str(&content)
            .map_err(|e| BackendError::InvalidState(format!("Failed to parse lock file: {}", e)))?;
        Ok(Some(lock))
    }

    /// Write the lock file only if none exists
    fn create_lock_file(&self, lock: &LockInfo) -> BackendResult<bool> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Io(format!("Failed to create lock directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(lock)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(BackendError::Io(format!("Failed to create lock file: {}", e))),
        };
        file.write_all(content.as_bytes())
            .map_err(|e| BackendError::Io(format!("Failed to write lock file: {}", e)))?;
        Ok(true)
    }

    fn remove_lock_file(&self) -> BackendResult<()> {
        std::fs::remove_file(&self.lock_path)
            .map_err(|e| BackendError::Io(format!("Failed to remove lock file: {}", e)))
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        let content = match std::fs::read_to_string(&self.state_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io(format!("Failed to read state file: {}", e))),
        };

        let state: StateFile = serde_json::from_str(&content).map_err(|e| {
            BackendError::InvalidState(format!("Failed to parse state file: {}", e))
        })?;

        Ok(Some(state))
    }

    async fn write_state(&self, state: &StateFile) -> BackendResult<()> {
        if !self.bucket.is_dir() {
            return Err(BackendError::BucketNotFound(self.bucket.display().to_string()));
        }

        if let Some(existing) = self.read_state().await?
            && existing.lineage != state.lineage
        {
            return Err(BackendError::LineageMismatch {
                expected: existing.lineage,
                actual: state.lineage.clone(),
            });
        }

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            BackendError::Serialization(format!("Failed to serialize state: {}", e))
        })?;

        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Io(format!("Failed to create state directory: {}", e)))?;
        }

        let tmp_path = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;
        std::fs::rename(&tmp_path, &self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to replace state file: {}", e)))?;

        log::debug!("wrote state serial {} to {}", state.serial, self.state_path.display());
        Ok(())
    }

    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        let lock = LockInfo::new(&self.key, operation);

        if self.create_lock_file(&lock)? {
            return Ok(lock);
        }

        match self.read_lock()? {
            Some(existing) if !existing.is_expired() => Err(BackendError::locked(&existing)),
            existing => {
                if let Some(existing) = existing {
                    log::warn!("taking over expired state lock {}", existing);
                }
                self.remove_lock_file()?;
                if self.create_lock_file(&lock)? {
                    Ok(lock)
                } else {
                    match self.read_lock()? {
                        Some(winner) => Err(BackendError::locked(&winner)),
                        None => Err(BackendError::Io("lock file vanished during takeover".to_string())),
                    }
                }
            }
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let existing = self
            .read_lock()?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;

        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.remove_lock_file()
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let existing = self
            .read_lock()?
            .ok_or_else(|| BackendError::LockNotFound(lock_id.to_string()))?;

        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        self.remove_lock_file()
    }

    async fn init(&self) -> BackendResult<()> {
        if !self.bucket_exists().await? {
            self.create_bucket().await?;
        }
        if self.read_state().await?.is_none() {
            self.write_state(&StateFile::new()).await?;
            log::info!("initialized empty state at {}", self.state_path.display());
        }
        Ok(())
    }

    async fn bucket_exists(&self) -> BackendResult<bool> {
        Ok(self.bucket.is_dir())
    }

    async fn create_bucket(&self) -> BackendResult<()> {
        std::fs::create_dir_all(&self.bucket)
            .map_err(|e| BackendError::Io(format!("Failed to create bucket directory: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend(dir: &Path) -> LocalBackend {
        LocalBackend::new(dir, "prod/eks", "locks")
    }

    #[tokio::test]
    async fn test_local_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());

        assert!(backend.read_state().await.unwrap().is_none());

        let mut state_file = StateFile::new();
        state_file.increment_serial();
        backend.write_state(&state_file).await.unwrap();

        let read_state = backend.read_state().await.unwrap().unwrap();
        assert_eq!(read_state.serial, 1);
        assert!(dir.path().join("prod/eks.state.json").exists());
        assert!(!dir.path().join("prod/eks.state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_rejects_other_lineage() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        backend.write_state(&StateFile::new()).await.unwrap();

        let result = backend.write_state(&StateFile::new()).await;
        assert!(matches!(result, Err(BackendError::LineageMismatch { .. })));
    }

    #[tokio::test]
    async fn test_write_requires_bucket() {
        let dir = tempdir().unwrap();
        let backend = backend(&dir.path().join("missing"));
        let result = backend.write_state(&StateFile::new()).await;
        assert!(matches!(result, Err(BackendError::BucketNotFound(_))));
    }

    #[tokio::test]
    async fn test_local_backend_locking() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert_eq!(lock.operation, "apply");
        assert_eq!(lock.key, "prod/eks");
        assert!(dir.path().join("locks/prod/eks.lock").exists());

        let result = backend.acquire_lock("plan").await;
        assert!(matches!(result, Err(BackendError::Locked { .. })));

        backend.release_lock(&lock).await.unwrap();

        let lock2 = backend.acquire_lock("destroy").await.unwrap();
        assert_eq!(lock2.operation, "destroy");
        backend.release_lock(&lock2).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_checks_lock_id() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());

        let lock = backend.acquire_lock("apply").await.unwrap();
        let stranger = LockInfo::new("prod/eks", "apply");
        let result = backend.release_lock(&stranger).await;
        assert!(matches!(result, Err(BackendError::LockMismatch { .. })));
        backend.release_lock(&lock).await.unwrap();

        let result = backend.release_lock(&lock).await;
        assert!(matches!(result, Err(BackendError::LockNotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());

        let stale = LockInfo::with_timeout("prod/eks", "apply", -60);
        assert!(backend.create_lock_file(&stale).unwrap());

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert_ne!(lock.id, stale.id);
        backend.release_lock(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert!(backend.force_unlock("not-the-id").await.is_err());
        backend.force_unlock(&lock.id).await.unwrap();
        assert!(!backend.lock_path().exists());
    }

    #[tokio::test]
    async fn test_init_creates_bucket_and_empty_state() {
        let dir = tempdir().unwrap();
        let bucket = dir.path().join("state");
        let backend = LocalBackend::new(&bucket, "default", "locks");

        assert!(!backend.bucket_exists().await.unwrap());
        backend.init().await.unwrap();
        assert!(backend.bucket_exists().await.unwrap());

        let state = backend.read_state().await.unwrap().unwrap();
        assert!(state.resources.is_empty());

        // Idempotent
        backend.init().await.unwrap();
        assert_eq!(backend.read_state().await.unwrap().unwrap().lineage, state.lineage);
    }

    #[test]
    fn test_local_backend_from_config() {
        let config = BackendConfig::new("local");
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.state_path(), Path::new(".strata/default.state.json"));
        assert_eq!(backend.lock_path(), Path::new(".strata/locks/default.lock"));

        let config = BackendConfig::new("local")
            .with_attribute("bucket", "/var/strata")
            .with_attribute("key", "prod/eks")
            .with_attribute("lock_table", "strata-locks");
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.state_path(), Path::new("/var/strata/prod/eks.state.json"));
        assert_eq!(
            backend.lock_path(),
            Path::new("/var/strata/strata-locks/prod/eks.lock")
        );

        let config = BackendConfig::new("local").with_attribute("key", "../escape");
        assert!(LocalBackend::from_config(&config).is_err());
    }
}
