//! State backend trait and error types

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use strata_core::config::BackendBlock;
use strata_core::resource::Value;

use crate::lock::LockInfo;
use crate::state::StateFile;

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The state is locked by another process
    #[error("State is locked by {who} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
    },

    /// Waited for the lock and gave up
    #[error("Timed out after {waited_secs}s waiting for state lock held by {who} (lock ID: {lock_id})")]
    LockTimeout {
        lock_id: String,
        who: String,
        waited_secs: u64,
    },

    /// The lock was not found (for release/force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The bucket (state directory) does not exist; run `strata init`
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// State file is corrupted or invalid
    #[error("Invalid state file: {0}")]
    InvalidState(String),

    /// State lineage mismatch (prevents accidental state overwrites)
    #[error("State lineage mismatch: expected {expected}, got {actual}")]
    LineageMismatch { expected: String, actual: String },

    /// Filesystem or I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether another session holds the lock
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for state storage backends
///
/// This trait defines the interface for storing and retrieving state files,
/// as well as managing locks for concurrent access control.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the current state from the backend
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn read_state(&self) -> BackendResult<Option<StateFile>>;

    /// Replace the stored state; readers never observe a partial write
    ///
    /// The state's serial number should be incremented before calling this
    async fn write_state(&self, state: &StateFile) -> BackendResult<()>;

    /// Acquire a lock for the given operation
    ///
    /// Fails with `Locked` if another live lock is held; an expired lock is
    /// taken over.
    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo>;

    /// Release a previously acquired lock
    ///
    /// Fails with `LockMismatch` if the held lock is not `lock`
    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Force release a lock by its ID
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()>;

    /// Initialize the backend (create the bucket and an empty state if needed)
    async fn init(&self) -> BackendResult<()>;

    /// Check if the backend storage (bucket) exists
    async fn bucket_exists(&self) -> BackendResult<bool>;

    /// Create the backend storage (bucket)
    async fn create_bucket(&self) -> BackendResult<()>;
}

/// Configuration for a state backend
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Backend type ("local" or "memory")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), Value::String(value.into()));
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get a string attribute, failing if it is present but not a string
    pub fn string_or<'a>(&'a self, key: &str, default: &'a str) -> BackendResult<&'a str> {
        match self.attributes.get(key) {
            None => Ok(default),
            Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
            Some(other) => Err(BackendError::configuration(format!(
                "'{}' must be a non-empty string, got {}",
                key, other
            ))),
        }
    }
}

impl From<&BackendBlock> for BackendConfig {
    fn from(block: &BackendBlock) -> Self {
        Self {
            backend_type: block.backend_type.clone(),
            attributes: block.attributes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_locked() {
        let lock = LockInfo::new("prod", "apply");
        let error = BackendError::locked(&lock);
        assert!(error.is_locked());

        match error {
            BackendError::Locked {
                lock_id,
                who,
                operation,
            } => {
                assert_eq!(lock_id, lock.id);
                assert_eq!(who, lock.who);
                assert_eq!(operation, "apply");
            }
            _ => panic!("Expected Locked error"),
        }
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::unsupported_backend("azure");
        assert_eq!(error.to_string(), "Unsupported backend type: azure");

        let error = BackendError::BucketNotFound(".strata".to_string());
        assert_eq!(error.to_string(), "Bucket not found: .strata");

        let error = BackendError::configuration("'key' must be a non-empty string");
        assert_eq!(
            error.to_string(),
            "Backend configuration error: 'key' must be a non-empty string"
        );
        assert!(!error.is_locked());
    }

    #[test]
    fn test_config_from_backend_block() {
        let block = BackendBlock {
            name: "state".to_string(),
            backend_type: "local".to_string(),
            attributes: HashMap::from([
                ("bucket".to_string(), Value::String("/tmp/state".to_string())),
                ("retries".to_string(), Value::Int(3)),
            ]),
        };

        let config = BackendConfig::from(&block);
        assert_eq!(config.backend_type, "local");
        assert_eq!(config.get_string("bucket"), Some("/tmp/state"));
        assert_eq!(config.string_or("key", "default").unwrap(), "default");
        assert!(config.string_or("retries", "x").is_err());
    }
}
