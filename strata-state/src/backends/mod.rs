//! Backend implementations for state storage

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration.
pub fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    log::debug!("creating '{}' state backend", config.backend_type);
    match config.backend_type.as_str() {
        "local" => Ok(Box::new(LocalBackend::from_config(config)?)),
        "memory" => Ok(Box::new(MemoryBackend::from_config(config)?)),
        other => Err(BackendError::unsupported_backend(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_backend() {
        let result = create_backend(&BackendConfig::new("s3"));

        match result {
            Err(BackendError::UnsupportedBackend(name)) => assert_eq!(name, "s3"),
            _ => panic!("Expected UnsupportedBackend error"),
        }
    }

    #[tokio::test]
    async fn test_memory_backend_from_config() {
        let backend = create_backend(&BackendConfig::new("memory")).unwrap();
        assert!(backend.read_state().await.unwrap().is_none());
        backend.init().await.unwrap();
        assert!(backend.read_state().await.unwrap().is_some());
    }

    #[test]
    fn test_local_backend_rejects_bad_attributes() {
        let mut config = BackendConfig::new("local");
        config
            .attributes
            .insert("bucket".to_string(), strata_core::resource::Value::Bool(true));
        assert!(matches!(
            create_backend(&config),
            Err(BackendError::Configuration(_))
        ));
    }
}
