//! Provider - Trait abstracting resource operations
//!
//! A Provider implements Create/Read/Update/Delete for one or more resource
//! kinds. The core never embeds provider logic; it resolves a provider for
//! each kind through the `ProviderRegistry` and calls through this interface.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::resource::{Resource, ResourceId, State};

/// Whether an operation is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure (throttling, network); retried with backoff
    Retryable,
    /// Permanent failure (invalid parameter); fails the node immediately
    Fatal,
}

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    pub resource_id: Option<ResourceId>,
    pub class: ErrorClass,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    /// A fatal error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resource_id: None,
            class: ErrorClass::Fatal,
            cause: None,
        }
    }

    /// A transient error the executor may retry
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            ..Self::new(message)
        }
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Definition of resource kinds that a Provider can handle
pub trait ResourceType: Send + Sync {
    /// Resource kind name (e.g., "vpc")
    fn name(&self) -> &str;

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::default()
    }
}

/// What the core needs to know about a kind's attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Attributes the provider fills in on create (e.g., "arn")
    pub computed: Vec<String>,
    /// Attributes that cannot change in place; a change forces replacement
    pub immutable: Vec<String>,
}

impl ResourceSchema {
    pub fn with_computed(mut self, attribute: impl Into<String>) -> Self {
        self.computed.push(attribute.into());
        self
    }

    pub fn with_immutable(mut self, attribute: impl Into<String>) -> Self {
        self.immutable.push(attribute.into());
        self
    }

    pub fn is_computed(&self, attribute: &str) -> bool {
        self.computed.iter().any(|a| a == attribute)
    }

    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.iter().any(|a| a == attribute)
    }
}

/// Main Provider trait
///
/// All operations are async and involve side effects.
pub trait Provider: Send + Sync {
    /// Name of this Provider (e.g., "aws")
    fn name(&self) -> &'static str;

    /// List of resource kinds this Provider can handle
    fn resource_types(&self) -> Vec<Box<dyn ResourceType>>;

    /// Get the current state of a resource by its provider-assigned identifier
    ///
    /// Returns `State::not_found()` if the resource does not exist.
    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>>;

    /// Create a resource
    ///
    /// Returns State with identifier set to the provider-assigned ID
    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>>;

    /// Update a resource in place
    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>>;

    /// Delete a resource
    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>>;
}

/// Maps resource kinds to the provider that manages them
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    schemas: HashMap<String, ResourceSchema>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under every kind it declares
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        for resource_type in provider.resource_types() {
            let kind = resource_type.name().to_string();
            if let Some(previous) = self.providers.get(&kind) {
                log::warn!(
                    "kind '{}' was handled by provider '{}', now '{}'",
                    kind,
                    previous.name(),
                    provider.name()
                );
            }
            self.schemas.insert(kind.clone(), resource_type.schema());
            self.providers.insert(kind, Arc::clone(&provider));
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Provider used for kinds no registered provider declares
    pub fn with_fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .get(kind)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Like `get`, but a missing provider is a configuration error
    pub fn require(&self, kind: &str) -> Result<Arc<dyn Provider>, ConfigError> {
        self.get(kind)
            .ok_or_else(|| ConfigError::UnknownProvider(kind.to_string()))
    }

    pub fn schema(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }

    /// Kinds with an explicitly registered provider, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}
