//! Configuration errors
//!
//! Everything in here is fatal and reported before any provider is called.

use std::path::PathBuf;

use crate::resource::ResourceId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid expression in {resource}.{attribute}: {message}")]
    InvalidExpression {
        resource: String,
        attribute: String,
        message: String,
    },

    #[error("Duplicate resource: {0}")]
    DuplicateResource(ResourceId),

    #[error("Only one backend resource may be declared (found {0} and {1})")]
    DuplicateBackend(String, String),

    #[error("Invalid backend configuration: {0}")]
    InvalidBackend(String),

    #[error("Unresolved reference in {from}: {reference}")]
    UnresolvedReference { from: ResourceId, reference: String },

    #[error("Reference in {from} to repeated resource {reference} needs an index")]
    MissingIndex { from: ResourceId, reference: String },

    #[error("Index {index} is out of range for {target} in {from} (length {len})")]
    IndexOutOfRange {
        from: ResourceId,
        target: String,
        index: usize,
        len: usize,
    },

    #[error("count.index used in {from}.{attribute}, which has no count")]
    CountIndexOutsideCount { from: ResourceId, attribute: String },

    #[error("Dependency cycle detected involving: {}", format_members(.members))]
    Cycle { members: Vec<ResourceId> },

    #[error("No provider registered for resource kind '{0}'")]
    UnknownProvider(String),
}

fn format_members(members: &[ResourceId]) -> String {
    members
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
