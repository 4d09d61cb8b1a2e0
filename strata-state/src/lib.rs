//! Strata State Management
//!
//! Durable storage for realized resources, with locking for safe concurrent
//! access.
//!
//! # Overview
//!
//! - **StateFile**: The persisted structure containing all realized resources
//! - **StateBackend**: A trait for state storage backends (local, memory)
//! - **StateStore**: Write-through store the executor records results into
//! - **with_state_lock**: Scoped lock that is released on every exit path
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_state::{create_backend, with_state_lock, BackendConfig, LockOptions, StateStore};
//!
//! let config = BackendConfig::new("local")
//!     .with_attribute("bucket", ".strata")
//!     .with_attribute("key", "prod/eks");
//! let backend: Arc<dyn StateBackend> = create_backend(&config)?.into();
//!
//! let session_backend = backend.clone();
//! with_state_lock(&*backend, "apply", &LockOptions::fail_fast(), |_lock| async move {
//!     let mut store = StateStore::load(session_backend).await?;
//!     let snapshot = store.snapshot()?;
//!     // ... plan against the snapshot, apply into the store ...
//!     Ok::<_, BackendError>(())
//! })
//! .await??;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod session;
pub mod state;
pub mod store;

pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, MemoryBackend, create_backend};
pub use lock::LockInfo;
pub use session::{LockOptions, with_state_lock};
pub use state::{ResourceState, StateFile};
pub use store::StateStore;
