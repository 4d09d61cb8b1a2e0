//! Scoped state lock
//!
//! `with_state_lock` holds the backend lock for the duration of a closure and
//! releases it on every exit path: normal return, error, or panic.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::{BackendError, BackendResult, StateBackend};
use crate::lock::LockInfo;

/// How to behave when the lock is already held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// None fails immediately
    pub wait: Option<Duration>,
    pub poll_interval: Duration,
}

impl LockOptions {
    pub fn fail_fast() -> Self {
        Self {
            wait: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn wait_up_to(wait: Duration) -> Self {
        Self {
            wait: Some(wait),
            ..Self::fail_fast()
        }
    }

    /// 0 means fail fast
    pub fn from_timeout_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::fail_fast()
        } else {
            Self::wait_up_to(Duration::from_secs(secs))
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::fail_fast()
    }
}

/// Acquire the lock, polling until `options.wait` elapses if it is held
pub async fn acquire_lock(
    backend: &dyn StateBackend,
    operation: &str,
    options: &LockOptions,
) -> BackendResult<LockInfo> {
    let started = Instant::now();
    loop {
        match backend.acquire_lock(operation).await {
            Err(BackendError::Locked {
                lock_id,
                who,
                operation: held_for,
            }) => {
                let Some(wait) = options.wait else {
                    return Err(BackendError::Locked {
                        lock_id,
                        who,
                        operation: held_for,
                    });
                };
                let remaining = wait.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(BackendError::LockTimeout {
                        lock_id,
                        who,
                        waited_secs: wait.as_secs(),
                    });
                }
                log::info!("state locked by {} for {}; waiting", who, held_for);
                tokio::time::sleep(options.poll_interval.min(remaining)).await;
            }
            result => return result,
        }
    }
}

/// Run `f` while holding the state lock
///
/// `f` runs in its own task so that a panic inside it is caught, the lock
/// released, and the panic then resumed in the caller. A failure to release
/// is logged and does not mask the session's own result.
pub async fn with_state_lock<F, Fut, T>(
    backend: &dyn StateBackend,
    operation: &str,
    options: &LockOptions,
    f: F,
) -> BackendResult<T>
where
    F: FnOnce(LockInfo) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let lock = acquire_lock(backend, operation, options).await?;
    log::debug!("acquired state lock {}", lock);

    let outcome = tokio::spawn(f(lock.clone())).await;

    match backend.release_lock(&lock).await {
        Ok(()) => log::debug!("released state lock {}", lock.id),
        Err(e) => log::error!("failed to release state lock {}: {}", lock.id, e),
    }

    match outcome {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(BackendError::Io(format!("locked session did not complete: {}", e))),
    }
}
