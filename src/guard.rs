//! In-progress guards and operation deadlines
//!
//! A [`BusyGuard`] rejects overlapping runs of one operation instead of
//! queueing them. [`run_blocking`] moves filesystem work onto the blocking
//! pool under a deadline; on timeout the caller stops waiting and the
//! worker sees its cancellation flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{VaultError, VaultResult};

/// Held while an operation runs; releases its flag on drop
#[derive(Debug)]
pub struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    pub fn acquire(flag: &Arc<AtomicBool>, operation: &str) -> VaultResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| VaultError::busy(operation))?;
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Cooperative cancellation flag shared with a worker
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Await `fut` for at most `limit`; elapsing maps to `VaultError::Timeout`
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> VaultResult<T>
where
    F: Future<Output = VaultResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(VaultError::timeout(operation, limit)),
    }
}

/// Run blocking work on the blocking pool under a deadline.
///
/// When the deadline passes, `cancel` is set and `Timeout` is returned
/// immediately. The worker keeps whatever it moved into the closure (for
/// example a [`BusyGuard`]) until it actually finishes.
pub async fn run_blocking<T, F>(
    operation: &str,
    limit: Duration,
    cancel: Cancellation,
    work: F,
) -> VaultResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> VaultResult<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(limit, handle).await {
        Ok(joined) => joined?,
        Err(_) => {
            cancel.cancel();
            tracing::warn!(operation, after = ?limit, "operation timed out, worker cancelled");
            Err(VaultError::timeout(operation, limit))
        }
    }
}
