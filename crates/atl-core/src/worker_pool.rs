//! Bounded worker pool for collaborator calls
//!
//! Provides:
//! - A global cap on simultaneous stage executor / publish calls (FIFO)
//! - A per-call timeout
//! - Pool statistics and monitoring

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Worker pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Pool was shut down
    #[error("worker pool closed")]
    Closed,

    /// Call exceeded its timeout
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Calls that ran to completion
    pub total_completed: usize,
    /// Calls cut off by their timeout
    pub total_timed_out: usize,
    /// Calls currently holding a slot
    pub active_count: usize,
    /// Highest simultaneous `active_count` seen
    pub peak_active: usize,
}

/// Semaphore-bounded executor of futures
#[derive(Debug)]
pub struct WorkerPool {
    permits: Semaphore,
    capacity: usize,
    active: AtomicUsize,
    stats: Mutex<PoolStats>,
}

impl WorkerPool {
    /// Create pool with `capacity` slots
    #[inline]
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Semaphore::new(capacity),
            capacity,
            active: AtomicUsize::new(0),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Run `call` in a slot, cutting it off after `timeout`
    ///
    /// # Errors
    /// - `PoolError::Closed` after [`Self::shutdown`]
    /// - `PoolError::TimedOut` when `call` does not finish in time
    pub async fn execute<F>(&self, timeout: Duration, call: F) -> Result<F::Output, PoolError>
    where
        F: Future + Send,
    {
        let _permit = self.permits.acquire().await.map_err(|_| PoolError::Closed)?;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = self.stats.lock();
            stats.active_count = active;
            stats.peak_active = stats.peak_active.max(active);
        }

        let outcome = tokio::time::timeout(timeout, call).await;

        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        let mut stats = self.stats.lock();
        stats.active_count = active;
        match outcome {
            Ok(output) => {
                stats.total_completed += 1;
                Ok(output)
            }
            Err(_) => {
                stats.total_timed_out += 1;
                Err(PoolError::TimedOut(timeout))
            }
        }
    }

    /// Refuse new calls; in-flight calls finish normally
    pub fn shutdown(&self) {
        self.permits.close();
    }

    /// Get pool statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    /// Maximum simultaneous calls
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
