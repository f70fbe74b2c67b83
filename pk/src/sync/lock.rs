//! Mutual-exclusion lock built on a one-permit semaphore

use std::future::Future;

use tracing::trace;

use super::semaphore::{Permit, Semaphore};

/// An async, non-reentrant lock that guards no data
///
/// Acquiring twice from the same task waits like any other caller, so a task
/// that already holds the guard and acquires again deadlocks itself.
#[derive(Clone, Debug)]
pub struct Lock {
    semaphore: Semaphore,
}

impl Lock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        let semaphore = match Semaphore::new(1) {
            Ok(semaphore) => semaphore,
            Err(_) => unreachable!("a capacity of one is always valid"),
        };
        Self { semaphore }
    }

    /// Wait until the lock is free and take it
    pub async fn acquire(&self) -> LockGuard {
        let permit = self.semaphore.acquire().await;
        trace!("Lock::acquire: locked");
        LockGuard { permit }
    }

    /// Take the lock only if it is free and nobody is waiting for it
    pub fn try_acquire(&self) -> Option<LockGuard> {
        self.semaphore.try_acquire().map(|permit| LockGuard { permit })
    }

    /// Whether someone currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.semaphore.acquired() > 0
    }

    /// Run `task` while holding the lock
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        self.semaphore.run(task).await
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding the lock; unlocks on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    permit: Permit,
}

impl LockGuard {
    /// Unlock now
    pub fn release(self) {
        trace!("LockGuard::release: unlocked");
        self.permit.release();
    }
}
