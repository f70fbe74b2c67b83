//! Counting semaphore with FIFO admission
//!
//! Permits are handed out strictly in arrival order. A waiter that is dropped
//! while queued (or after its grant but before it observed it) gives the
//! permit back, so cancellation never leaks capacity.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{ConfigError, check_bound};

struct State {
    capacity: usize,
    acquired: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl State {
    /// Hand free permits to the front of the queue
    fn grant(&mut self) {
        while self.acquired < self.capacity {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A closed receiver means the waiter gave up; skip it
            if waiter.send(()).is_ok() {
                self.acquired += 1;
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        let mut state = self.lock();
        state.acquired = state.acquired.saturating_sub(1);
        trace!(acquired = state.acquired, waiters = state.waiters.len(), "Semaphore: permit released");
        state.grant();
    }
}

/// A counting semaphore
///
/// Cloning is cheap and every clone shares the same permits.
#[derive(Clone)]
pub struct Semaphore {
    shared: Arc<Shared>,
}

impl Semaphore {
    /// Create a semaphore with `capacity` permits
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let capacity = check_bound("capacity", capacity)?;
        debug!(capacity, "Semaphore::new: called");
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    capacity,
                    acquired: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        })
    }

    /// Wait for a permit
    pub async fn acquire(&self) -> Permit {
        loop {
            let rx = {
                let mut state = self.shared.lock();
                if state.waiters.is_empty() && state.acquired < state.capacity {
                    state.acquired += 1;
                    trace!(acquired = state.acquired, "Semaphore::acquire: granted immediately");
                    return self.permit();
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                trace!(waiters = state.waiters.len(), "Semaphore::acquire: queued");
                rx
            };

            let mut pending = Pending {
                rx: Some(rx),
                shared: &self.shared,
            };
            if pending.wait().await {
                return self.permit();
            }
        }
    }

    /// Take a permit only if one is free and nobody is queued ahead
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.shared.lock();
        if state.waiters.is_empty() && state.acquired < state.capacity {
            state.acquired += 1;
            return Some(self.permit());
        }
        None
    }

    /// Run `task` while holding a permit
    ///
    /// The permit is returned when the task finishes, fails, panics or is
    /// dropped.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        task.await
    }

    /// Permits currently held
    pub fn acquired(&self) -> usize {
        self.shared.lock().acquired
    }

    /// Permits that could be granted right now
    pub fn available(&self) -> usize {
        let state = self.shared.lock();
        state.capacity.saturating_sub(state.acquired)
    }

    /// Callers queued for a permit
    pub fn waiting(&self) -> usize {
        self.shared.lock().waiters.iter().filter(|w| !w.is_closed()).count()
    }

    /// Configured number of permits
    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    /// Change the number of permits
    ///
    /// Growing wakes queued callers at once. Shrinking revokes nothing: held
    /// permits stay valid and new grants resume once enough are returned.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ConfigError> {
        let capacity = check_bound("capacity", capacity)?;
        let mut state = self.shared.lock();
        debug!(from = state.capacity, to = capacity, "Semaphore::set_capacity: called");
        state.capacity = capacity;
        state.grant();
        Ok(())
    }

    fn permit(&self) -> Permit {
        Permit {
            shared: Some(self.shared.clone()),
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Semaphore")
            .field("capacity", &state.capacity)
            .field("acquired", &state.acquired)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// A queued acquisition; gives a delivered grant back if dropped unobserved
struct Pending<'a> {
    rx: Option<oneshot::Receiver<()>>,
    shared: &'a Shared,
}

impl Pending<'_> {
    /// Returns true once the permit has been handed over
    async fn wait(&mut self) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        let granted = rx.await.is_ok();
        self.rx = None;
        granted
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                trace!("Semaphore: waiter dropped after grant, returning permit");
                self.shared.release();
            }
        }
    }
}

/// Ownership of one permit; returned on drop
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit {
    shared: Option<Arc<Shared>>,
}

impl Permit {
    /// Give the permit back now
    pub fn release(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").field("held", &self.shared.is_some()).finish()
    }
}
