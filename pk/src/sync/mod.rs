//! Admission primitives
//!
//! The policies are built on these: a counting [`Semaphore`] with FIFO
//! grants, and a [`Lock`] that is a one-permit semaphore.

mod lock;
mod semaphore;

pub use lock::{Lock, LockGuard};
pub use semaphore::{Permit, Semaphore};
