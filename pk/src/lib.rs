//! Pacekeeper - admission policies for driving work through async tasks
//!
//! Pacekeeper pulls items from a finite or unbounded source and runs a task on
//! each one, under an explicit policy that decides how many tasks are in
//! flight and when the next one may start.
//!
//! # Core Concepts
//!
//! - **Policies**: [`Batch`] (fixed cohorts), [`Concurrency`] (steady pool),
//!   [`Throttle`] (pool capped per time window)
//! - **Operations**: `for_each`, `map`, `map_settled`, `filter`, `some`,
//!   `find`, `every`, `group` and ad-hoc `run`, uniform across policies
//! - **Ordering**: results come back in input order whatever order tasks
//!   finish in
//! - **Early termination**: `some`, `find`, `every` and the first error close
//!   the source; nothing more is pulled
//!
//! # Modules
//!
//! - [`policy`] - the policies and the [`Policy`] trait
//! - [`sync`] - FIFO semaphore and lock
//! - [`chain`] - deferred multi-stage pipelines
//! - [`sequence`] - input adaptation
//! - [`config`] - configuration types and loading
//! - [`runner`] - shell command runner used by the `pk` binary

pub mod chain;
pub mod cli;
pub mod combinator;
pub mod config;
pub mod error;
pub mod policy;
pub mod runner;
pub mod sequence;
pub mod sync;

// Re-export commonly used types
pub use chain::{Chain, Reduced};
pub use combinator::{Groups, Outcome, Settled};
pub use config::{Config, PolicyKind, RunnerConfig};
pub use error::{ConfigError, Error};
pub use policy::{
    Batch, BatchOptions, Concurrency, ConcurrencyOptions, Policy, PolicyOptions, Throttle, ThrottleOptions, oneshot,
};
pub use runner::{CommandRunner, RunReport, RunnerError};
pub use sequence::{IntoSequence, Sequence};
pub use sync::{Lock, LockGuard, Permit, Semaphore};
