//! Admission policies
//!
//! A policy decides how many items are in flight and when the next one may
//! start. All three share the same operation surface through [`Policy`]:
//!
//! - [`Batch`] - fixed-size cohorts, the next cohort starts once the previous
//!   one has fully resolved
//! - [`Concurrency`] - a steady pool of workers, each pulling its next item as
//!   soon as it finishes the last
//! - [`Throttle`] - a pool that additionally caps dispatches per time window

mod batch;
mod concurrency;
mod drive;
mod throttle;

use std::future::Future;
use std::hash::Hash;

use async_trait::async_trait;

use crate::combinator::{self, Groups, Outcome, Settled};
use crate::error::{ConfigError, Error};
use crate::sequence::{IntoSequence, Sequence};

pub use batch::{Batch, BatchOptions};
pub use concurrency::{Concurrency, ConcurrencyOptions};
pub use throttle::{Throttle, ThrottleOptions};

/// An admission policy for driving a sequence of items through a task
///
/// Implementors supply [`drive`](Policy::drive) and [`run`](Policy::run);
/// every operation is built on top of `drive`.
///
/// Tasks receive items by value. Predicates and key functions receive a
/// reference and return a future that must not borrow it, so copy out what
/// the future needs:
///
/// ```ignore
/// let evens = pool.filter(1..=10, |n: &u32| {
///     let n = *n;
///     async move { Ok::<_, Infallible>(n % 2 == 0) }
/// }).await?;
/// ```
#[async_trait]
pub trait Policy: Send + Sync + Sized {
    /// Pull items from `input` and visit each one under this policy's admission rules
    ///
    /// Returns every `Continue` payload tagged with the draw index of its
    /// item, in completion order. The first `Stop` closes the source; the
    /// first error closes it too and is returned once in-flight visits have
    /// finished.
    async fn drive<A, B, E, V, Fut>(&self, input: Sequence<A>, visit: V) -> Result<Vec<(usize, B)>, E>
    where
        A: Send + 'static,
        B: Send,
        E: Send,
        V: Fn(usize, A) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Outcome<B>, E>> + Send;

    /// Submit one ad-hoc job that competes for the same admission as iteration work
    async fn run<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T> + Send,
        T: Send;

    /// Run `task` on every item, discarding results
    async fn for_each<I, B, E, F, Fut>(&self, input: I, task: F) -> Result<(), E>
    where
        I: IntoSequence + Send,
        B: Send,
        E: Send,
        F: Fn(I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<B, E>> + Send,
    {
        combinator::for_each(self, input, task).await
    }

    /// Transform every item; results come back in input order
    async fn map<I, B, E, F, Fut>(&self, input: I, task: F) -> Result<Vec<B>, E>
    where
        I: IntoSequence + Send,
        B: Send,
        E: Send,
        F: Fn(I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<B, E>> + Send,
    {
        combinator::map(self, input, task).await
    }

    /// Transform every item, recording each failure instead of aborting
    async fn map_settled<I, B, E, F, Fut>(&self, input: I, task: F) -> Vec<Settled<B, E>>
    where
        I: IntoSequence + Send,
        B: Send,
        E: Send,
        F: Fn(I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<B, E>> + Send,
    {
        combinator::map_settled(self, input, task).await
    }

    /// Keep the items the predicate accepts, in input order
    async fn filter<I, E, F, Fut>(&self, input: I, predicate: F) -> Result<Vec<I::Item>, E>
    where
        I: IntoSequence + Send,
        E: Send,
        F: Fn(&I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<bool, E>> + Send,
    {
        combinator::filter(self, input, predicate).await
    }

    /// Whether any item satisfies the predicate; stops pulling at the first hit
    async fn some<I, E, F, Fut>(&self, input: I, predicate: F) -> Result<bool, E>
    where
        I: IntoSequence + Send,
        E: Send,
        F: Fn(&I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<bool, E>> + Send,
    {
        combinator::some(self, input, predicate).await
    }

    /// First item satisfying the predicate; stops pulling once one is found
    async fn find<I, E, F, Fut>(&self, input: I, predicate: F) -> Result<Option<I::Item>, E>
    where
        I: IntoSequence + Send,
        E: Send,
        F: Fn(&I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<bool, E>> + Send,
    {
        combinator::find(self, input, predicate).await
    }

    /// Whether every item satisfies the predicate; stops pulling at the first miss
    async fn every<I, E, F, Fut>(&self, input: I, predicate: F) -> Result<bool, E>
    where
        I: IntoSequence + Send,
        E: Send,
        F: Fn(&I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<bool, E>> + Send,
    {
        combinator::every(self, input, predicate).await
    }

    /// Bucket items by the key `key` computes for them
    async fn group<I, K, E, F, Fut>(&self, input: I, key: F) -> Result<Groups<K, I::Item>, E>
    where
        I: IntoSequence + Send,
        K: Hash + Eq + Clone + Send,
        E: Send,
        F: Fn(&I::Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<K, E>> + Send,
    {
        combinator::group(self, input, key).await
    }
}

/// Options record that can be turned into its policy
pub trait PolicyOptions {
    type Policy: Policy;

    /// Validate and build
    fn build(self) -> Result<Self::Policy, ConfigError>;
}

/// Run one operation against a throwaway policy built from `options`
///
/// This is the configuration-per-call form of every operation:
///
/// ```ignore
/// let squares = pacekeeper::oneshot(ConcurrencyOptions::new(4), |pool| async move {
///     pool.map(1..=10, |n: u64| async move { Ok::<_, Infallible>(n * n) }).await
/// })
/// .await?;
/// ```
pub async fn oneshot<O, T, E, F, Fut>(options: O, operation: F) -> Result<T, Error<E>>
where
    O: PolicyOptions,
    F: FnOnce(O::Policy) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let policy = options.build()?;
    operation(policy).await.map_err(Error::Task)
}
