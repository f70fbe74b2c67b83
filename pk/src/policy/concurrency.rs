//! Concurrency policy: a steady pool of workers
//!
//! `max_concurrency` workers pull and run items back to back, each holding a
//! semaphore permit while its task is in flight. There is no cohort boundary:
//! a worker takes its next item the moment it is done with the last one.

use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::drive::{self, Admission};
use super::{Policy, PolicyOptions};
use crate::combinator::Outcome;
use crate::error::{ConfigError, check_bound, check_interval};
use crate::sequence::Sequence;
use crate::sync::{Permit, Semaphore};

/// Concurrency configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyOptions {
    /// Tasks allowed in flight at once
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// How long a finished task keeps its slot, in milliseconds
    #[serde(rename = "concurrency-interval-ms")]
    pub concurrency_interval_ms: u64,
}

impl ConcurrencyOptions {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            concurrency_interval_ms: 0,
        }
    }

    pub fn with_interval_ms(mut self, concurrency_interval_ms: u64) -> Self {
        self.concurrency_interval_ms = concurrency_interval_ms;
        self
    }

    /// Get the per-task delay as a Duration
    pub fn concurrency_interval(&self) -> Duration {
        Duration::from_millis(self.concurrency_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bound("max_concurrency", self.max_concurrency)?;
        check_interval("concurrency_interval_ms", self.concurrency_interval_ms)?;
        Ok(())
    }
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            concurrency_interval_ms: 0,
        }
    }
}

impl PolicyOptions for ConcurrencyOptions {
    type Policy = Concurrency;

    fn build(self) -> Result<Concurrency, ConfigError> {
        Concurrency::new(self)
    }
}

/// Keeps up to `max_concurrency` tasks running at all times
pub struct Concurrency {
    options: RwLock<ConcurrencyOptions>,
    semaphore: Semaphore,
}

impl Concurrency {
    /// Create a concurrency policy
    pub fn new(options: ConcurrencyOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        debug!(?options, "Concurrency::new: called");
        Ok(Self {
            semaphore: Semaphore::new(options.max_concurrency)?,
            options: RwLock::new(options),
        })
    }

    /// Current options
    pub fn options(&self) -> ConcurrencyOptions {
        self.options.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the options; running tasks are not affected
    pub fn set_options(&self, options: ConcurrencyOptions) -> Result<(), ConfigError> {
        options.validate()?;
        debug!(?options, "Concurrency::set_options: called");
        self.semaphore.set_capacity(options.max_concurrency)?;
        *self.options.write().unwrap_or_else(PoisonError::into_inner) = options;
        Ok(())
    }

    /// Tasks currently holding a slot, from iteration and `run` alike
    pub fn in_flight(&self) -> usize {
        self.semaphore.acquired()
    }
}

impl std::fmt::Debug for Concurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Concurrency")
            .field("options", &self.options())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Admission for Concurrency {
    type Pass = Permit;

    fn admit(&self) -> impl Future<Output = Permit> + Send {
        self.semaphore.acquire()
    }

    fn settle(&self, pass: Permit) -> impl Future<Output = ()> + Send {
        let delay = self.options().concurrency_interval();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            drop(pass);
        }
    }
}

#[async_trait]
impl Policy for Concurrency {
    async fn drive<A, B, E, V, Fut>(&self, input: Sequence<A>, visit: V) -> Result<Vec<(usize, B)>, E>
    where
        A: Send + 'static,
        B: Send,
        E: Send,
        V: Fn(usize, A) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Outcome<B>, E>> + Send,
    {
        let workers = self.options().max_concurrency;
        drive::pool(self, workers, input, visit).await
    }

    async fn run<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        drive::run_job(self, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(matches!(
            Concurrency::new(ConcurrencyOptions::new(0)),
            Err(ConfigError::InvalidBound {
                field: "max_concurrency",
                ..
            })
        ));
    }

    #[test]
    fn test_set_options() {
        let pool = Concurrency::new(ConcurrencyOptions::new(2)).unwrap();
        assert!(pool.set_options(ConcurrencyOptions::new(0)).is_err());
        pool.set_options(ConcurrencyOptions::new(6).with_interval_ms(5)).unwrap();
        assert_eq!(pool.options().max_concurrency, 6);
        assert_eq!(pool.options().concurrency_interval(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let pool = Concurrency::new(ConcurrencyOptions::new(3)).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = pool
            .map(0..20u64, |n| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1 + n % 4)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(out, (0..20).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cohort_boundary() {
        // A slow item must not hold up the other worker
        let pool = Concurrency::new(ConcurrencyOptions::new(2)).unwrap();
        let start = Instant::now();
        let started = pool
            .map(vec![100u64, 10, 10, 10], |ms| async move {
                let at = start.elapsed();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, Infallible>(at)
            })
            .await
            .unwrap();

        assert_eq!(started[1], Duration::ZERO);
        assert_eq!(started[2], Duration::from_millis(10));
        assert_eq!(started[3], Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_holds_slot() {
        let pool = Concurrency::new(ConcurrencyOptions::new(1).with_interval_ms(50)).unwrap();
        let start = Instant::now();
        let started = pool
            .map(vec![1, 2, 3], |_: u32| async move { Ok::<_, Infallible>(start.elapsed()) })
            .await
            .unwrap();

        assert_eq!(started, vec![
            Duration::ZERO,
            Duration::from_millis(50),
            Duration::from_millis(100)
        ]);
    }

    #[tokio::test]
    async fn test_run_shares_slots_with_iteration() {
        let pool = Arc::new(Concurrency::new(ConcurrencyOptions::new(2)).unwrap());
        let gate = Arc::new(tokio::sync::Notify::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        // A long ad-hoc job occupies one of the two slots
        let long_job = tokio::spawn({
            let pool = pool.clone();
            let gate = gate.clone();
            async move { pool.run(async move { gate.notified().await }).await }
        });
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        pool.for_each(0..6, |_: i32| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Infallible>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        gate.notify_one();
        long_job.await.unwrap();
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_stops_pulling() {
        let pool = Concurrency::new(ConcurrencyOptions::new(2)).unwrap();
        let pulled = Arc::new(AtomicUsize::new(0));
        let source = {
            let pulled = pulled.clone();
            (0..100u32).inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
        };

        let result = pool
            .map(source, |n| async move {
                tokio::task::yield_now().await;
                if n == 3 { Err("three") } else { Ok(n) }
            })
            .await;

        assert_eq!(result, Err("three"));
        assert!(pulled.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_source_holds_no_slots() {
        let pool = Concurrency::new(ConcurrencyOptions::new(2)).unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
        let source = Sequence::from_stream(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        }));
        let seen = Arc::new(AtomicUsize::new(0));

        let iteration = pool.for_each(source, |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(())
            }
        });
        // The producer only feeds the pool after an ad-hoc job went through
        let producer = async {
            tokio::task::yield_now().await;
            assert_eq!(pool.in_flight(), 0);
            let job = tokio::time::timeout(Duration::from_millis(300), pool.run(async { 7 })).await;
            assert_eq!(job.ok(), Some(7));
            tx.send(1).unwrap();
            tx.send(2).unwrap();
            drop(tx);
        };

        let (result, ()) = tokio::join!(iteration, producer);
        assert_eq!(result, Ok(()));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_while_busy() {
        let pool = Arc::new(Concurrency::new(ConcurrencyOptions::new(1)).unwrap());
        let gate = Arc::new(tokio::sync::Notify::new());
        let long_job = tokio::spawn({
            let pool = pool.clone();
            let gate = gate.clone();
            async move { pool.run(async move { gate.notified().await }).await }
        });
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        // Growing frees a slot for the next job at once
        pool.set_options(ConcurrencyOptions::new(2)).unwrap();
        let quick = tokio::time::timeout(Duration::from_millis(50), pool.run(async { 5 })).await;
        assert_eq!(quick.ok(), Some(5));

        // Shrinking back leaves the running job alone but new work waits for it
        pool.set_options(ConcurrencyOptions::new(1)).unwrap();
        assert_eq!(pool.in_flight(), 1);
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.run(async { 6 })).await;
        assert!(blocked.is_err());

        gate.notify_one();
        long_job.await.unwrap();
        assert_eq!(pool.run(async { 7 }).await, 7);
        assert_eq!(pool.in_flight(), 0);
    }
}
