//! Throttle policy: a worker pool capped per time window
//!
//! Works like [`Concurrency`](super::Concurrency) but keeps a window start on
//! the policy instance. A task that finishes inside the current window keeps
//! its permit until the window closes, so at most `max_concurrency` tasks
//! start per `interval`. The first finisher past the boundary opens the next
//! window; the spacing is approximate.

use std::future::Future;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::drive::{self, Admission};
use super::{Policy, PolicyOptions};
use crate::combinator::Outcome;
use crate::error::{ConfigError, check_bound, check_interval};
use crate::sequence::Sequence;
use crate::sync::{Permit, Semaphore};

/// Waits this short are not worth holding a permit for
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Throttle configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    /// Tasks allowed in flight, and started, per window
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Window length in milliseconds
    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,
}

impl ThrottleOptions {
    pub fn new(max_concurrency: usize, interval_ms: u64) -> Self {
        Self {
            max_concurrency,
            interval_ms,
        }
    }

    /// Get the window length as a Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bound("max_concurrency", self.max_concurrency)?;
        check_interval("interval_ms", self.interval_ms)?;
        Ok(())
    }
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            interval_ms: 1000,
        }
    }
}

impl PolicyOptions for ThrottleOptions {
    type Policy = Throttle;

    fn build(self) -> Result<Throttle, ConfigError> {
        Throttle::new(self)
    }
}

/// Rate-limited worker pool
pub struct Throttle {
    options: RwLock<ThrottleOptions>,
    semaphore: Semaphore,
    window_start: Mutex<Instant>,
}

impl Throttle {
    /// Create a throttle policy
    pub fn new(options: ThrottleOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        debug!(?options, "Throttle::new: called");
        Ok(Self {
            semaphore: Semaphore::new(options.max_concurrency)?,
            options: RwLock::new(options),
            window_start: Mutex::new(Instant::now()),
        })
    }

    /// Current options
    pub fn options(&self) -> ThrottleOptions {
        self.options.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the options; running tasks are not affected
    pub fn set_options(&self, options: ThrottleOptions) -> Result<(), ConfigError> {
        options.validate()?;
        debug!(?options, "Throttle::set_options: called");
        self.semaphore.set_capacity(options.max_concurrency)?;
        *self.options.write().unwrap_or_else(PoisonError::into_inner) = options;
        Ok(())
    }

    /// Tasks currently holding a permit, including those waiting out the window
    pub fn in_flight(&self) -> usize {
        self.semaphore.acquired()
    }

    /// Open a fresh window if the current one has already closed
    fn refresh_window(&self) {
        let interval = self.options().interval();
        let mut start = self.window_start.lock().unwrap_or_else(PoisonError::into_inner);
        if start.elapsed() >= interval {
            *start = Instant::now();
        }
    }

    /// Time left in the current window, resetting it when it has passed
    fn window_wait(&self) -> Duration {
        let interval = self.options().interval();
        let now = Instant::now();
        let mut start = self.window_start.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(*start);
        if elapsed >= interval {
            *start = now;
            Duration::ZERO
        } else {
            interval - elapsed
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("options", &self.options())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Admission for Throttle {
    type Pass = Permit;

    fn admit(&self) -> impl Future<Output = Permit> + Send {
        self.semaphore.acquire()
    }

    fn settle(&self, pass: Permit) -> impl Future<Output = ()> + Send {
        let wait = self.window_wait();
        async move {
            if wait > MIN_WAIT {
                trace!(?wait, "Throttle::settle: holding permit until window closes");
                tokio::time::sleep(wait).await;
            }
            drop(pass);
        }
    }
}

#[async_trait]
impl Policy for Throttle {
    async fn drive<A, B, E, V, Fut>(&self, input: Sequence<A>, visit: V) -> Result<Vec<(usize, B)>, E>
    where
        A: Send + 'static,
        B: Send,
        E: Send,
        V: Fn(usize, A) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Outcome<B>, E>> + Send,
    {
        self.refresh_window();
        let workers = self.options().max_concurrency;
        drive::pool(self, workers, input, visit).await
    }

    async fn run<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        self.refresh_window();
        drive::run_job(self, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(matches!(
            Throttle::new(ThrottleOptions::new(0, 100)),
            Err(ConfigError::InvalidBound {
                field: "max_concurrency",
                value: 0
            })
        ));
    }

    #[test]
    fn test_rejects_huge_interval() {
        assert!(matches!(
            Throttle::new(ThrottleOptions::new(1, u64::MAX)),
            Err(ConfigError::IntervalTooLarge { field: "interval_ms", .. })
        ));
    }

    #[test]
    fn test_options_from_yaml() {
        let options: ThrottleOptions = serde_yaml::from_str("max-concurrency: 3\ninterval-ms: 250\n").unwrap();
        assert_eq!(options, ThrottleOptions::new(3, 250));
        assert_eq!(options.interval(), Duration::from_millis(250));

        let defaults: ThrottleOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(defaults, ThrottleOptions::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing() {
        let throttle = Throttle::new(ThrottleOptions::new(2, 200)).unwrap();
        let start = Instant::now();

        let started = throttle
            .map(0..4u32, |_| async move { Ok::<_, Infallible>(start.elapsed()) })
            .await
            .unwrap();

        assert_eq!(started[0], Duration::ZERO);
        assert_eq!(started[1], Duration::ZERO);
        assert!(started[2] >= Duration::from_millis(200), "{:?}", started);
        assert!(started[3] >= Duration::from_millis(200), "{:?}", started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_plain_pool() {
        let throttle = Throttle::new(ThrottleOptions::new(2, 0)).unwrap();
        let start = Instant::now();
        let started = throttle
            .map(0..6u32, |_| async move { Ok::<_, Infallible>(start.elapsed()) })
            .await
            .unwrap();
        assert!(started.iter().all(|at| at.is_zero()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_concurrency() {
        let throttle = Throttle::new(ThrottleOptions::new(3, 20)).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        throttle
            .for_each(0..12u64, |n| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5 * (n % 3))).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(throttle.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_obeys_window() {
        let throttle = Throttle::new(ThrottleOptions::new(1, 100)).unwrap();
        let start = Instant::now();

        let first = throttle.run(async { start.elapsed() }).await;
        let second = throttle.run(async { start.elapsed() }).await;

        assert_eq!(first, Duration::ZERO);
        assert!(second >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_window_refreshed() {
        let throttle = Throttle::new(ThrottleOptions::new(1, 100)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // A fresh window opens at the start of the operation, so the first
        // item holds its permit for the full interval
        let start = Instant::now();
        let started = throttle
            .map(0..2u32, |_| async move { Ok::<_, Infallible>(start.elapsed()) })
            .await
            .unwrap();
        assert_eq!(started[0], Duration::ZERO);
        assert_eq!(started[1], Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_task_keeps_window() {
        let throttle = Throttle::new(ThrottleOptions::new(1, 100)).unwrap();
        let start = Instant::now();

        // The task that ends the operation still counts against its window
        let (found, job_started) = tokio::join!(
            throttle.find(vec![1u32, 2], |n: &u32| {
                let hit = *n == 1;
                async move { Ok::<_, Infallible>(hit) }
            }),
            async {
                tokio::task::yield_now().await;
                throttle.run(async { start.elapsed() }).await
            }
        );

        assert_eq!(found, Ok(Some(1)));
        assert!(job_started >= Duration::from_millis(100), "{:?}", job_started);
        assert_eq!(throttle.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_keeps_window() {
        let throttle = Throttle::new(ThrottleOptions::new(1, 100)).unwrap();
        let start = Instant::now();

        let (result, job_started) = tokio::join!(
            throttle.for_each(vec![1u32], |_| async { Err::<(), _>("failed") }),
            async {
                tokio::task::yield_now().await;
                throttle.run(async { start.elapsed() }).await
            }
        );

        assert_eq!(result, Err("failed"));
        assert!(job_started >= Duration::from_millis(100), "{:?}", job_started);
    }
}
