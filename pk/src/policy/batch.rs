//! Batch policy: fixed-size cohorts
//!
//! Work is admitted in cohorts of at most `batch_size` slots. A cohort forms
//! from whatever is queued once the gate is ready, every member runs, and the
//! next cohort forms only after all members have given their slots back (and
//! `batch_interval_ms` has passed). Iteration and ad-hoc `run` jobs queue at
//! the same gate.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::drive::DriveState;
use super::{Policy, PolicyOptions};
use crate::combinator::Outcome;
use crate::error::{ConfigError, check_bound, check_interval};
use crate::sequence::Sequence;

/// Batch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Items per cohort
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// Pause between the end of one cohort and the start of the next, in milliseconds
    #[serde(rename = "batch-interval-ms")]
    pub batch_interval_ms: u64,
}

impl BatchOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            batch_interval_ms: 0,
        }
    }

    pub fn with_interval_ms(mut self, batch_interval_ms: u64) -> Self {
        self.batch_interval_ms = batch_interval_ms;
        self
    }

    /// Get the inter-cohort pause as a Duration
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bound("batch_size", self.batch_size)?;
        check_interval("batch_interval_ms", self.batch_interval_ms)?;
        Ok(())
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval_ms: 0,
        }
    }
}

impl PolicyOptions for BatchOptions {
    type Policy = Batch;

    fn build(self) -> Result<Batch, ConfigError> {
        Batch::new(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No cohort running and none scheduled
    Idle,
    /// A cohort will form on the next tick (or once the pause is over)
    Forming,
    /// Slots of the current cohort are out
    Running,
}

/// A queued request for `slots` places in a cohort
struct Request {
    slots: usize,
    tx: oneshot::Sender<usize>,
}

struct GateState {
    size: usize,
    interval: Duration,
    queue: VecDeque<Request>,
    in_flight: usize,
    phase: Phase,
    resume_at: Option<Instant>,
    /// Whether any member of the current cohort dispatched work
    dispatched: bool,
}

struct GateShared {
    state: Mutex<GateState>,
}

impl GateShared {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule the next cohort; the caller holds the lock
    fn schedule(self: &Arc<Self>, state: &mut GateState) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.phase = Phase::Forming;
                handle.spawn(form_cohort(self.clone()));
            }
            Err(_) => {
                warn!("CohortGate: no runtime to form the next cohort, waiting for the next caller");
                state.phase = Phase::Idle;
            }
        }
    }

    fn release(self: &Arc<Self>, slots: usize, dispatched: bool) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(slots);
        state.dispatched |= dispatched;
        trace!(slots, in_flight = state.in_flight, "CohortGate: slots returned");
        if state.in_flight > 0 || state.phase != Phase::Running {
            return;
        }

        debug!(dispatched = state.dispatched, "CohortGate: cohort complete");
        // An empty cohort does not push the next one back
        if state.dispatched && !state.interval.is_zero() {
            state.resume_at = Some(Instant::now() + state.interval);
        }
        if state.queue.iter().any(|request| !request.tx.is_closed()) {
            self.schedule(&mut state);
        } else {
            state.queue.clear();
            state.phase = Phase::Idle;
        }
    }
}

/// Let queued requests into a new cohort once the gate is ready
async fn form_cohort(shared: Arc<GateShared>) {
    let resume_at = shared.lock().resume_at;
    if let Some(at) = resume_at {
        tokio::time::sleep_until(at).await;
    }
    // Requests submitted alongside the one that scheduled us get to join
    tokio::task::yield_now().await;

    let mut state = shared.lock();
    state.dispatched = false;
    let mut free = state.size;
    while free > 0 {
        let Some(request) = state.queue.pop_front() else {
            break;
        };
        let granted = request.slots.min(free);
        if request.tx.send(granted).is_ok() {
            state.in_flight += granted;
            free -= granted;
        }
    }
    debug!(size = state.size, in_flight = state.in_flight, "CohortGate: cohort formed");
    state.phase = if state.in_flight > 0 { Phase::Running } else { Phase::Idle };
}

/// FIFO gate that admits work in cohorts
struct CohortGate {
    shared: Arc<GateShared>,
}

impl CohortGate {
    fn new(options: &BatchOptions) -> Self {
        Self {
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState {
                    size: options.batch_size,
                    interval: options.batch_interval(),
                    queue: VecDeque::new(),
                    in_flight: 0,
                    phase: Phase::Idle,
                    resume_at: None,
                    dispatched: false,
                }),
            }),
        }
    }

    fn reconfigure(&self, options: &BatchOptions) {
        let mut state = self.shared.lock();
        state.size = options.batch_size;
        state.interval = options.batch_interval();
    }

    /// Wait for up to `slots` places in a cohort; the pass says how many were granted
    async fn enter(&self, slots: usize) -> CohortPass {
        loop {
            let rx = {
                let mut state = self.shared.lock();
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Request { slots, tx });
                if state.phase == Phase::Idle {
                    self.shared.schedule(&mut state);
                }
                rx
            };

            let mut pending = PendingEntry {
                rx: Some(rx),
                shared: &self.shared,
            };
            if let Some(granted) = pending.wait().await {
                return CohortPass {
                    shared: Some(self.shared.clone()),
                    slots: granted,
                    dispatched: false,
                };
            }
        }
    }
}

/// A queued entry; returns a delivered grant if dropped before observing it
struct PendingEntry<'a> {
    rx: Option<oneshot::Receiver<usize>>,
    shared: &'a Arc<GateShared>,
}

impl PendingEntry<'_> {
    async fn wait(&mut self) -> Option<usize> {
        let rx = self.rx.as_mut()?;
        let granted = rx.await.ok();
        self.rx = None;
        granted
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(slots) = rx.try_recv() {
                self.shared.release(slots, false);
            }
        }
    }
}

/// Places held in the current cohort; given back on drop
struct CohortPass {
    shared: Option<Arc<GateShared>>,
    slots: usize,
    dispatched: bool,
}

impl CohortPass {
    /// Note that work ran under this pass, so the pause applies after the cohort
    fn mark_dispatched(&mut self) {
        self.dispatched = true;
    }
}

impl Drop for CohortPass {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.slots, self.dispatched);
        }
    }
}

/// Runs work in cohorts of a fixed size
pub struct Batch {
    options: RwLock<BatchOptions>,
    gate: CohortGate,
}

impl Batch {
    /// Create a batch policy
    pub fn new(options: BatchOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        debug!(?options, "Batch::new: called");
        Ok(Self {
            gate: CohortGate::new(&options),
            options: RwLock::new(options),
        })
    }

    /// Current options
    pub fn options(&self) -> BatchOptions {
        self.options.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the options; applies from the next cohort on
    pub fn set_options(&self, options: BatchOptions) -> Result<(), ConfigError> {
        options.validate()?;
        debug!(?options, "Batch::set_options: called");
        self.gate.reconfigure(&options);
        *self.options.write().unwrap_or_else(PoisonError::into_inner) = options;
        Ok(())
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch").field("options", &self.options()).finish()
    }
}

#[async_trait]
impl Policy for Batch {
    async fn drive<A, B, E, V, Fut>(&self, input: Sequence<A>, visit: V) -> Result<Vec<(usize, B)>, E>
    where
        A: Send + 'static,
        B: Send,
        E: Send,
        V: Fn(usize, A) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Outcome<B>, E>> + Send,
    {
        let state = DriveState::new(input);
        // The gate is only entered with an item in hand, so exhaustion never costs a pause
        let mut ahead = state.pull().await;
        let mut cohort = 0usize;
        while let Some(first) = ahead.take() {
            let mut pass = self.gate.enter(self.options().batch_size).await;
            pass.mark_dispatched();
            debug!(cohort, slots = pass.slots, "Batch::drive: cohort admitted");

            let mut in_flight = FuturesUnordered::new();
            let mut next = Some(first);
            for _ in 0..pass.slots {
                let pulled = match next.take() {
                    Some(item) => Some(item),
                    None => state.pull().await,
                };
                let Some((index, item)) = pulled else {
                    break;
                };
                trace!(cohort, index, "Batch::drive: dispatching");
                let visiting = visit(index, item);
                in_flight.push(async move { (index, visiting.await) });
            }

            while let Some((index, outcome)) = in_flight.next().await {
                state.record(index, outcome).await;
            }
            drop(pass);

            ahead = state.pull().await;
            if ahead.is_none() {
                debug!(cohort, "Batch::drive: source exhausted or halted");
            }
            cohort += 1;
        }
        state.finish()
    }

    async fn run<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        let mut pass = self.gate.enter(1).await;
        pass.mark_dispatched();
        job.await
    }
}
