//! Drive loop plumbing shared by the policies
//!
//! One operation is one future. Its workers are polled cooperatively inside
//! that future and share a [`DriveState`]: the source behind an async mutex
//! (pulls are serialized and numbered), a halt flag, and the visited results.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::combinator::Outcome;
use crate::sequence::Sequence;

/// Cooperative stop signal for the workers of one operation
pub(crate) struct Halt {
    flag: AtomicBool,
    notify: Notify,
}

impl Halt {
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn set(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the halt has been raised
    pub(crate) async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// Per-operation state shared by every worker
pub(crate) struct DriveState<A, B, E> {
    source: tokio::sync::Mutex<Sequence<A>>,
    halt: Halt,
    visited: Mutex<Vec<(usize, B)>>,
    failure: Mutex<Option<E>>,
}

impl<A: Send + 'static, B, E> DriveState<A, B, E> {
    pub(crate) fn new(input: Sequence<A>) -> Self {
        Self {
            source: tokio::sync::Mutex::new(input),
            halt: Halt::new(),
            visited: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn halt(&self) -> &Halt {
        &self.halt
    }

    /// Pull the next item unless the operation has been halted
    ///
    /// A halt raised while the pull is pending wins: the pull is abandoned,
    /// and an item that arrives together with the halt is dropped undispatched.
    pub(crate) async fn pull(&self) -> Option<(usize, A)> {
        let pulled = tokio::select! {
            biased;
            _ = self.halt.wait() => None,
            pulled = async {
                let mut source = self.source.lock().await;
                if self.halt.is_set() {
                    return None;
                }
                source.next_indexed().await
            } => pulled,
        };
        match pulled {
            Some((index, _)) if self.halt.is_set() => {
                trace!(index, "DriveState::pull: halted, dropping item");
                None
            }
            pulled => pulled,
        }
    }

    /// Record one visit; returns false when the operation must stop
    pub(crate) async fn record(&self, index: usize, outcome: Result<Outcome<B>, E>) -> bool {
        match outcome {
            Ok(Outcome::Continue(value)) => {
                self.visited
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, value));
                !self.halt.is_set()
            }
            Ok(Outcome::Stop) => {
                debug!(index, "DriveState::record: stop requested");
                self.stop().await;
                false
            }
            Err(e) => {
                debug!(index, "DriveState::record: task failed");
                {
                    let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
                    if failure.is_none() {
                        *failure = Some(e);
                    }
                }
                self.stop().await;
                false
            }
        }
    }

    async fn stop(&self) {
        self.halt.set();
        self.source.lock().await.close();
    }

    /// First error if any task failed, otherwise the visited results
    pub(crate) fn finish(self) -> Result<Vec<(usize, B)>, E> {
        if let Some(e) = self.failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }
        Ok(self.visited.into_inner().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Admission used by the worker-pool policies
pub(crate) trait Admission: Sync {
    type Pass: Send;

    /// Wait until one more task may start
    fn admit(&self) -> impl Future<Output = Self::Pass> + Send;

    /// Give back a pass after its task completed, holding it as long as the policy requires
    fn settle(&self, pass: Self::Pass) -> impl Future<Output = ()> + Send;
}

/// Run one ad-hoc job through `admission`
pub(crate) async fn run_job<G, F, T>(admission: &G, job: F) -> T
where
    G: Admission,
    F: Future<Output = T>,
{
    let pass = admission.admit().await;
    let out = job.await;
    admission.settle(pass).await;
    out
}

/// Drive `input` with `workers` long-lived workers
///
/// Each worker pulls an item, then waits for a pass, visits, and settles the
/// pass whether or not the operation goes on.
pub(crate) async fn pool<G, A, B, E, V, Fut>(
    admission: &G,
    workers: usize,
    input: Sequence<A>,
    visit: V,
) -> Result<Vec<(usize, B)>, E>
where
    G: Admission,
    A: Send + 'static,
    B: Send,
    E: Send,
    V: Fn(usize, A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome<B>, E>> + Send,
{
    debug!(workers, "drive::pool: starting");
    let state = DriveState::new(input);
    join_all((0..workers).map(|worker| pool_worker(worker, admission, &state, &visit))).await;
    state.finish()
}

async fn pool_worker<G, A, B, E, V, Fut>(worker: usize, admission: &G, state: &DriveState<A, B, E>, visit: &V)
where
    G: Admission,
    A: Send + 'static,
    V: Fn(usize, A) -> Fut,
    Fut: Future<Output = Result<Outcome<B>, E>>,
{
    loop {
        // No pass is held while waiting on the source
        let Some((index, item)) = state.pull().await else {
            trace!(worker, "pool_worker: source exhausted");
            break;
        };
        let pass = tokio::select! {
            biased;
            _ = state.halt().wait() => {
                trace!(worker, index, "pool_worker: halted before admission");
                break;
            }
            pass = admission.admit() => pass,
        };
        if state.halt().is_set() {
            drop(pass);
            break;
        }
        trace!(worker, index, "pool_worker: dispatching");
        let outcome = visit(index, item).await;
        let more = state.record(index, outcome).await;
        admission.settle(pass).await;
        if !more {
            break;
        }
    }
}
