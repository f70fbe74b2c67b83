//! Operation combinators
//!
//! Every operation is expressed as a visitor handed to [`Policy::drive`]: the
//! visitor applies the caller's task to one item and answers with an
//! [`Outcome`]. How many visitors run at once is entirely the policy's
//! business; this module only decides what a visit means and how the visited
//! results are put back together.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::policy::Policy;
use crate::sequence::IntoSequence;

/// What a visitor tells the drive loop after handling one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<B> {
    /// Keep pulling; `B` is this item's contribution to the result
    Continue(B),

    /// The result is decided: close the source and dispatch nothing further
    Stop,
}

/// Per-item result of [`Policy::map_settled`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Settled<B, E> {
    Fulfilled { value: B },
    Rejected { reason: E },
}

impl<B, E> Settled<B, E> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settled::Fulfilled { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Settled::Rejected { .. })
    }

    /// Convert back into a plain `Result`
    pub fn into_result(self) -> Result<B, E> {
        match self {
            Settled::Fulfilled { value } => Ok(value),
            Settled::Rejected { reason } => Err(reason),
        }
    }
}

impl<B, E> From<Result<B, E>> for Settled<B, E> {
    fn from(result: Result<B, E>) -> Self {
        match result {
            Ok(value) => Settled::Fulfilled { value },
            Err(reason) => Settled::Rejected { reason },
        }
    }
}

/// Items bucketed by key; keys keep the order in which they were first seen
pub struct Groups<K, A> {
    index: HashMap<K, usize>,
    entries: Vec<(K, Vec<A>)>,
}

impl<K: Hash + Eq + Clone, A> Groups<K, A> {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Append `item` to the bucket for `key`, creating the bucket on first use
    pub fn push(&mut self, key: K, item: A) {
        match self.index.get(&key) {
            Some(&slot) => self.entries[slot].1.push(item),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, vec![item]));
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&[A]> {
        self.index.get(key).map(|&slot| self.entries[slot].1.as_slice())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }
}

impl<K, A> Groups<K, A> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &[A])> {
        self.entries.iter().map(|(key, items)| (key, items.as_slice()))
    }
}

impl<K: Hash + Eq + Clone, A> Default for Groups<K, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> IntoIterator for Groups<K, A> {
    type Item = (K, Vec<A>);
    type IntoIter = std::vec::IntoIter<(K, Vec<A>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Hash + Eq + Clone, A> FromIterator<(K, A)> for Groups<K, A> {
    fn from_iter<T: IntoIterator<Item = (K, A)>>(iter: T) -> Self {
        let mut groups = Self::new();
        for (key, item) in iter {
            groups.push(key, item);
        }
        groups
    }
}

impl<K: PartialEq, A: PartialEq> PartialEq for Groups<K, A> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: fmt::Debug, A: fmt::Debug> fmt::Debug for Groups<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(key, items)| (key, items)))
            .finish()
    }
}

/// Reorder visited results by the draw index of the item that produced them
pub(crate) fn in_input_order<B>(mut visited: Vec<(usize, B)>) -> Vec<B> {
    visited.sort_unstable_by_key(|(index, _)| *index);
    visited.into_iter().map(|(_, value)| value).collect()
}

fn never<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

pub(crate) async fn for_each<P, I, B, E, F, Fut>(policy: &P, input: I, task: F) -> Result<(), E>
where
    P: Policy,
    I: IntoSequence,
    B: Send,
    E: Send,
    F: Fn(I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<B, E>> + Send,
{
    debug!("for_each: called");
    policy
        .drive(input.into_sequence(), |_, item| {
            let pending = task(item);
            async move {
                pending.await?;
                Ok(Outcome::Continue(()))
            }
        })
        .await?;
    Ok(())
}

pub(crate) async fn map<P, I, B, E, F, Fut>(policy: &P, input: I, task: F) -> Result<Vec<B>, E>
where
    P: Policy,
    I: IntoSequence,
    B: Send,
    E: Send,
    F: Fn(I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<B, E>> + Send,
{
    debug!("map: called");
    let visited = policy
        .drive(input.into_sequence(), |_, item| {
            let pending = task(item);
            async move { pending.await.map(Outcome::Continue) }
        })
        .await?;
    Ok(in_input_order(visited))
}

pub(crate) async fn map_settled<P, I, B, E, F, Fut>(policy: &P, input: I, task: F) -> Vec<Settled<B, E>>
where
    P: Policy,
    I: IntoSequence,
    B: Send,
    E: Send,
    F: Fn(I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<B, E>> + Send,
{
    debug!("map_settled: called");
    let visited = policy
        .drive(input.into_sequence(), |_, item| {
            let pending = task(item);
            async move { Ok::<_, Infallible>(Outcome::Continue(Settled::from(pending.await))) }
        })
        .await;
    in_input_order(never(visited))
}

pub(crate) async fn filter<P, I, E, F, Fut>(policy: &P, input: I, predicate: F) -> Result<Vec<I::Item>, E>
where
    P: Policy,
    I: IntoSequence,
    E: Send,
    F: Fn(&I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, E>> + Send,
{
    debug!("filter: called");
    let visited = policy
        .drive(input.into_sequence(), |_, item| {
            let check = predicate(&item);
            async move {
                let keep = check.await?;
                Ok(Outcome::Continue(keep.then_some(item)))
            }
        })
        .await?;
    Ok(in_input_order(visited).into_iter().flatten().collect())
}

pub(crate) async fn some<P, I, E, F, Fut>(policy: &P, input: I, predicate: F) -> Result<bool, E>
where
    P: Policy,
    I: IntoSequence,
    E: Send,
    F: Fn(&I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, E>> + Send,
{
    debug!("some: called");
    let hit = AtomicBool::new(false);
    policy
        .drive(input.into_sequence(), |_, item| {
            let check = predicate(&item);
            let hit = &hit;
            async move {
                if check.await? {
                    hit.store(true, Ordering::SeqCst);
                    return Ok(Outcome::Stop);
                }
                Ok(Outcome::Continue(()))
            }
        })
        .await?;
    Ok(hit.load(Ordering::SeqCst))
}

pub(crate) async fn every<P, I, E, F, Fut>(policy: &P, input: I, predicate: F) -> Result<bool, E>
where
    P: Policy,
    I: IntoSequence,
    E: Send,
    F: Fn(&I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, E>> + Send,
{
    debug!("every: called");
    let miss = AtomicBool::new(false);
    policy
        .drive(input.into_sequence(), |_, item| {
            let check = predicate(&item);
            let miss = &miss;
            async move {
                if !check.await? {
                    miss.store(true, Ordering::SeqCst);
                    return Ok(Outcome::Stop);
                }
                Ok(Outcome::Continue(()))
            }
        })
        .await?;
    Ok(!miss.load(Ordering::SeqCst))
}

pub(crate) async fn find<P, I, E, F, Fut>(policy: &P, input: I, predicate: F) -> Result<Option<I::Item>, E>
where
    P: Policy,
    I: IntoSequence,
    E: Send,
    F: Fn(&I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, E>> + Send,
{
    debug!("find: called");
    // Several in-flight items may match; the earliest drawn one wins
    let found: Mutex<Option<(usize, I::Item)>> = Mutex::new(None);
    policy
        .drive(input.into_sequence(), |index, item| {
            let check = predicate(&item);
            let found = &found;
            async move {
                if !check.await? {
                    return Ok(Outcome::Continue(()));
                }
                let mut slot = found.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.as_ref().is_none_or(|(earlier, _)| index < *earlier) {
                    *slot = Some((index, item));
                }
                Ok(Outcome::Stop)
            }
        })
        .await?;
    let found = found.into_inner().unwrap_or_else(PoisonError::into_inner);
    Ok(found.map(|(_, item)| item))
}

pub(crate) async fn group<P, I, K, E, F, Fut>(policy: &P, input: I, key: F) -> Result<Groups<K, I::Item>, E>
where
    P: Policy,
    I: IntoSequence,
    K: Hash + Eq + Clone + Send,
    E: Send,
    F: Fn(&I::Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<K, E>> + Send,
{
    debug!("group: called");
    let visited = policy
        .drive(input.into_sequence(), |_, item| {
            let compute = key(&item);
            async move {
                let key = compute.await?;
                Ok(Outcome::Continue((key, item)))
            }
        })
        .await?;
    Ok(in_input_order(visited).into_iter().collect())
}
