//! Deferred pipelines
//!
//! A [`Chain`] records stages over an input without running anything. The
//! stage list is materialised with [`Chain::get`] (or [`Reduced::get`] for a
//! reducing last stage) against whichever [`Policy`] the caller supplies, each
//! stage's output becoming the next stage's input.
//!
//! ```ignore
//! let words = Chain::new(lines)
//!     .map(|line: String| async move { fetch(line).await })
//!     .filter(|page: &Page| {
//!         let ok = page.status == 200;
//!         async move { Ok(ok) }
//!     })
//!     .get(&pool)
//!     .await?;
//! ```
//!
//! Stage callbacks are stored, so they and their futures must be `'static`.

use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::combinator::{Groups, Settled};
use crate::policy::Policy;
use crate::sequence::{IntoSequence, Sequence};

/// An item flowing between stages
type Value = Box<dyn Any + Send>;

type Task<E> = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, E>> + Send + Sync>;
type SettledTask = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;
type Predicate<E> = Arc<dyn Fn(&Value) -> BoxFuture<'static, Result<bool, E>> + Send + Sync>;
type KeyFn<E> = Arc<dyn Fn(&Value) -> BoxFuture<'static, Result<Value, E>> + Send + Sync>;

/// One recorded transformation
enum Stage<E> {
    Map(Task<E>),
    MapSettled {
        task: SettledTask,
        settle: fn(Settled<Value, Value>) -> Value,
    },
    Filter(Predicate<E>),
    Group {
        key: KeyFn<E>,
        collect: fn(Vec<(Value, Value)>) -> Vec<Value>,
    },
}

impl<E> Stage<E> {
    fn name(&self) -> &'static str {
        match self {
            Stage::Map(_) => "map",
            Stage::MapSettled { .. } => "map_settled",
            Stage::Filter(_) => "filter",
            Stage::Group { .. } => "group",
        }
    }
}

/// A reducing last stage
enum Reduction<E> {
    Some(Predicate<E>),
    Find(Predicate<E>),
    Every(Predicate<E>),
}

/// What a reduction produced, before it is handed back typed
enum Verdict {
    Flag(bool),
    Found(Option<Value>),
}

fn unerase<T: 'static>(value: Value) -> T {
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => unreachable!("chain stage did not produce {}", type_name::<T>()),
    }
}

fn peek<T: 'static>(value: &Value) -> &T {
    match value.downcast_ref::<T>() {
        Some(value) => value,
        None => unreachable!("chain stage did not produce {}", type_name::<T>()),
    }
}

fn erase<T: Send + 'static>(value: T) -> Value {
    Box::new(value)
}

fn settle_as<B: Send + 'static, E: Send + 'static>(settled: Settled<Value, Value>) -> Value {
    let typed: Settled<B, E> = match settled {
        Settled::Fulfilled { value } => Settled::Fulfilled { value: unerase(value) },
        Settled::Rejected { reason } => Settled::Rejected { reason: unerase(reason) },
    };
    erase(typed)
}

fn collect_groups<K, T>(pairs: Vec<(Value, Value)>) -> Vec<Value>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Send + 'static,
{
    let groups: Groups<K, T> = pairs
        .into_iter()
        .map(|(key, item)| (unerase::<K>(key), unerase::<T>(item)))
        .collect();
    groups.into_iter().map(erase).collect()
}

fn flag(verdict: Verdict) -> bool {
    match verdict {
        Verdict::Flag(flag) => flag,
        Verdict::Found(_) => unreachable!("find verdict for a boolean reduction"),
    }
}

fn found<T: 'static>(verdict: Verdict) -> Option<T> {
    match verdict {
        Verdict::Found(item) => item.map(unerase),
        Verdict::Flag(_) => unreachable!("boolean verdict for find"),
    }
}

fn erase_predicate<T, E, F, Fut>(predicate: F) -> Predicate<E>
where
    T: 'static,
    F: Fn(&T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, E>> + Send + 'static,
{
    Arc::new(move |value: &Value| predicate(peek::<T>(value)).boxed())
}

/// A recorded pipeline over items of type `T`, failing with `E`
pub struct Chain<T, E> {
    source: Sequence<Value>,
    stages: Vec<Stage<E>>,
    _item: PhantomData<fn() -> T>,
}

impl<T, E> Chain<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start a chain over `input`; nothing is pulled until it is materialised
    pub fn new<I>(input: I) -> Self
    where
        I: IntoSequence<Item = T>,
    {
        Self {
            source: input.into_sequence().map_items(erase),
            stages: Vec::new(),
            _item: PhantomData,
        }
    }

    fn push<U>(mut self, stage: Stage<E>) -> Chain<U, E> {
        self.stages.push(stage);
        Chain {
            source: self.source,
            stages: self.stages,
            _item: PhantomData,
        }
    }

    fn reduce<R>(self, reduction: Reduction<E>, extract: fn(Verdict) -> R) -> Reduced<R, E> {
        Reduced {
            source: self.source,
            stages: self.stages,
            reduction,
            extract,
        }
    }

    /// Number of recorded stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Transform every item
    pub fn map<B, F, Fut>(self, task: F) -> Chain<B, E>
    where
        B: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B, E>> + Send + 'static,
    {
        let task: Task<E> = Arc::new(move |value: Value| task(unerase(value)).map(|out| out.map(erase)).boxed());
        self.push(Stage::Map(task))
    }

    /// Transform every item, recording failures instead of aborting
    pub fn map_settled<B, E2, F, Fut>(self, task: F) -> Chain<Settled<B, E2>, E>
    where
        B: Send + 'static,
        E2: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B, E2>> + Send + 'static,
    {
        let task: SettledTask = Arc::new(move |value: Value| {
            task(unerase(value))
                .map(|out| out.map(erase).map_err(erase))
                .boxed()
        });
        self.push(Stage::MapSettled {
            task,
            settle: settle_as::<B, E2>,
        })
    }

    /// Keep the items the predicate accepts
    pub fn filter<F, Fut>(self, predicate: F) -> Chain<T, E>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, E>> + Send + 'static,
    {
        self.push(Stage::Filter(erase_predicate(predicate)))
    }

    /// Bucket items by key; the next stage sees one `(key, items)` entry per group
    pub fn group<K, F, Fut>(self, key: F) -> Chain<(K, Vec<T>), E>
    where
        K: Hash + Eq + Clone + Send + 'static,
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<K, E>> + Send + 'static,
    {
        let key: KeyFn<E> = Arc::new(move |value: &Value| key(peek::<T>(value)).map(|out| out.map(erase)).boxed());
        self.push(Stage::Group {
            key,
            collect: collect_groups::<K, T>,
        })
    }

    /// Whether any item satisfies the predicate
    pub fn some<F, Fut>(self, predicate: F) -> Reduced<bool, E>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, E>> + Send + 'static,
    {
        self.reduce(Reduction::Some(erase_predicate(predicate)), flag)
    }

    /// First item satisfying the predicate
    pub fn find<F, Fut>(self, predicate: F) -> Reduced<Option<T>, E>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, E>> + Send + 'static,
    {
        self.reduce(Reduction::Find(erase_predicate(predicate)), found::<T>)
    }

    /// Whether every item satisfies the predicate
    pub fn every<F, Fut>(self, predicate: F) -> Reduced<bool, E>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, E>> + Send + 'static,
    {
        self.reduce(Reduction::Every(erase_predicate(predicate)), flag)
    }

    /// Run every stage through `policy` and collect the final items
    pub async fn get<P: Policy>(self, policy: &P) -> Result<Vec<T>, E> {
        debug!(stages = self.stages.len(), "Chain::get: called");
        let mut output = evaluate(self.source, self.stages, policy).await?;
        let mut items = Vec::new();
        while let Some(value) = output.next().await {
            items.push(unerase(value));
        }
        Ok(items)
    }
}

impl<T, E> fmt::Debug for Chain<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<_> = self.stages.iter().map(Stage::name).collect();
        f.debug_struct("Chain")
            .field("source", &self.source)
            .field("stages", &stages)
            .finish()
    }
}

/// A chain ending in `some`, `find` or `every`
pub struct Reduced<R, E> {
    source: Sequence<Value>,
    stages: Vec<Stage<E>>,
    reduction: Reduction<E>,
    extract: fn(Verdict) -> R,
}

impl<R, E: Send + 'static> Reduced<R, E> {
    /// Run every stage through `policy` and reduce the result to one value
    pub async fn get<P: Policy>(self, policy: &P) -> Result<R, E> {
        debug!(stages = self.stages.len(), "Reduced::get: called");
        let items = evaluate(self.source, self.stages, policy).await?;
        let verdict = match self.reduction {
            Reduction::Some(check) => Verdict::Flag(policy.some(items, |value: &Value| check(value)).await?),
            Reduction::Every(check) => Verdict::Flag(policy.every(items, |value: &Value| check(value)).await?),
            Reduction::Find(check) => Verdict::Found(policy.find(items, |value: &Value| check(value)).await?),
        };
        Ok((self.extract)(verdict))
    }
}

impl<R, E> fmt::Debug for Reduced<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reduction = match self.reduction {
            Reduction::Some(_) => "some",
            Reduction::Find(_) => "find",
            Reduction::Every(_) => "every",
        };
        let stages: Vec<_> = self.stages.iter().map(Stage::name).collect();
        f.debug_struct("Reduced")
            .field("stages", &stages)
            .field("reduction", &reduction)
            .finish()
    }
}

/// Fold the stages left to right, returning the last stage's output
///
/// The source is handed to the first stage untouched, so a chain with no
/// stages (or a reduction right after the source) still pulls lazily.
async fn evaluate<P, E>(source: Sequence<Value>, stages: Vec<Stage<E>>, policy: &P) -> Result<Sequence<Value>, E>
where
    P: Policy,
    E: Send + 'static,
{
    let mut current = source;
    for stage in stages {
        debug!(stage = stage.name(), "chain::evaluate: running stage");
        let output = match stage {
            Stage::Map(task) => policy.map(current, |value: Value| task(value)).await?,
            Stage::MapSettled { task, settle } => policy
                .map_settled(current, |value: Value| task(value))
                .await
                .into_iter()
                .map(settle)
                .collect(),
            Stage::Filter(check) => policy.filter(current, |value: &Value| check(value)).await?,
            Stage::Group { key, collect } => {
                let pairs = policy
                    .map(current, |value: Value| {
                        let compute = key(&value);
                        async move { Ok::<_, E>((compute.await?, value)) }
                    })
                    .await?;
                collect(pairs)
            }
        };
        current = Sequence::new(output);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Batch, BatchOptions, Concurrency, ConcurrencyOptions, Throttle, ThrottleOptions};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pipeline(input: Vec<u32>) -> Chain<String, Infallible> {
        Chain::new(input)
            .map(|n: u32| async move {
                // Later items finish first
                tokio::time::sleep(Duration::from_millis(u64::from(10 - n))).await;
                Ok(n * 3)
            })
            .filter(|n: &u32| {
                let even = n % 2 == 0;
                async move { Ok(even) }
            })
            .map(|n: u32| async move { Ok(format!("#{n}")) })
    }

    #[tokio::test]
    async fn test_same_chain_on_every_policy() {
        let expected = vec!["#0", "#6", "#12", "#18", "#24"];
        let input: Vec<u32> = (0..10).collect();

        let batch = Batch::new(BatchOptions::new(3)).unwrap();
        assert_eq!(pipeline(input.clone()).get(&batch).await.unwrap(), expected);

        let pool = Concurrency::new(ConcurrencyOptions::new(4)).unwrap();
        assert_eq!(pipeline(input.clone()).get(&pool).await.unwrap(), expected);

        let throttle = Throttle::new(ThrottleOptions::new(4, 0)).unwrap();
        assert_eq!(pipeline(input).get(&throttle).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_nothing_runs_until_get() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = {
            let calls = calls.clone();
            Chain::new(vec![1, 2, 3]).map(move |n: i32| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Infallible>(n) }
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.len(), 1);

        let pool = Concurrency::new(ConcurrencyOptions::new(2)).unwrap();
        assert_eq!(chain.get(&pool).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_stages_returns_source() {
        let chain: Chain<&str, Infallible> = Chain::new(vec!["a", "b"]);
        assert!(chain.is_empty());
        let pool = Concurrency::new(ConcurrencyOptions::new(2)).unwrap();
        assert_eq!(chain.get(&pool).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_group_then_map_entries() {
        let pool = Concurrency::new(ConcurrencyOptions::new(3)).unwrap();
        let sizes = Chain::new(vec!["apple", "bean", "avocado", "beet", "cherry"])
            .group(|word: &&str| {
                let initial = word.chars().next();
                async move { Ok::<_, Infallible>(initial) }
            })
            .map(|(initial, words): (Option<char>, Vec<&'static str>)| async move { Ok((initial, words.len())) })
            .get(&pool)
            .await
            .unwrap();

        assert_eq!(sizes, vec![(Some('a'), 2), (Some('b'), 2), (Some('c'), 1)]);
    }

    #[tokio::test]
    async fn test_map_settled_stage() {
        let pool = Concurrency::new(ConcurrencyOptions::new(2)).unwrap();
        let settled = Chain::<u32, Infallible>::new(vec![1, 2, 3])
            .map_settled(|n: u32| async move { if n == 2 { Err("two") } else { Ok(n * 10) } })
            .get(&pool)
            .await
            .unwrap();

        assert_eq!(settled, vec![
            Settled::Fulfilled { value: 10 },
            Settled::Rejected { reason: "two" },
            Settled::Fulfilled { value: 30 },
        ]);
    }

    #[tokio::test]
    async fn test_stage_error_aborts() {
        let later = Arc::new(AtomicUsize::new(0));
        let chain = {
            let later = later.clone();
            Chain::new(vec![1, 2, 3])
                .map(|n: u32| async move { if n == 2 { Err("bad item") } else { Ok(n) } })
                .map(move |n: u32| {
                    later.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(n) }
                })
        };

        let batch = Batch::new(BatchOptions::new(2)).unwrap();
        assert_eq!(chain.get(&batch).await, Err("bad item"));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_find_pulls_lazily() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let source = {
            let pulled = pulled.clone();
            (1..=100u32).inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
        };

        let pool = Concurrency::new(ConcurrencyOptions::new(1)).unwrap();
        let found = Chain::new(source)
            .find(|n: &u32| {
                let hit = *n == 2;
                async move { Ok::<_, Infallible>(hit) }
            })
            .get(&pool)
            .await
            .unwrap();

        assert_eq!(found, Some(2));
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reductions_after_stages() {
        let throttle = Throttle::new(ThrottleOptions::new(2, 0)).unwrap();
        let doubled = || Chain::new(1..=5u32).map(|n: u32| async move { Ok::<_, Infallible>(n * 2) });

        assert!(doubled().every(|n: &u32| {
            let even = n % 2 == 0;
            async move { Ok(even) }
        })
        .get(&throttle)
        .await
        .unwrap());

        assert!(!doubled().some(|n: &u32| {
            let odd = n % 2 == 1;
            async move { Ok(odd) }
        })
        .get(&throttle)
        .await
        .unwrap());

        let big = doubled()
            .find(|n: &u32| {
                let big = *n > 5;
                async move { Ok(big) }
            })
            .get(&throttle)
            .await
            .unwrap();
        assert_eq!(big, Some(6));
    }

    #[test]
    fn test_debug_lists_stages() {
        let reduced = Chain::new(vec![1u8])
            .filter(|_: &u8| async { Ok::<_, Infallible>(true) })
            .map(|n: u8| async move { Ok(n) })
            .some(|_: &u8| async { Ok(false) });
        let shown = format!("{reduced:?}");
        assert!(shown.contains(r#"["filter", "map"]"#), "{shown}");
        assert!(shown.contains("some"), "{shown}");
    }
}
