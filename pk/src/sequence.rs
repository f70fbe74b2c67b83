//! Sequence adapter
//!
//! Normalizes a synchronous iterator or an asynchronous stream into one pull
//! protocol. The capability is picked once, when the sequence is built, and
//! every operation consumes its sequence exactly once.

use std::fmt;
use std::future::Future;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::{debug, trace};

/// Where the items come from
enum Source<A> {
    Sync(Box<dyn Iterator<Item = A> + Send>),
    Async(BoxStream<'static, A>),
    Closed,
}

/// A single-use, pull-based source of items
pub struct Sequence<A> {
    source: Source<A>,
    drawn: usize,
}

impl<A: Send + 'static> Sequence<A> {
    /// Wrap a synchronous iterator
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: Source::Sync(Box::new(items.into_iter())),
            drawn: 0,
        }
    }

    /// Wrap an asynchronous stream
    pub fn from_stream<S>(items: S) -> Self
    where
        S: Stream<Item = A> + Send + 'static,
    {
        Self {
            source: Source::Async(items.boxed()),
            drawn: 0,
        }
    }

    /// Wrap a producer that yields not-yet-resolved items
    ///
    /// Each future is awaited when its item is pulled, so tasks only ever see
    /// resolved values.
    pub fn from_futures<I, F>(items: I) -> Self
    where
        I: IntoIterator<Item = F>,
        I::IntoIter: Send + 'static,
        F: Future<Output = A> + Send + 'static,
    {
        Self::from_stream(stream::iter(items).then(|item| item))
    }

    /// An already exhausted sequence
    pub fn empty() -> Self {
        Self {
            source: Source::Closed,
            drawn: 0,
        }
    }

    /// Pull the next item, or `None` once the source is exhausted or closed
    pub async fn next(&mut self) -> Option<A> {
        let item = match &mut self.source {
            Source::Sync(iter) => iter.next(),
            Source::Async(stream) => stream.next().await,
            Source::Closed => return None,
        };
        match item {
            Some(item) => {
                self.drawn += 1;
                Some(item)
            }
            None => {
                trace!(drawn = self.drawn, "Sequence::next: exhausted");
                self.source = Source::Closed;
                None
            }
        }
    }

    /// Pull the next item together with its draw index
    pub(crate) async fn next_indexed(&mut self) -> Option<(usize, A)> {
        let index = self.drawn;
        self.next().await.map(|item| (index, item))
    }

    /// Apply a synchronous conversion to every item
    pub(crate) fn map_items<B, F>(self, f: F) -> Sequence<B>
    where
        B: Send + 'static,
        F: FnMut(A) -> B + Send + 'static,
    {
        let source = match self.source {
            Source::Sync(iter) => Source::Sync(Box::new(iter.map(f))),
            Source::Async(stream) => Source::Async(stream.map(f).boxed()),
            Source::Closed => Source::Closed,
        };
        Sequence {
            source,
            drawn: self.drawn,
        }
    }
}

impl<A> Sequence<A> {
    /// Stop pulling and release the underlying producer
    ///
    /// Dropping the iterator or stream is how upstream learns that no more
    /// items will be requested.
    pub fn close(&mut self) {
        if !matches!(self.source, Source::Closed) {
            debug!(drawn = self.drawn, "Sequence::close: releasing source");
        }
        self.source = Source::Closed;
    }

    /// Whether the source has been exhausted or closed
    pub fn is_closed(&self) -> bool {
        matches!(self.source, Source::Closed)
    }

    /// Number of items pulled so far
    pub fn drawn(&self) -> usize {
        self.drawn
    }
}

impl<A> fmt::Debug for Sequence<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.source {
            Source::Sync(_) => "sync",
            Source::Async(_) => "async",
            Source::Closed => "closed",
        };
        f.debug_struct("Sequence")
            .field("source", &kind)
            .field("drawn", &self.drawn)
            .finish()
    }
}

/// Anything an operation can consume as its input
pub trait IntoSequence {
    type Item: Send + 'static;

    fn into_sequence(self) -> Sequence<Self::Item>;
}

impl<I> IntoSequence for I
where
    I: IntoIterator,
    I::Item: Send + 'static,
    I::IntoIter: Send + 'static,
{
    type Item = I::Item;

    fn into_sequence(self) -> Sequence<Self::Item> {
        Sequence::new(self)
    }
}

impl<A: Send + 'static> IntoSequence for Sequence<A> {
    type Item = A;

    fn into_sequence(self) -> Sequence<A> {
        self
    }
}
