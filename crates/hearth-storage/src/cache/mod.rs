//! Memoizing caches.
//!
//! - [`Cache`]: bounded store with sequence-gated updates
//! - [`MemoizedAccessor`]: single-flight, cache-backed async lookups
//! - [`BatchedMemoizedAccessor`]: many-key lookups sharing a memoized cache

mod batched;
mod memoized;
mod store;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::errors::Result;

pub use batched::BatchedMemoizedAccessor;
pub use memoized::MemoizedAccessor;
pub use store::{Cache, EvictionPolicy};

/// Bounds every cache key satisfies. Tuples of such types qualify.
pub trait CacheKey: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static {}

/// Bounds every cached value satisfies.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// An in-flight fetch that any number of callers can await.
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

/// What a cache slot holds.
#[derive(Clone)]
pub enum CacheEntry<V> {
    /// A fetch is running; every caller for this key awaits the same one.
    Pending(SharedFetch<V>),
    /// The fetch finished successfully.
    Ready(V),
}

impl<V: CacheValue> CacheEntry<V> {
    /// Wait for the value.
    pub async fn resolve(self) -> Result<V> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(fetch) => fetch.await,
        }
    }

    /// The value, if the fetch has finished.
    pub fn ready(&self) -> Option<&V> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Pending(_) => None,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending"),
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
        }
    }
}

pub(crate) type SharedCache<K, V> = Arc<Mutex<Cache<K, CacheEntry<V>>>>;
