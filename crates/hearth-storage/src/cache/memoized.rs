//! Single-flight memoization of an async producer.
//!
//! The first caller for a key starts the producer as a detached task and
//! parks a [`CacheEntry::Pending`] in the cache; everyone else who asks for
//! the key before it finishes awaits the same shared future. Dropping a
//! caller's future never cancels the fetch.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

use super::{Cache, CacheEntry, CacheKey, CacheValue, EvictionPolicy, SharedCache, SharedFetch};
use crate::errors::{Result, StorageError};
use crate::metrics::StorageMetrics;

type Producer<K, A, V> = Arc<dyn Fn(K, A) -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Cache-backed wrapper around `producer(key, extra)`.
///
/// `K` is the part of the arguments that identifies the value; `A` carries
/// anything else the producer needs (a store handle, options) and is not
/// part of the key.
pub struct MemoizedAccessor<K, V, A = ()> {
    name: Arc<str>,
    cache: SharedCache<K, V>,
    producer: Producer<K, A, V>,
    #[cfg(any(test, feature = "consistency-check"))]
    consistency_check: Option<fn(&V, &V) -> bool>,
}

impl<K, V, A> Clone for MemoizedAccessor<K, V, A> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            cache: Arc::clone(&self.cache),
            producer: Arc::clone(&self.producer),
            #[cfg(any(test, feature = "consistency-check"))]
            consistency_check: self.consistency_check,
        }
    }
}

impl<K, V, A> std::fmt::Debug for MemoizedAccessor<K, V, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoizedAccessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K, V, A> MemoizedAccessor<K, V, A>
where
    K: CacheKey,
    V: CacheValue,
    A: Send + 'static,
{
    /// Wrap `producer` with a cache named `name`.
    pub fn new<F, Fut>(
        name: &str,
        max_entries: usize,
        policy: EvictionPolicy,
        metrics: &StorageMetrics,
        producer: F,
    ) -> Self
    where
        F: Fn(K, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let cache = Cache::new(name, max_entries, policy, metrics);
        Self {
            name: Arc::from(name),
            cache: Arc::new(Mutex::new(cache)),
            producer: Arc::new(move |key, extra| producer(key, extra).boxed()),
            #[cfg(any(test, feature = "consistency-check"))]
            consistency_check: None,
        }
    }

    /// Return the value for `key`, fetching it at most once concurrently.
    ///
    /// The producer is only called on a miss. A failed fetch fails every
    /// caller that was waiting on it, and the key is invalidated so the next
    /// call fetches again.
    pub async fn get(&self, key: K, extra: A) -> Result<V> {
        match self.lookup(&key, extra) {
            Lookup::Miss(fetch) => fetch.await,
            Lookup::Hit(entry, extra) => {
                let value = entry.resolve().await?;
                self.check_hit(&key, &value, extra).await?;
                Ok(value)
            }
        }
    }

    fn lookup(&self, key: &K, extra: A) -> Lookup<V, A> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key) {
            return Lookup::Hit(entry, extra);
        }

        let sequence = cache.sequence();
        let shared = spawn_fetch(
            &self.name,
            Arc::clone(&self.cache),
            Arc::clone(&self.producer),
            sequence,
            key.clone(),
            extra,
        );
        let _ = cache.update(sequence, key.clone(), CacheEntry::Pending(shared.clone()));
        Lookup::Miss(shared)
    }

    /// Drop `key` so the next call fetches it again.
    pub fn invalidate(&self, key: &K) {
        self.cache.lock().invalidate(key);
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.cache.lock().invalidate_all();
    }

    /// Store a value computed elsewhere (e.g. just written).
    pub fn prefill(&self, key: K, value: V) {
        self.cache.lock().prefill(key, CacheEntry::Ready(value));
    }

    /// The cached value for `key`, if one is ready. Does not fetch.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.cache
            .lock()
            .peek(key)
            .and_then(|entry| entry.ready().cloned())
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries, ready or pending.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Current invalidation sequence of the underlying cache.
    pub fn sequence(&self) -> u64 {
        self.cache.lock().sequence()
    }

    pub(crate) fn shared_cache(&self) -> SharedCache<K, V> {
        Arc::clone(&self.cache)
    }
}

enum Lookup<V, A> {
    Hit(CacheEntry<V>, A),
    Miss(SharedFetch<V>),
}

// The producer runs inside the task, never under the cache lock.
fn spawn_fetch<K, V, A>(
    name: &Arc<str>,
    cache: SharedCache<K, V>,
    producer: Producer<K, A, V>,
    sequence: u64,
    key: K,
    extra: A,
) -> SharedFetch<V>
where
    K: CacheKey,
    V: CacheValue,
    A: Send + 'static,
{
    let name = Arc::clone(name);
    let handle = tokio::spawn(async move {
        let result = producer(key.clone(), extra).await;
        let mut cache = cache.lock();
        match &result {
            Ok(value) => {
                if !cache.update(sequence, key.clone(), CacheEntry::Ready(value.clone())) {
                    debug!(cache = %name, ?key, "discarding result fetched before invalidation");
                }
            }
            Err(err) => {
                debug!(cache = %name, ?key, error = %err, "fetch failed, invalidating");
                cache.invalidate(&key);
            }
        }
        result
    });

    async move {
        handle
            .await
            .unwrap_or_else(|err| Err(StorageError::Worker(err.to_string())))
    }
    .boxed()
    .shared()
}

// ─────────────────────────────────────────────────────────────────────────────
// Consistency check
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "consistency-check"))]
impl<K, V, A> MemoizedAccessor<K, V, A>
where
    K: CacheKey,
    V: CacheValue + PartialEq,
    A: Send + 'static,
{
    /// Re-run the producer on every hit and fail with
    /// [`StorageError::StaleCache`] if it disagrees with the cached value.
    #[must_use]
    pub fn with_consistency_check(mut self) -> Self {
        self.consistency_check = Some(<V as PartialEq>::eq);
        self
    }
}

impl<K, V, A> MemoizedAccessor<K, V, A>
where
    K: CacheKey,
    V: CacheValue,
    A: Send + 'static,
{
    #[cfg(any(test, feature = "consistency-check"))]
    async fn check_hit(
        &self,
        key: &K,
        cached: &V,
        extra: A,
    ) -> Result<()> {
        let Some(same) = self.consistency_check else {
            return Ok(());
        };
        let fresh = (self.producer)(key.clone(), extra).await?;
        if same(cached, &fresh) {
            return Ok(());
        }
        tracing::error!(cache = %self.name, ?key, "stale cache entry");
        Err(StorageError::StaleCache {
            cache: self.name.to_string(),
            key: format!("{key:?}"),
        })
    }

    #[cfg(not(any(test, feature = "consistency-check")))]
    #[allow(clippy::unused_async)]
    async fn check_hit(
        &self,
        _key: &K,
        _cached: &V,
        _extra: A,
    ) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
