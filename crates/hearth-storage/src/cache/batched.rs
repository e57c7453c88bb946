//! Many-key lookups over the cache of a [`MemoizedAccessor`].
//!
//! Keys already cached (or in flight) are served from the shared cache; all
//! other keys are fetched with one call to the batch producer, and each of
//! them gets its own pending entry so single-key callers can attach to the
//! batch while it runs.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, try_join_all};
use tracing::debug;

use super::{CacheEntry, CacheKey, CacheValue, MemoizedAccessor, SharedCache, SharedFetch};
use crate::errors::{Result, StorageError};

type BatchProducer<K, A, V> =
    Arc<dyn Fn(Vec<K>, A) -> BoxFuture<'static, Result<HashMap<K, V>>> + Send + Sync>;

type SharedBatch<K, V> = Shared<BoxFuture<'static, Result<Arc<HashMap<K, V>>>>>;

/// Batched companion of a [`MemoizedAccessor`], sharing its cache.
pub struct BatchedMemoizedAccessor<K, V, A = ()> {
    name: Arc<str>,
    cache: SharedCache<K, V>,
    producer: BatchProducer<K, A, V>,
}

impl<K, V, A> Clone for BatchedMemoizedAccessor<K, V, A> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            cache: Arc::clone(&self.cache),
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<K, V, A> std::fmt::Debug for BatchedMemoizedAccessor<K, V, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedMemoizedAccessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K, V, A> BatchedMemoizedAccessor<K, V, A>
where
    K: CacheKey,
    V: CacheValue,
    A: Send + 'static,
{
    /// Attach a batch producer to the cache of `single`.
    ///
    /// `producer(keys, extra)` must return a value for every key it can
    /// find; keys it leaves out fail with [`StorageError::NotFound`].
    pub fn new<B, F, Fut>(single: &MemoizedAccessor<K, V, B>, producer: F) -> Self
    where
        B: Send + 'static,
        F: Fn(Vec<K>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<K, V>>> + Send + 'static,
    {
        Self {
            name: Arc::from(single.name()),
            cache: single.shared_cache(),
            producer: Arc::new(move |keys, extra| producer(keys, extra).boxed()),
        }
    }

    /// Values for every key in `keys`. Duplicates are collapsed.
    ///
    /// Fails as a whole if any key fails.
    pub async fn get_many<I>(&self, keys: I, extra: A) -> Result<HashMap<K, V>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut seen = HashSet::new();
        let wanted: Vec<K> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();

        let entries = self.lookup(wanted, extra);
        let pairs = try_join_all(
            entries
                .into_iter()
                .map(|(key, entry)| async move { entry.resolve().await.map(|v| (key, v)) }),
        )
        .await?;
        Ok(pairs.into_iter().collect())
    }

    fn lookup(&self, wanted: Vec<K>, extra: A) -> Vec<(K, CacheEntry<V>)> {
        let mut cache = self.cache.lock();
        let mut entries = Vec::with_capacity(wanted.len());
        let mut misses = Vec::new();
        for key in wanted {
            match cache.get(&key) {
                Some(entry) => entries.push((key, entry)),
                None => misses.push(key),
            }
        }
        if misses.is_empty() {
            return entries;
        }

        let sequence = cache.sequence();
        let batch = self.spawn_batch(sequence, misses.clone(), extra);
        for key in misses {
            let fetch = demux(&self.name, &batch, key.clone());
            let _ = cache.update(sequence, key.clone(), CacheEntry::Pending(fetch.clone()));
            entries.push((key, CacheEntry::Pending(fetch)));
        }
        entries
    }

    fn spawn_batch(&self, sequence: u64, keys: Vec<K>, extra: A) -> SharedBatch<K, V> {
        let name = Arc::clone(&self.name);
        let cache = Arc::clone(&self.cache);
        let producer = Arc::clone(&self.producer);
        let handle = tokio::spawn(async move {
            // The producer is only invoked here, outside the cache lock.
            let result = producer(keys.clone(), extra).await;
            let mut cache = cache.lock();
            match result {
                Ok(values) => {
                    let mut absent = Vec::new();
                    for key in keys {
                        match values.get(&key) {
                            Some(value) => {
                                let _ = cache.update(sequence, key, CacheEntry::Ready(value.clone()));
                            }
                            None => absent.push(key),
                        }
                    }
                    for key in &absent {
                        cache.invalidate(key);
                    }
                    debug!(cache = %name, fetched = values.len(), absent = absent.len(), "batch fetched");
                    Ok(Arc::new(values))
                }
                Err(err) => {
                    debug!(cache = %name, keys = keys.len(), error = %err, "batch failed, invalidating");
                    for key in &keys {
                        cache.invalidate(key);
                    }
                    Err(err)
                }
            }
        });

        async move {
            handle
                .await
                .unwrap_or_else(|err| Err(StorageError::Worker(err.to_string())))
        }
        .boxed()
        .shared()
    }
}

fn demux<K: CacheKey, V: CacheValue>(name: &Arc<str>, batch: &SharedBatch<K, V>, key: K) -> SharedFetch<V> {
    let name = Arc::clone(name);
    let batch = batch.clone();
    async move {
        let values = batch.await?;
        values
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(&name))
    }
    .boxed()
    .shared()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
