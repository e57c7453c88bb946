//! Bounded key/value store with a sequence-gated write path.
//!
//! Readers capture [`Cache::sequence`] before they start fetching and hand
//! it back to [`Cache::update`] when the fetch completes. Any invalidation in
//! between bumps the sequence, so the late result is dropped instead of
//! resurrecting a value that was invalidated while it was in flight.
//!
//! Every mutating method takes `&mut self`: a cache has exactly one owner at
//! a time, and concurrent users go through that owner (see
//! [`MemoizedAccessor`](super::MemoizedAccessor)).

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use crate::metrics::{CacheMetrics, StorageMetrics};

/// Which entry is evicted when a full cache receives a new key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the entry read or written least recently.
    Lru,
    /// Evict the entry inserted first; reads do not reorder.
    #[default]
    InsertionOrder,
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    tick: u64,
}

/// A named, bounded cache.
#[derive(Debug)]
pub struct Cache<K, V> {
    name: String,
    max_entries: usize,
    policy: EvictionPolicy,
    sequence: u64,
    entries: HashMap<K, Slot<V>>,
    // tick -> key, oldest first
    order: BTreeMap<u64, K>,
    next_tick: u64,
    metrics: Arc<CacheMetrics>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create an empty cache. A capacity of zero is treated as one.
    pub fn new(
        name: &str,
        max_entries: usize,
        policy: EvictionPolicy,
        metrics: &StorageMetrics,
    ) -> Self {
        let metrics = metrics.cache(name);
        metrics.set_size(0);
        Self {
            name: name.to_owned(),
            max_entries: max_entries.max(1),
            policy,
            sequence: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            metrics,
        }
    }

    /// Look up `key`, counting a hit or a miss.
    ///
    /// Under [`EvictionPolicy::Lru`] a hit makes the entry most recent.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let Some(slot) = self.entries.get(key) else {
            self.metrics.misses.inc();
            return None;
        };
        let value = slot.value.clone();
        self.metrics.hits.inc();
        if self.policy == EvictionPolicy::Lru {
            self.touch(key);
        }
        Some(value)
    }

    /// The value for `key` without counting a lookup or reordering.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Whether `key` is present. Does not count or reorder.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Install `value` only if no invalidation happened since `sequence` was
    /// read. Returns whether the value was installed.
    pub fn update(&mut self, sequence: u64, key: K, value: V) -> bool {
        if sequence != self.sequence {
            return false;
        }
        self.prefill(key, value);
        true
    }

    /// Install `value` unconditionally, evicting if the cache is full.
    ///
    /// Re-prefilling a present key replaces its value without evicting
    /// anything; it keeps its position under insertion order and becomes
    /// most recent under LRU.
    pub fn prefill(&mut self, key: K, value: V) {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.value = value;
            if self.policy == EvictionPolicy::Lru {
                self.touch(&key);
            }
            return;
        }

        while self.entries.len() >= self.max_entries {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            let _ = self.entries.remove(&oldest);
        }

        let tick = self.bump_tick();
        let _ = self.order.insert(tick, key.clone());
        let _ = self.entries.insert(key, Slot { value, tick });
        self.metrics.set_size(self.entries.len());
    }

    /// Drop `key` and advance the sequence, whether or not it was present.
    pub fn invalidate(&mut self, key: &K) {
        self.sequence += 1;
        if let Some(slot) = self.entries.remove(key) {
            let _ = self.order.remove(&slot.tick);
        }
        self.metrics.set_size(self.entries.len());
    }

    /// Drop everything and advance the sequence.
    pub fn invalidate_all(&mut self) {
        self.sequence += 1;
        self.entries.clear();
        self.order.clear();
        self.metrics.set_size(0);
    }

    /// Current invalidation sequence.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache name, as used in metrics and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Eviction policy.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &K) {
        let tick = self.bump_tick();
        if let Some(slot) = self.entries.get_mut(key) {
            let old = std::mem::replace(&mut slot.tick, tick);
            if let Some(k) = self.order.remove(&old) {
                let _ = self.order.insert(tick, k);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
