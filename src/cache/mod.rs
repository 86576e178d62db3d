//! Expiring cache: bounded key→value store with LRU eviction and per-entry TTL
//!
//! What this module provides
//! - [`ExpiringCache<K, V>`], a generic, reusable store; the pipeline keeps one
//!   instance for call results (short TTL) and one for the tool catalog (long TTL)
//! - [`CacheLayer`], the Tower layer memoizing successful tool results
//!
//! Invariants
//! - `len() <= max_size` after every operation
//! - every key appears exactly once in the access-order sequence, and that
//!   sequence matches the index key set exactly
//! - a `get` strictly after `inserted_at + ttl` is a miss and drops the entry
//!
//! Implementation strategy
//! - Access order is a `BTreeMap<tick, key>` with a monotonically increasing
//!   tick, so the least-recently-accessed key is always the first entry and
//!   ties resolve by insertion order
//! - All state sits behind one `std::sync::Mutex`; critical sections never await
//! - Time comes from `tokio::time::Instant` so tests can pause and advance it

mod layer;

pub use layer::{cache_key, Cache, CacheLayer};

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// A stored value plus its access metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Counters and sizing reported by [`ExpiringCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

struct Slot<V> {
    entry: CacheEntry<V>,
    tick: u64,
}

struct Inner<K, V> {
    index: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn tick(&mut self) -> u64 {
        let t = self.next_tick;
        self.next_tick += 1;
        t
    }

    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.index.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot)
    }

    fn prune_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .index
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    fn evict_lru(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.index.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Bounded, TTL-aware LRU cache. Clones share the same storage.
pub struct ExpiringCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<K, V> Clone for ExpiringCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            max_size: self.max_size,
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> std::fmt::Debug for ExpiringCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("max_size", &self.max_size)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A `max_size` of zero is treated as one.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                index: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            })),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry, refreshing its recency. Expired entries are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = match inner.index.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(slot) => slot.entry.is_expired(now),
        };
        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }
        let tick = inner.tick();
        let slot = inner.index.get_mut(key)?;
        let old_tick = std::mem::replace(&mut slot.tick, tick);
        slot.entry.last_accessed_at = now;
        slot.entry.access_count += 1;
        let value = slot.entry.value.clone();
        inner.order.remove(&old_tick);
        inner.order.insert(tick, key.clone());
        inner.hits += 1;
        Some(value)
    }

    /// Live entry with metadata, without touching recency or counters.
    pub fn peek(&self, key: &K) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .index
            .get(key)
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or replace. Inserting into a full cache first drops expired
    /// entries, then evicts the least-recently-accessed key.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.lock();
        self.insert_locked(&mut inner, key, value, ttl);
    }

    /// Insert only if `admit` holds. `admit` runs under the cache lock, so an
    /// invalidation that follows a change in its answer cannot be overtaken.
    pub fn set_if(
        &self,
        key: K,
        value: V,
        ttl: Duration,
        admit: impl FnOnce() -> bool,
    ) -> bool {
        let mut inner = self.lock();
        if !admit() {
            return false;
        }
        self.insert_locked(&mut inner, key, value, ttl);
        true
    }

    fn insert_locked(&self, inner: &mut Inner<K, V>, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        inner.remove(&key);
        if inner.index.len() >= self.max_size {
            inner.prune_expired(now);
        }
        while inner.index.len() >= self.max_size {
            if inner.evict_lru().is_none() {
                break;
            }
        }
        let tick = inner.tick();
        inner.order.insert(tick, key.clone());
        inner.index.insert(
            key,
            Slot {
                entry: CacheEntry {
                    value,
                    inserted_at: now,
                    last_accessed_at: now,
                    access_count: 0,
                    ttl,
                },
                tick,
            },
        );
    }

    pub fn delete(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.index.clear();
        inner.order.clear();
    }

    /// Number of live entries; expired entries are dropped first.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune_expired(now);
        inner.index.len()
    }

    pub fn size(&self) -> usize {
        self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prune_expired(&self) -> usize {
        self.lock().prune_expired(Instant::now())
    }

    /// Live keys from least to most recently accessed.
    pub fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune_expired(now);
        inner.order.values().cloned().collect()
    }

    /// Remove every entry whose key matches `pred`. Returns the count removed.
    pub fn invalidate_where(&self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let mut inner = self.lock();
        let doomed: Vec<K> = inner.index.keys().filter(|k| pred(k)).cloned().collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune_expired(now);
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.index.len(),
            max_size: self.max_size,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Zero the hit/miss/eviction counters without touching entries.
    pub fn reset_stats(&self) {
        let mut inner = self.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.expirations = 0;
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.lock();
        assert!(inner.index.len() <= self.max_size);
        assert_eq!(inner.index.len(), inner.order.len());
        for (tick, key) in &inner.order {
            assert_eq!(inner.index.get(key).map(|s| s.tick), Some(*tick));
        }
    }
}

impl<V: Clone> ExpiringCache<String, V> {
    /// Drop every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.invalidate_where(|k| k.starts_with(prefix))
    }

    /// Drop every key matching the regular expression `pattern`.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize, regex::Error> {
        let re = regex::Regex::new(pattern)?;
        Ok(self.invalidate_where(|k| re.is_match(k)))
    }
}
