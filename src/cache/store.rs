//! Per-node response store.
//!
//! Entries expire lazily: an expired entry is removed by the lookup that finds
//! it, and by the optional background sweep. Capacity is bounded by LRU.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

use super::config::{CacheConfig, ClassTtls};
use super::keys::{CacheKey, ContentClass};
use super::lock::MutexExt;

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "cachegate_cache_hit_total";
const METRIC_CACHE_MISS: &str = "cachegate_cache_miss_total";
const METRIC_CACHE_EVICT: &str = "cachegate_cache_evict_total";
const METRIC_CACHE_EXPIRED: &str = "cachegate_cache_expired_total";

/// Tags attached to an entry and evaluated by ban predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata(BTreeMap<String, String>);

impl EntryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.0.get(tag).map(String::as_str)
    }

    pub fn insert(&mut self, tag: impl Into<String>, value: impl Into<String>) {
        self.0.insert(tag.into(), value.into());
    }

    pub fn with(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(tag, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EntryMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Origin response as captured on a miss.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// One cached request variant.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: StoredResponse,
    pub class: ContentClass,
    pub created_at: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.created_at))
    }
}

/// Snapshot returned by a successful lookup, taken after the hit was counted.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub remaining: Duration,
}

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct StoreInner {
    entries: LruCache<CacheKey, CacheEntry>,
    by_path: HashMap<String, HashSet<CacheKey>>,
    /// Sorted header names origin `Vary` responses added per path.
    vary_by_path: HashMap<String, Vec<String>>,
}

impl StoreInner {
    fn unindex(&mut self, key: &CacheKey) {
        if let Some(keys) = self.by_path.get_mut(key.path()) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_path.remove(key.path());
                self.vary_by_path.remove(key.path());
            }
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.pop(key);
        if removed.is_some() {
            self.unindex(key);
        }
        removed
    }

    fn remove_matching(&mut self, mut predicate: impl FnMut(&CacheEntry) -> bool) -> usize {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }
}

/// Key → entry table owned by exactly one node.
///
/// Every operation takes the store lock, so the expiry check and the hit-count
/// increment of a lookup are one step for concurrent callers.
pub struct CacheStore {
    ttl: ClassTtls,
    inner: Mutex<StoreInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Create an empty store with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl,
            inner: Mutex::new(StoreInner {
                entries: LruCache::new(config.max_entries_non_zero()),
                by_path: HashMap::new(),
                vary_by_path: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a key, counting the hit.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        let now = Instant::now();
        let mut inner = self.inner.lock_recovered(SOURCE, "lookup");

        let expired = match inner.entries.get_mut(key) {
            None => false,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.hit_count += 1;
                let hit = CacheHit {
                    remaining: entry.remaining(now),
                    entry: entry.clone(),
                };
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_HIT, "class" => hit.entry.class.as_str()).increment(1);
                return Some(hit);
            }
        };

        if expired {
            inner.remove(key);
            drop(inner);
            debug!(key = %key, "expired entry evicted on lookup");
            counter!(METRIC_CACHE_EXPIRED).increment(1);
        } else {
            drop(inner);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_MISS).increment(1);
        None
    }

    /// Store a fresh entry with `hit_count = 0` and the TTL of its class.
    ///
    /// Replaces any existing entry for the key. Returns the key evicted to
    /// make room, if any.
    pub fn insert(
        &self,
        key: CacheKey,
        response: StoredResponse,
        class: ContentClass,
        metadata: EntryMetadata,
    ) -> Option<CacheKey> {
        let entry = CacheEntry {
            key: key.clone(),
            response,
            class,
            created_at: Instant::now(),
            ttl: self.ttl.for_class(class),
            hit_count: 0,
            metadata,
        };

        let mut inner = self.inner.lock_recovered(SOURCE, "insert");
        inner
            .by_path
            .entry(key.path().to_string())
            .or_default()
            .insert(key.clone());

        let evicted = match inner.entries.push(key.clone(), entry) {
            Some((evicted_key, _)) if evicted_key != key => {
                inner.unindex(&evicted_key);
                Some(evicted_key)
            }
            _ => None,
        };
        drop(inner);

        if let Some(evicted_key) = &evicted {
            debug!(key = %evicted_key, "entry evicted for capacity");
            counter!(METRIC_CACHE_EVICT).increment(1);
        }
        evicted
    }

    /// Remove one key. Returns whether it was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner
            .lock_recovered(SOURCE, "remove")
            .remove(key)
            .is_some()
    }

    /// Remove every vary variant stored under a normalized path.
    pub fn remove_path(&self, path: &str) -> usize {
        let mut inner = self.inner.lock_recovered(SOURCE, "remove_path");
        inner.vary_by_path.remove(path);
        let Some(keys) = inner.by_path.remove(path) else {
            return 0;
        };
        keys.iter()
            .filter(|key| inner.entries.pop(*key).is_some())
            .count()
    }

    /// Remove every entry the predicate selects.
    pub fn remove_where(&self, predicate: impl FnMut(&CacheEntry) -> bool) -> usize {
        self.inner
            .lock_recovered(SOURCE, "remove_where")
            .remove_matching(predicate)
    }

    /// Drop expired entries without waiting for a lookup to find them.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.remove_where(|entry| entry.is_expired(now));
        if removed > 0 {
            counter!(METRIC_CACHE_EXPIRED).increment(removed as u64);
        }
        removed
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock_recovered(SOURCE, "flush");
        let count = inner.entries.len();
        inner.entries.clear();
        inner.by_path.clear();
        inner.vary_by_path.clear();
        count
    }

    /// Extra vary header names learned for a path, sorted.
    pub fn learned_vary(&self, path: &str) -> Vec<String> {
        self.inner
            .lock_recovered(SOURCE, "learned_vary")
            .vary_by_path
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Merge header names into those learned for a path and return the full
    /// sorted list.
    ///
    /// The names are forgotten once no entry for the path remains.
    pub fn learn_vary(&self, path: &str, names: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock_recovered(SOURCE, "learn_vary");
        if names.is_empty() {
            return inner.vary_by_path.get(path).cloned().unwrap_or_default();
        }
        let learned = inner.vary_by_path.entry(path.to_string()).or_default();
        for name in names {
            if !learned.contains(name) {
                learned.push(name.clone());
            }
        }
        learned.sort();
        learned.clone()
    }

    /// Get the number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock_recovered(SOURCE, "len").entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
