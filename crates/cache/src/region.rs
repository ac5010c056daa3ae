//! Cache regions
//!
//! A region is a named concurrent map from [`CacheKey`] to [`CacheEntry`].
//! Regions hold no eviction policy of their own; entries leave only through
//! explicit eviction by the access strategies.

use dashmap::DashMap;
use tracing::trace;

use crate::key::{CacheEntry, CacheKey};
use crate::stats::{RegionStatistics, RegionStatisticsSnapshot};

/// Named in-memory cache region
#[derive(Debug)]
pub struct CacheRegion {
    name: String,
    entries: DashMap<CacheKey, CacheEntry>,
    stats: RegionStatistics,
}

impl CacheRegion {
    /// Empty region
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            stats: RegionStatistics::default(),
        }
    }

    /// Region name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the entry for `key`
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.record_hit();
                Some(entry.value().clone())
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Whether an entry exists, without touching hit/miss counters
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Store `entry`, replacing any existing one
    pub fn put(&self, key: CacheKey, entry: CacheEntry) {
        trace!(target: "dormant::cache", region = %self.name, %key, "Put");
        self.entries.insert(key, entry);
        self.stats.record_put();
    }

    /// Store `entry` only if the key has none. Returns whether it was stored.
    pub fn put_if_absent(&self, key: CacheKey, entry: CacheEntry) -> bool {
        let mut stored = false;
        self.entries.entry(key).or_insert_with(|| {
            stored = true;
            entry
        });
        if stored {
            self.stats.record_put();
        }
        stored
    }

    /// Drop the entry for `key`
    pub fn evict(&self, key: &CacheKey) -> bool {
        let evicted = self.entries.remove(key).is_some();
        if evicted {
            trace!(target: "dormant::cache", region = %self.name, %key, "Evicted");
            self.stats.record_evictions(1);
        }
        evicted
    }

    /// Drop every entry
    pub fn evict_all(&self) {
        let count = self.entries.len() as u64;
        self.entries.clear();
        self.stats.record_evictions(count);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters
    pub fn statistics(&self) -> RegionStatisticsSnapshot {
        self.stats.snapshot()
    }
}
