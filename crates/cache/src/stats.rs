//! Cache statistics
//!
//! Counters use Relaxed ordering: they are observational only and do not
//! synchronize any other memory operation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one cache region
#[derive(Debug, Default)]
pub struct RegionStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of [`RegionStatistics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionStatisticsSnapshot {
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries written
    pub puts: u64,
    /// Entries evicted
    pub evictions: u64,
}

impl RegionStatistics {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> RegionStatisticsSnapshot {
        RegionStatisticsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one put-from-load validator
#[derive(Debug, Default)]
pub struct ValidatorStatistics {
    registered: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    invalidations: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of [`ValidatorStatistics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidatorStatisticsSnapshot {
    /// Pending puts registered
    pub registered: u64,
    /// Put-from-load locks granted
    pub accepted: u64,
    /// Put-from-load attempts refused as stale or contended
    pub rejected: u64,
    /// Key and region invalidations started
    pub invalidations: u64,
    /// Pending puts discarded by housekeeping
    pub discarded: u64,
}

impl ValidatorStatistics {
    pub(crate) fn record_registered(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> ValidatorStatisticsSnapshot {
        ValidatorStatisticsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
