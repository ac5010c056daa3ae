//! Session factory statistics
//!
//! One [`Statistics`] instance is shared by every session of a factory.
//!
//! # Memory Ordering
//!
//! The counters use Relaxed ordering: they are observational only and do
//! not synchronize any other memory operation, so a snapshot taken while
//! sessions are running is approximate.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($( $(#[$doc:meta])* $field:ident => $record:ident ),+ $(,)?) => {
        /// Counters shared by the sessions of one factory
        #[derive(Debug, Default)]
        pub struct Statistics {
            $( $field: AtomicU64, )+
        }

        /// Point-in-time copy of [`Statistics`]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct StatisticsSnapshot {
            $( $(#[$doc])* pub $field: u64, )+
        }

        impl Statistics {
            $(
                pub(crate) fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )+

            /// Current values
            pub fn snapshot(&self) -> StatisticsSnapshot {
                StatisticsSnapshot {
                    $( $field: self.$field.load(Ordering::Relaxed), )+
                }
            }
        }
    };
}

counters! {
    /// Sessions opened
    sessions_opened => record_session_opened,
    /// Sessions closed
    sessions_closed => record_session_closed,
    /// Transactions started
    transactions => record_transaction,
    /// Transactions committed
    commits => record_commit,
    /// Transactions rolled back
    rollbacks => record_rollback,
    /// Flushes executed
    flushes => record_flush,
    /// Entity rows inserted
    entity_inserts => record_entity_insert,
    /// Entity rows updated
    entity_updates => record_entity_update,
    /// Entity rows deleted
    entity_deletes => record_entity_delete,
    /// Entities hydrated from the cache or the store
    entity_loads => record_entity_load,
    /// Entity rows read from the store
    entity_fetches => record_entity_fetch,
    /// Collections written for the first time
    collection_recreates => record_collection_recreate,
    /// Collections rewritten
    collection_updates => record_collection_update,
    /// Collections deleted
    collection_removes => record_collection_remove,
    /// Collections hydrated
    collection_loads => record_collection_load,
    /// Updates or deletes that found a different version
    optimistic_failures => record_optimistic_failure,
    /// Second-level cache lookups that found an entry
    cache_hits => record_cache_hit,
    /// Second-level cache lookups that found nothing
    cache_misses => record_cache_miss,
    /// Entries written to the second-level cache after a load
    cache_puts => record_cache_put,
    /// Puts refused by the put-from-load validator
    stale_puts => record_stale_put,
    /// Natural-id lookups answered by the natural-id cache region
    natural_id_cache_hits => record_natural_id_cache_hit,
    /// Natural-id lookups the natural-id cache region could not answer
    natural_id_cache_misses => record_natural_id_cache_miss,
    /// Natural-id resolutions written to the cache after a store query
    natural_id_cache_puts => record_natural_id_cache_put,
    /// Natural ids resolved by querying the store
    natural_id_queries => record_natural_id_query,
}

impl StatisticsSnapshot {
    /// Share of cache lookups that hit, `None` before the first lookup
    pub fn cache_hit_ratio(&self) -> Option<f64> {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            None
        } else {
            Some(self.cache_hits as f64 / lookups as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let stats = Statistics::default();
        stats.record_flush();
        stats.record_flush();
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_stale_put();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.flushes, 2);
        assert_eq!(snapshot.stale_puts, 1);
        assert_eq!(snapshot.cache_hit_ratio(), Some(0.5));
        assert_eq!(snapshot.commits, 0);
    }

    #[test]
    fn test_hit_ratio_without_lookups() {
        assert_eq!(StatisticsSnapshot::default().cache_hit_ratio(), None);
    }
}
