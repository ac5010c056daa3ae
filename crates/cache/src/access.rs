//! Region access strategies
//!
//! The engine never touches a [`CacheRegion`] directly; every read and write
//! goes through the [`RegionAccessStrategy`] configured for the region:
//!
//! | strategy | update / remove | put-from-load |
//! |---|---|---|
//! | [`ReadOnlyAccess`] | update is an error, remove evicts | put if absent |
//! | [`NonstrictReadWriteAccess`] | evict now and after completion | unvalidated put |
//! | [`TransactionalAccess`] | invalidate until completion | validated put |
//!
//! Every strategy publishes inserted entries only once the inserting
//! transaction has committed.

use std::fmt;
use std::sync::Arc;

use dormant_core::{Error, Result, Synchronization, SynchronizationRegistry, TransactionOutcome};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::AccessType;
use crate::key::{CacheEntry, CacheKey};
use crate::owner::LockOwner;
use crate::region::CacheRegion;
use crate::validator::PutFromLoadValidator;

/// Validator guarding one region
pub type RegionValidator = PutFromLoadValidator<CacheKey>;

/// Concurrency strategy for reading and writing one region
pub trait RegionAccessStrategy: Send + Sync + fmt::Debug {
    /// Which strategy this is
    fn access_type(&self) -> AccessType;

    /// Underlying region
    fn region(&self) -> &Arc<CacheRegion>;

    /// Time source used for load timestamps
    fn clock(&self) -> &Arc<dyn Clock>;

    /// Cached entry for `key`
    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.region().get(key)
    }

    /// Called before `owner` reads `key` from the database
    fn before_load(&self, _owner: LockOwner, _key: &CacheKey, _load_started_at: u64) {}

    /// Cache a value just read from the database.
    ///
    /// With `minimal_put` nothing is written when an entry already exists.
    /// Returns whether the entry was written; a refused put is not an error.
    fn put_from_load(
        &self,
        owner: LockOwner,
        key: CacheKey,
        entry: CacheEntry,
        minimal_put: bool,
    ) -> Result<bool>;

    /// Publish a newly inserted entry once the transaction commits
    fn after_insert(
        &self,
        key: CacheKey,
        entry: CacheEntry,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        registry.register_synchronization(Box::new(PublishOnCommit {
            region: Arc::clone(self.region()),
            key,
            entry,
        }));
        Ok(())
    }

    /// The entity or collection behind `key` is being updated by `owner`
    fn update(
        &self,
        owner: LockOwner,
        key: CacheKey,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()>;

    /// The entity or collection behind `key` is being removed by `owner`
    fn remove(
        &self,
        owner: LockOwner,
        key: CacheKey,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()>;

    /// Everything in the region is being invalidated
    fn remove_all(&self, registry: &mut dyn SynchronizationRegistry) -> Result<()>;

    /// Drop the entry for `key` without transactional coordination
    fn evict(&self, key: &CacheKey) {
        self.region().evict(key);
    }

    /// Drop every entry without transactional coordination
    fn evict_all(&self) {
        self.region().evict_all();
    }
}

struct PublishOnCommit {
    region: Arc<CacheRegion>,
    key: CacheKey,
    entry: CacheEntry,
}

impl Synchronization for PublishOnCommit {
    fn after_completion(&mut self, outcome: TransactionOutcome) {
        if outcome.is_committed() {
            self.region.put(self.key.clone(), self.entry.clone());
        } else {
            trace!(target: "dormant::cache", region = %self.region.name(), key = %self.key, "Insert rolled back, not cached");
        }
    }
}

struct EvictAfterCompletion {
    region: Arc<CacheRegion>,
    key: Option<CacheKey>,
}

impl Synchronization for EvictAfterCompletion {
    fn after_completion(&mut self, _outcome: TransactionOutcome) {
        match &self.key {
            Some(key) => {
                self.region.evict(key);
            }
            None => self.region.evict_all(),
        }
    }
}

struct EndKeyInvalidation {
    validator: Arc<RegionValidator>,
    region: Arc<CacheRegion>,
    owner: LockOwner,
    key: CacheKey,
}

impl Synchronization for EndKeyInvalidation {
    fn after_completion(&mut self, outcome: TransactionOutcome) {
        self.region.evict(&self.key);
        self.validator.end_invalidating_key(self.owner, &self.key);
        trace!(target: "dormant::cache", region = %self.region.name(), key = %self.key, ?outcome, "Key invalidation ended");
    }
}

struct EndRegionInvalidation {
    validator: Arc<RegionValidator>,
    region: Arc<CacheRegion>,
}

impl Synchronization for EndRegionInvalidation {
    fn after_completion(&mut self, _outcome: TransactionOutcome) {
        self.region.evict_all();
        self.validator.end_invalidating_region();
    }
}

// ============================================================================
// Read-only
// ============================================================================

/// Strategy for data that never changes once inserted
#[derive(Debug)]
pub struct ReadOnlyAccess {
    region: Arc<CacheRegion>,
    clock: Arc<dyn Clock>,
}

impl ReadOnlyAccess {
    /// Strategy over `region`
    pub fn new(region: Arc<CacheRegion>, clock: Arc<dyn Clock>) -> Self {
        Self { region, clock }
    }
}

impl RegionAccessStrategy for ReadOnlyAccess {
    fn access_type(&self) -> AccessType {
        AccessType::ReadOnly
    }

    fn region(&self) -> &Arc<CacheRegion> {
        &self.region
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn put_from_load(
        &self,
        _owner: LockOwner,
        key: CacheKey,
        entry: CacheEntry,
        _minimal_put: bool,
    ) -> Result<bool> {
        Ok(self.region.put_if_absent(key, entry))
    }

    fn update(
        &self,
        _owner: LockOwner,
        key: CacheKey,
        _registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        Err(Error::Cache(format!(
            "can't update {} in read-only region {}",
            key,
            self.region.name()
        )))
    }

    fn remove(
        &self,
        _owner: LockOwner,
        key: CacheKey,
        _registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        self.region.evict(&key);
        Ok(())
    }

    fn remove_all(&self, _registry: &mut dyn SynchronizationRegistry) -> Result<()> {
        self.region.evict_all();
        Ok(())
    }
}

// ============================================================================
// Nonstrict read-write
// ============================================================================

/// Strategy that evicts on write and tolerates brief staleness
#[derive(Debug)]
pub struct NonstrictReadWriteAccess {
    region: Arc<CacheRegion>,
    clock: Arc<dyn Clock>,
}

impl NonstrictReadWriteAccess {
    /// Strategy over `region`
    pub fn new(region: Arc<CacheRegion>, clock: Arc<dyn Clock>) -> Self {
        Self { region, clock }
    }

    fn evict_twice(&self, key: Option<CacheKey>, registry: &mut dyn SynchronizationRegistry) {
        match &key {
            Some(key) => {
                self.region.evict(key);
            }
            None => self.region.evict_all(),
        }
        registry.register_synchronization(Box::new(EvictAfterCompletion {
            region: Arc::clone(&self.region),
            key,
        }));
    }
}

impl RegionAccessStrategy for NonstrictReadWriteAccess {
    fn access_type(&self) -> AccessType {
        AccessType::NonstrictReadWrite
    }

    fn region(&self) -> &Arc<CacheRegion> {
        &self.region
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn put_from_load(
        &self,
        _owner: LockOwner,
        key: CacheKey,
        entry: CacheEntry,
        minimal_put: bool,
    ) -> Result<bool> {
        if minimal_put {
            return Ok(self.region.put_if_absent(key, entry));
        }
        self.region.put(key, entry);
        Ok(true)
    }

    fn update(
        &self,
        _owner: LockOwner,
        key: CacheKey,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        self.evict_twice(Some(key), registry);
        Ok(())
    }

    fn remove(
        &self,
        _owner: LockOwner,
        key: CacheKey,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        self.evict_twice(Some(key), registry);
        Ok(())
    }

    fn remove_all(&self, registry: &mut dyn SynchronizationRegistry) -> Result<()> {
        self.evict_twice(None, registry);
        Ok(())
    }
}

// ============================================================================
// Transactional
// ============================================================================

/// Strategy that validates every put-from-load against concurrent writes
#[derive(Debug)]
pub struct TransactionalAccess {
    region: Arc<CacheRegion>,
    validator: Arc<RegionValidator>,
    clock: Arc<dyn Clock>,
}

impl TransactionalAccess {
    /// Strategy over `region` guarded by `validator`
    pub fn new(region: Arc<CacheRegion>, validator: Arc<RegionValidator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            region,
            validator,
            clock,
        }
    }

    /// Validator guarding the region
    pub fn validator(&self) -> &Arc<RegionValidator> {
        &self.validator
    }

    fn invalidate(
        &self,
        owner: LockOwner,
        key: CacheKey,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        if !self.validator.begin_invalidating_key(owner, &key) {
            return Err(Error::Cache(format!(
                "timed out invalidating {} in region {}",
                key,
                self.region.name()
            )));
        }
        self.region.evict(&key);
        registry.register_synchronization(Box::new(EndKeyInvalidation {
            validator: Arc::clone(&self.validator),
            region: Arc::clone(&self.region),
            owner,
            key,
        }));
        Ok(())
    }
}

impl RegionAccessStrategy for TransactionalAccess {
    fn access_type(&self) -> AccessType {
        AccessType::Transactional
    }

    fn region(&self) -> &Arc<CacheRegion> {
        &self.region
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn before_load(&self, owner: LockOwner, key: &CacheKey, load_started_at: u64) {
        self.validator.register_pending_put(owner, key, load_started_at);
    }

    fn put_from_load(
        &self,
        owner: LockOwner,
        key: CacheKey,
        entry: CacheEntry,
        minimal_put: bool,
    ) -> Result<bool> {
        // The lock is taken even for a minimal put that turns out to be
        // redundant: acquiring it consumes the owner's pending put.
        match self.validator.acquire_put_from_load_lock(owner, &key) {
            Some(_lock) if minimal_put && self.region.contains(&key) => Ok(false),
            Some(_lock) => {
                self.region.put(key, entry);
                Ok(true)
            }
            None => {
                debug!(target: "dormant::cache", region = %self.region.name(), %key, %owner, "Stale put-from-load dropped");
                Ok(false)
            }
        }
    }

    fn update(
        &self,
        owner: LockOwner,
        key: CacheKey,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        self.invalidate(owner, key, registry)
    }

    fn remove(
        &self,
        owner: LockOwner,
        key: CacheKey,
        registry: &mut dyn SynchronizationRegistry,
    ) -> Result<()> {
        self.invalidate(owner, key, registry)
    }

    fn remove_all(&self, registry: &mut dyn SynchronizationRegistry) -> Result<()> {
        let drained = self.validator.begin_invalidating_region();
        self.region.evict_all();
        registry.register_synchronization(Box::new(EndRegionInvalidation {
            validator: Arc::clone(&self.validator),
            region: Arc::clone(&self.region),
        }));
        if drained {
            Ok(())
        } else {
            Err(Error::Cache(format!(
                "timed out invalidating region {}",
                self.region.name()
            )))
        }
    }

    fn evict(&self, key: &CacheKey) {
        self.validator.key_removed(key);
        self.region.evict(key);
    }

    fn evict_all(&self) {
        self.validator.region_removed();
        self.region.evict_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ValidatorSettings;
    use crate::validator::PutState;
    use dormant_core::{EntityKey, Identifier, Row, TxId};

    type Syncs = Vec<Box<dyn Synchronization>>;

    fn key(id: i64) -> CacheKey {
        EntityKey::new("Item", Identifier::Int(id)).into()
    }

    fn entry() -> CacheEntry {
        CacheEntry::Entity(Row::new(Vec::new(), None))
    }

    fn tx(n: u64) -> LockOwner {
        LockOwner::Transaction(TxId::new(n))
    }

    fn complete(syncs: Syncs, outcome: TransactionOutcome) {
        for mut sync in syncs {
            sync.after_completion(outcome);
        }
    }

    fn transactional() -> (TransactionalAccess, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let region = Arc::new(CacheRegion::new("items"));
        let validator = Arc::new(RegionValidator::new(
            "items",
            ValidatorSettings::default(),
            clock.clone(),
        ));
        (TransactionalAccess::new(region, validator, clock.clone()), clock)
    }

    #[test]
    fn test_insert_published_only_on_commit() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let access = NonstrictReadWriteAccess::new(Arc::new(CacheRegion::new("items")), clock);

        let mut syncs: Syncs = Vec::new();
        access.after_insert(key(1), entry(), &mut syncs).unwrap();
        assert!(!access.region().contains(&key(1)));
        complete(syncs, TransactionOutcome::RolledBack);
        assert!(!access.region().contains(&key(1)));

        let mut syncs: Syncs = Vec::new();
        access.after_insert(key(1), entry(), &mut syncs).unwrap();
        complete(syncs, TransactionOutcome::Committed);
        assert!(access.region().contains(&key(1)));
    }

    #[test]
    fn test_read_only_rejects_updates() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let access = ReadOnlyAccess::new(Arc::new(CacheRegion::new("countries")), clock);
        let mut syncs: Syncs = Vec::new();
        let err = access.update(tx(1), key(1), &mut syncs).unwrap_err();
        assert!(matches!(err, Error::Cache(_)));

        access.put_from_load(tx(1), key(1), entry(), false).unwrap();
        access.remove(tx(1), key(1), &mut syncs).unwrap();
        assert!(access.get(&key(1)).is_none());
    }

    #[test]
    fn test_nonstrict_evicts_again_after_completion() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let access = NonstrictReadWriteAccess::new(Arc::new(CacheRegion::new("items")), clock);
        access.put_from_load(tx(1), key(1), entry(), false).unwrap();

        let mut syncs: Syncs = Vec::new();
        access.update(tx(2), key(1), &mut syncs).unwrap();
        assert!(!access.region().contains(&key(1)));

        // A concurrent reader repopulates before the writer commits
        access.put_from_load(tx(3), key(1), entry(), false).unwrap();
        complete(syncs, TransactionOutcome::Committed);
        assert!(!access.region().contains(&key(1)));
    }

    #[test]
    fn test_transactional_refuses_put_during_update() {
        let (access, clock) = transactional();
        let mut syncs: Syncs = Vec::new();
        access.update(tx(1), key(1), &mut syncs).unwrap();

        clock.advance(1);
        access.before_load(tx(2), &key(1), clock.now_millis());
        assert!(!access.put_from_load(tx(2), key(1), entry(), false).unwrap());

        complete(syncs, TransactionOutcome::Committed);
        clock.advance(1);
        access.before_load(tx(3), &key(1), clock.now_millis());
        assert!(access.put_from_load(tx(3), key(1), entry(), false).unwrap());
    }

    #[test]
    fn test_transactional_minimal_put_skips_existing() {
        let (access, clock) = transactional();
        access.before_load(tx(1), &key(1), clock.now_millis());
        assert!(access.put_from_load(tx(1), key(1), entry(), true).unwrap());
        access.before_load(tx(2), &key(1), clock.now_millis());
        assert!(matches!(
            access.validator().state_of(&key(1)),
            PutState::PendingPut { owners: 1, .. }
        ));
        assert!(!access.put_from_load(tx(2), key(1), entry(), true).unwrap());

        // The skipped put does not linger as pending
        assert_eq!(access.validator().state_of(&key(1)), PutState::NakedPut);
        assert_eq!(access.validator().tracked_keys(), 0);
    }

    #[test]
    fn test_transactional_remove_all_blocks_region() {
        let (access, clock) = transactional();
        let mut syncs: Syncs = Vec::new();
        access.remove_all(&mut syncs).unwrap();
        access.before_load(tx(2), &key(7), clock.now_millis());
        assert!(!access.put_from_load(tx(2), key(7), entry(), false).unwrap());
        complete(syncs, TransactionOutcome::RolledBack);

        clock.advance(1);
        access.before_load(tx(3), &key(7), clock.now_millis());
        assert!(access.put_from_load(tx(3), key(7), entry(), false).unwrap());
    }
}
