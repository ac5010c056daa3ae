//! Put-from-load validation
//!
//! A cache entry populated from a database read ("put-from-load") is only
//! safe if nothing invalidated the key between the moment the read began and
//! the moment the entry is written. [`PutFromLoadValidator`] tracks exactly
//! that, per key and per region.
//!
//! # Protocol
//!
//! ```text
//! reader                                   writer
//! ------                                   ------
//! register_pending_put(owner, k, t0)
//! row = load(k)                            begin_invalidating_key(owner, k)
//! lock = acquire_put_from_load_lock(k)     write row, evict k
//!   Some(lock) => cache.put(k, row)        ... commit or rollback ...
//!   None       => drop the row             end_invalidating_key(owner, k)
//! drop(lock)
//! ```
//!
//! A registered put is granted only if:
//! - it was not completed by an invalidation in the meantime
//! - no invalidation of the key or region is in progress
//! - its load started strictly after the last key and region invalidation
//!
//! An unregistered ("naked") put is granted only if no invalidation is in
//! progress and the naked-put blocking window opened by the last key and
//! region invalidation has passed.
//!
//! # Locking
//!
//! Each key has a record guarded by its own mutex and condition variable;
//! records live in a `DashMap`. A map reference is never held while a record
//! mutex is taken, and a record is only unlinked from the map while its mutex
//! is held, so the lock order is record, then map shard. A thread that finds
//! an unlinked record retries on a fresh one. Threads waiting on a record's
//! condition variable keep it from being unlinked.
//!
//! # Housekeeping
//!
//! Pending puts whose owner never comes back (an aborted load, a crashed
//! transaction) would otherwise stay forever. Every registration is queued;
//! queued entries older than `pending_put_overage_period` move to an overage
//! queue, and overage entries older than `max_pending_put_delay` are
//! discarded. Invalidated keys are queued until their blocking window
//! expires and then unlinked if idle.

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::ValidatorSettings;
use crate::owner::LockOwner;
use crate::stats::{ValidatorStatistics, ValidatorStatisticsSnapshot};

/// Bounds required of keys tracked by a validator
pub trait ValidatorKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> ValidatorKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Externally visible state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutState {
    /// Nothing registered and nothing invalidated: an unregistered put would
    /// be granted
    NakedPut,
    /// At least one load registered a pending put
    PendingPut {
        /// Registration time of the oldest pending put
        registered_at: u64,
        /// Number of owners with a pending put
        owners: usize,
    },
    /// Puts are currently refused
    Invalid {
        /// When the invalidation started or happened
        since: u64,
        /// End of the naked-put blocking window, `None` while the
        /// invalidation is still in progress
        until: Option<u64>,
    },
}

#[derive(Debug)]
struct PendingPut {
    owner: LockOwner,
    load_started_at: u64,
    registered_at: u64,
    completed: AtomicBool,
}

impl PendingPut {
    fn new(owner: LockOwner, load_started_at: u64, registered_at: u64) -> Self {
        Self {
            owner,
            load_started_at,
            registered_at,
            completed: AtomicBool::new(false),
        }
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
enum Invalidation {
    None,
    InProgress {
        owners: SmallVec<[LockOwner; 2]>,
        started_at: u64,
    },
    Recent {
        at: u64,
        naked_puts_blocked_until: u64,
    },
}

#[derive(Debug)]
struct KeyState {
    pending: SmallVec<[Arc<PendingPut>; 2]>,
    invalidation: Invalidation,
    putting: Option<LockOwner>,
    waiters: usize,
    unlinked: bool,
}

impl KeyState {
    fn new() -> Self {
        Self {
            pending: SmallVec::new(),
            invalidation: Invalidation::None,
            putting: None,
            waiters: 0,
            unlinked: false,
        }
    }

    fn is_idle(&self, now: u64) -> bool {
        self.putting.is_none()
            && self.waiters == 0
            && self.pending.iter().all(|p| p.is_completed())
            && match self.invalidation {
                Invalidation::None => true,
                Invalidation::InProgress { .. } => false,
                Invalidation::Recent {
                    naked_puts_blocked_until,
                    ..
                } => now > naked_puts_blocked_until,
            }
    }

    fn complete_all(&mut self) {
        for pending in self.pending.drain(..) {
            pending.complete();
        }
    }

    fn take_pending(&mut self, owner: LockOwner) -> Option<Arc<PendingPut>> {
        let position = self.pending.iter().position(|p| p.owner == owner)?;
        Some(self.pending.remove(position))
    }

    fn accepts_load_started_at(&self, load_started_at: u64) -> bool {
        match &self.invalidation {
            Invalidation::None => true,
            Invalidation::InProgress { .. } => false,
            Invalidation::Recent { at, .. } => load_started_at > *at,
        }
    }

    fn accepts_naked_put(&self, now: u64) -> bool {
        match &self.invalidation {
            Invalidation::None => true,
            Invalidation::InProgress { .. } => false,
            Invalidation::Recent {
                naked_puts_blocked_until,
                ..
            } => now > *naked_puts_blocked_until,
        }
    }
}

#[derive(Debug)]
struct KeyRecord {
    state: Mutex<KeyState>,
    released: Condvar,
}

impl KeyRecord {
    fn new() -> Self {
        Self {
            state: Mutex::new(KeyState::new()),
            released: Condvar::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RegionState {
    invalidations_in_progress: usize,
    invalidation_started_at: Option<u64>,
    invalidated_at: Option<u64>,
    naked_puts_blocked_until: Option<u64>,
}

impl RegionState {
    fn accepts_load_started_at(&self, load_started_at: u64) -> bool {
        self.invalidations_in_progress == 0
            && self.invalidated_at.map_or(true, |at| load_started_at > at)
    }

    fn accepts_naked_put(&self, now: u64) -> bool {
        self.invalidations_in_progress == 0
            && self.naked_puts_blocked_until.map_or(true, |until| now > until)
    }
}

#[derive(Debug)]
struct QueuedPut<K> {
    key: K,
    ticket: Weak<PendingPut>,
}

#[derive(Debug)]
struct Queues<K> {
    pending: VecDeque<QueuedPut<K>>,
    overage: VecDeque<QueuedPut<K>>,
}

#[derive(Debug)]
struct QueuedRemoval<K> {
    key: K,
    expires_at: u64,
}

#[derive(Debug, Clone, Copy)]
enum Rejection {
    Contended,
    Stale,
}

/// Guards cache consistency against stale put-from-load races
///
/// One validator exists per cache region. It is `Send + Sync` and shared by
/// every session through `Arc`.
pub struct PutFromLoadValidator<K: ValidatorKey> {
    region: String,
    settings: ValidatorSettings,
    clock: Arc<dyn Clock>,
    records: DashMap<K, Arc<KeyRecord>>,
    region_state: Mutex<RegionState>,
    queues: Mutex<Queues<K>>,
    removals: Mutex<VecDeque<QueuedRemoval<K>>>,
    stats: ValidatorStatistics,
}

impl<K: ValidatorKey> fmt::Debug for PutFromLoadValidator<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutFromLoadValidator")
            .field("region", &self.region)
            .field("tracked_keys", &self.records.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl<K: ValidatorKey> PutFromLoadValidator<K> {
    /// Create a validator for `region`
    pub fn new(region: impl Into<String>, settings: ValidatorSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            region: region.into(),
            settings,
            clock,
            records: DashMap::new(),
            region_state: Mutex::new(RegionState::default()),
            queues: Mutex::new(Queues {
                pending: VecDeque::new(),
                overage: VecDeque::new(),
            }),
            removals: Mutex::new(VecDeque::new()),
            stats: ValidatorStatistics::default(),
        }
    }

    /// Region this validator guards
    pub fn region_name(&self) -> &str {
        &self.region
    }

    /// Timing settings
    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    /// Current time according to the validator's clock
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Record that `owner` is about to load `key` from the database.
    ///
    /// `load_started_at` is the time the load (or its transaction) began.
    /// Returns `false` if an invalidation of the key is in progress, in which
    /// case nothing is registered and the later put will be refused.
    pub fn register_pending_put(&self, owner: LockOwner, key: &K, load_started_at: u64) -> bool {
        let now = self.now();
        let ticket = self
            .with_live_record(key, true, |_, state| {
                if let Invalidation::InProgress { .. } = state.invalidation {
                    return None;
                }
                let ticket = Arc::new(PendingPut::new(owner, load_started_at, now));
                match state.pending.iter_mut().find(|p| p.owner == owner) {
                    Some(existing) => {
                        existing.complete();
                        *existing = Arc::clone(&ticket);
                    }
                    None => state.pending.push(Arc::clone(&ticket)),
                }
                Some(ticket)
            })
            .flatten();

        match ticket {
            Some(ticket) => {
                self.stats.record_registered();
                self.queues.lock().pending.push_back(QueuedPut {
                    key: key.clone(),
                    ticket: Arc::downgrade(&ticket),
                });
                trace!(target: "dormant::cache", region = %self.region, ?key, %owner, "Registered pending put");
                true
            }
            None => {
                trace!(target: "dormant::cache", region = %self.region, ?key, %owner, "Invalidation in progress, pending put not registered");
                false
            }
        }
    }

    /// Ask permission to put a freshly loaded value for `key`.
    ///
    /// Returns a guard if the put is valid; the caller writes the cache
    /// while holding it. `None` means the loaded value may be stale and must
    /// be dropped. Either way the owner's pending put is consumed.
    pub fn acquire_put_from_load_lock(&self, owner: LockOwner, key: &K) -> Option<PutFromLoadLock<'_, K>> {
        let now = self.now();
        self.clean_outdated_pending_puts(now);
        let timeout = self.settings.put_lock_timeout();

        let outcome = self.with_live_record(key, true, |record, state| {
            if state.putting.is_some() && !Self::await_put_completion(record, state, timeout) {
                return Err(Rejection::Contended);
            }

            let region = *self.region_state.lock();
            let pending = state.take_pending(owner);
            let valid = match &pending {
                Some(p) => {
                    !p.is_completed()
                        && region.accepts_load_started_at(p.load_started_at)
                        && state.accepts_load_started_at(p.load_started_at)
                }
                None => region.accepts_naked_put(now) && state.accepts_naked_put(now),
            };
            if let Some(p) = pending {
                p.complete();
            }
            if !valid {
                self.unlink_if_idle(key, record, state, now);
                return Err(Rejection::Stale);
            }
            state.putting = Some(owner);
            Ok(Arc::clone(record))
        });

        match outcome {
            Some(Ok(record)) => {
                self.stats.record_accepted();
                trace!(target: "dormant::cache", region = %self.region, ?key, %owner, "Put-from-load granted");
                Some(PutFromLoadLock {
                    validator: self,
                    key: key.clone(),
                    record,
                    owner,
                })
            }
            Some(Err(reason)) => {
                self.stats.record_rejected();
                debug!(target: "dormant::cache", region = %self.region, ?key, %owner, ?reason, "Put-from-load refused");
                None
            }
            None => None,
        }
    }

    /// Invalidate `key` outside of any transaction.
    ///
    /// Waits for an in-flight put on the key to finish, then refuses every
    /// pending put and blocks naked puts for the configured period. Returns
    /// `false` if the in-flight put did not finish within the invalidation
    /// timeout.
    pub fn key_removed(&self, key: &K) -> bool {
        let now = self.now();
        let until = now.saturating_add(self.settings.naked_put_invalidation_period_ms);
        let timeout = self.settings.invalidation_lock_timeout();

        let invalidated = self
            .with_live_record(key, true, |record, state| {
                if !Self::await_put_completion(record, state, timeout) {
                    return false;
                }
                state.complete_all();
                if !matches!(state.invalidation, Invalidation::InProgress { .. }) {
                    state.invalidation = Invalidation::Recent {
                        at: now,
                        naked_puts_blocked_until: until,
                    };
                }
                true
            })
            .unwrap_or(false);

        if invalidated {
            self.stats.record_invalidation();
            self.queue_removal(key, until, now);
            trace!(target: "dormant::cache", region = %self.region, ?key, "Key invalidated");
        } else {
            warn!(target: "dormant::cache", region = %self.region, ?key, "Timed out waiting for in-flight put-from-load");
        }
        invalidated
    }

    /// Start a transactional invalidation of `key` owned by `owner`.
    ///
    /// Until [`end_invalidating_key`](Self::end_invalidating_key) is called
    /// by the same owner every put for the key is refused. Returns `false` if
    /// an in-flight put did not finish within the invalidation timeout.
    pub fn begin_invalidating_key(&self, owner: LockOwner, key: &K) -> bool {
        let now = self.now();
        let timeout = self.settings.invalidation_lock_timeout();

        let started = self
            .with_live_record(key, true, |record, state| {
                if !Self::await_put_completion(record, state, timeout) {
                    return false;
                }
                state.complete_all();
                match &mut state.invalidation {
                    Invalidation::InProgress { owners, .. } => {
                        if !owners.contains(&owner) {
                            owners.push(owner);
                        }
                    }
                    other => {
                        *other = Invalidation::InProgress {
                            owners: smallvec![owner],
                            started_at: now,
                        }
                    }
                }
                true
            })
            .unwrap_or(false);

        if started {
            self.stats.record_invalidation();
            trace!(target: "dormant::cache", region = %self.region, ?key, %owner, "Began invalidating key");
        } else {
            warn!(target: "dormant::cache", region = %self.region, ?key, %owner, "Timed out waiting for in-flight put-from-load");
        }
        started
    }

    /// End `owner`'s invalidation of `key`.
    ///
    /// Once the last invalidating owner ends, loads that began before this
    /// moment can no longer put, and naked puts stay blocked for the
    /// configured period. Returns `true` if `owner` was invalidating the key.
    pub fn end_invalidating_key(&self, owner: LockOwner, key: &K) -> bool {
        let now = self.now();
        let until = now.saturating_add(self.settings.naked_put_invalidation_period_ms);

        let outcome = self
            .with_live_record(key, false, |_, state| {
                let remaining = match &mut state.invalidation {
                    Invalidation::InProgress { owners, .. } if owners.contains(&owner) => {
                        owners.retain(|o| *o != owner);
                        Some(owners.len())
                    }
                    _ => None,
                };
                if remaining == Some(0) {
                    state.complete_all();
                    state.invalidation = Invalidation::Recent {
                        at: now,
                        naked_puts_blocked_until: until,
                    };
                }
                remaining
            })
            .flatten();

        match outcome {
            Some(0) => {
                self.queue_removal(key, until, now);
                trace!(target: "dormant::cache", region = %self.region, ?key, %owner, "Ended invalidating key");
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Invalidate the whole region outside of any transaction
    pub fn region_removed(&self) -> bool {
        let drained = self.begin_invalidating_region();
        self.end_invalidating_region();
        drained
    }

    /// Start a region-wide invalidation.
    ///
    /// Every put is refused until the matching
    /// [`end_invalidating_region`](Self::end_invalidating_region). Returns
    /// `false` if some in-flight put did not finish within the invalidation
    /// timeout.
    pub fn begin_invalidating_region(&self) -> bool {
        let now = self.now();
        {
            let mut region = self.region_state.lock();
            if region.invalidations_in_progress == 0 {
                region.invalidation_started_at = Some(now);
            }
            region.invalidations_in_progress += 1;
        }

        let records: Vec<Arc<KeyRecord>> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let timeout = self.settings.invalidation_lock_timeout();
        let mut drained = true;
        for record in records {
            let mut state = record.state.lock();
            if !Self::await_put_completion(&record, &mut state, timeout) {
                drained = false;
                continue;
            }
            state.complete_all();
        }
        {
            let mut queues = self.queues.lock();
            queues.pending.clear();
            queues.overage.clear();
        }

        self.stats.record_invalidation();
        if drained {
            debug!(target: "dormant::cache", region = %self.region, "Began invalidating region");
        } else {
            warn!(target: "dormant::cache", region = %self.region, "Region invalidation timed out waiting for in-flight puts");
        }
        drained
    }

    /// End a region-wide invalidation
    pub fn end_invalidating_region(&self) {
        let now = self.now();
        let mut region = self.region_state.lock();
        region.invalidations_in_progress = region.invalidations_in_progress.saturating_sub(1);
        region.invalidated_at = Some(now);
        region.naked_puts_blocked_until =
            Some(now.saturating_add(self.settings.naked_put_invalidation_period_ms));
        if region.invalidations_in_progress == 0 {
            region.invalidation_started_at = None;
        }
        debug!(target: "dormant::cache", region = %self.region, "Ended invalidating region");
    }

    /// State of `key` as seen by a put arriving now
    pub fn state_of(&self, key: &K) -> PutState {
        let now = self.now();
        let region = *self.region_state.lock();
        if region.invalidations_in_progress > 0 {
            return PutState::Invalid {
                since: region.invalidation_started_at.unwrap_or(now),
                until: None,
            };
        }
        if let Some(until) = region.naked_puts_blocked_until.filter(|until| now <= *until) {
            return PutState::Invalid {
                since: region.invalidated_at.unwrap_or(now),
                until: Some(until),
            };
        }

        let Some(record) = self.existing_record(key) else {
            return PutState::NakedPut;
        };
        let state = record.state.lock();
        match &state.invalidation {
            Invalidation::InProgress { started_at, .. } => PutState::Invalid {
                since: *started_at,
                until: None,
            },
            Invalidation::Recent {
                at,
                naked_puts_blocked_until,
            } if now <= *naked_puts_blocked_until => PutState::Invalid {
                since: *at,
                until: Some(*naked_puts_blocked_until),
            },
            _ => {
                let live = state.pending.iter().filter(|p| !p.is_completed());
                let (owners, oldest) = live.fold((0, u64::MAX), |(n, oldest), p| {
                    (n + 1, oldest.min(p.registered_at))
                });
                if owners == 0 {
                    PutState::NakedPut
                } else {
                    PutState::PendingPut {
                        registered_at: oldest,
                        owners,
                    }
                }
            }
        }
    }

    /// Number of keys with a live record
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// Entries in the pending and overage housekeeping queues
    pub fn queued_pending_puts(&self) -> (usize, usize) {
        let queues = self.queues.lock();
        (queues.pending.len(), queues.overage.len())
    }

    /// Invalidated keys waiting for their blocking window to expire
    pub fn queued_removals(&self) -> usize {
        self.removals.lock().len()
    }

    /// Counters
    pub fn statistics(&self) -> ValidatorStatisticsSnapshot {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn existing_record(&self, key: &K) -> Option<Arc<KeyRecord>> {
        self.records.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn record_for(&self, key: &K) -> Arc<KeyRecord> {
        let entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyRecord::new()));
        Arc::clone(entry.value())
    }

    /// Run `f` with the live record of `key` locked, retrying when the
    /// record was unlinked between lookup and locking.
    fn with_live_record<R>(
        &self,
        key: &K,
        create: bool,
        f: impl FnOnce(&Arc<KeyRecord>, &mut MutexGuard<'_, KeyState>) -> R,
    ) -> Option<R> {
        loop {
            let record = if create {
                self.record_for(key)
            } else {
                self.existing_record(key)?
            };
            let mut state = record.state.lock();
            if state.unlinked {
                continue;
            }
            return Some(f(&record, &mut state));
        }
    }

    /// Wait until no put is in flight on the record. Returns `false` on timeout.
    fn await_put_completion(
        record: &KeyRecord,
        state: &mut MutexGuard<'_, KeyState>,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        state.waiters += 1;
        while state.putting.is_some() {
            if record.released.wait_until(state, deadline).timed_out() {
                break;
            }
        }
        state.waiters -= 1;
        state.putting.is_none()
    }

    fn unlink_if_idle(&self, key: &K, record: &Arc<KeyRecord>, state: &mut KeyState, now: u64) {
        if state.is_idle(now) {
            state.unlinked = true;
            state.pending.clear();
            self.records
                .remove_if(key, |_, current| Arc::ptr_eq(current, record));
        }
    }

    fn release(&self, key: &K, record: &Arc<KeyRecord>, owner: LockOwner) {
        let now = self.now();
        let mut state = record.state.lock();
        if state.putting == Some(owner) {
            state.putting = None;
        }
        record.released.notify_all();
        if !state.unlinked {
            self.unlink_if_idle(key, record, &mut state, now);
        }
    }

    fn queue_removal(&self, key: &K, expires_at: u64, now: u64) {
        let expired: Vec<K> = {
            let mut removals = self.removals.lock();
            removals.push_back(QueuedRemoval {
                key: key.clone(),
                expires_at,
            });
            let mut expired = Vec::new();
            while removals.front().map_or(false, |r| r.expires_at < now) {
                if let Some(removal) = removals.pop_front() {
                    expired.push(removal.key);
                }
            }
            expired
        };
        for key in expired {
            if let Some(record) = self.existing_record(&key) {
                let mut state = record.state.lock();
                if !state.unlinked {
                    self.unlink_if_idle(&key, &record, &mut state, now);
                }
            }
        }
    }

    /// Move aged pending puts to the overage queue and discard the ones
    /// outstanding for longer than `max_pending_put_delay`.
    fn clean_outdated_pending_puts(&self, now: u64) {
        let overaged = now.saturating_sub(self.settings.pending_put_overage_period_ms);
        let recent = now.saturating_sub(self.settings.pending_put_recent_period_ms);
        let must_clean = now.saturating_sub(self.settings.max_pending_put_delay_ms);

        let to_discard: Vec<(K, Arc<PendingPut>)> = {
            let mut queues = self.queues.lock();

            let mut position = 0;
            while position < queues.pending.len() {
                match queues.pending[position].ticket.upgrade() {
                    Some(ticket) if !ticket.is_completed() => {
                        if ticket.registered_at < overaged {
                            if let Some(item) = queues.pending.remove(position) {
                                queues.overage.push_back(item);
                            }
                        } else if ticket.registered_at >= recent || position > 2 {
                            break;
                        } else {
                            position += 1;
                        }
                    }
                    _ => {
                        queues.pending.remove(position);
                    }
                }
            }

            let mut to_discard = Vec::new();
            while let Some(front) = queues.overage.front() {
                match front.ticket.upgrade() {
                    Some(ticket) if !ticket.is_completed() => {
                        if ticket.registered_at >= must_clean {
                            break;
                        }
                        if let Some(item) = queues.overage.pop_front() {
                            to_discard.push((item.key, ticket));
                        }
                    }
                    _ => {
                        queues.overage.pop_front();
                    }
                }
            }
            to_discard
        };

        if to_discard.is_empty() {
            return;
        }
        let discarded = to_discard.len() as u64;
        for (key, ticket) in to_discard {
            ticket.complete();
            if let Some(record) = self.existing_record(&key) {
                let mut state = record.state.lock();
                state.pending.retain(|p| !Arc::ptr_eq(p, &ticket));
                if !state.unlinked {
                    self.unlink_if_idle(&key, &record, &mut state, now);
                }
            }
            debug!(target: "dormant::cache", region = %self.region, ?key, owner = %ticket.owner, "Discarded pending put that never completed");
        }
        self.stats.record_discarded(discarded);
    }
}

/// Permission to write one put-from-load entry
///
/// The put is considered in flight until the guard is dropped; invalidations
/// of the same key wait for it.
#[must_use = "the put-from-load lock is released as soon as it is dropped"]
pub struct PutFromLoadLock<'a, K: ValidatorKey> {
    validator: &'a PutFromLoadValidator<K>,
    key: K,
    record: Arc<KeyRecord>,
    owner: LockOwner,
}

impl<K: ValidatorKey> PutFromLoadLock<'_, K> {
    /// Key being put
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Owner of the put
    pub fn owner(&self) -> LockOwner {
        self.owner
    }
}

impl<K: ValidatorKey> fmt::Debug for PutFromLoadLock<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutFromLoadLock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .finish()
    }
}

impl<K: ValidatorKey> Drop for PutFromLoadLock<'_, K> {
    fn drop(&mut self) {
        self.validator.release(&self.key, &self.record, self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use dormant_core::TxId;

    const START: u64 = 1_000_000;

    fn validator() -> (PutFromLoadValidator<&'static str>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let v = PutFromLoadValidator::new("test", ValidatorSettings::default(), clock.clone());
        (v, clock)
    }

    fn tx(n: u64) -> LockOwner {
        LockOwner::Transaction(TxId::new(n))
    }

    // ========================================================================
    // Pending puts
    // ========================================================================

    #[test]
    fn test_registered_put_is_granted() {
        let (v, clock) = validator();
        assert!(v.register_pending_put(tx(1), &"k", clock.now_millis()));
        assert!(matches!(v.state_of(&"k"), PutState::PendingPut { owners: 1, .. }));

        clock.advance(1);
        let lock = v.acquire_put_from_load_lock(tx(1), &"k");
        assert!(lock.is_some());
        drop(lock);

        assert_eq!(v.state_of(&"k"), PutState::NakedPut);
        assert_eq!(v.tracked_keys(), 0);
    }

    #[test]
    fn test_naked_put_without_invalidation_is_granted() {
        let (v, _) = validator();
        assert!(v.acquire_put_from_load_lock(tx(1), &"k").is_some());
    }

    #[test]
    fn test_pending_put_is_consumed_by_acquire() {
        let (v, clock) = validator();
        v.register_pending_put(tx(1), &"k", clock.now_millis());
        drop(v.acquire_put_from_load_lock(tx(1), &"k"));
        assert_eq!(v.state_of(&"k"), PutState::NakedPut);
    }

    // ========================================================================
    // Key invalidation
    // ========================================================================

    #[test]
    fn test_key_removed_before_registration_rejects_put() {
        let (v, clock) = validator();
        let load_started_at = clock.now_millis();
        clock.advance(1);

        // The row changes and the key is invalidated while the load is
        // running, before the reader registers.
        assert!(v.key_removed(&"k"));
        clock.advance(1);

        v.register_pending_put(tx(1), &"k", load_started_at);
        assert!(v.acquire_put_from_load_lock(tx(1), &"k").is_none());
        assert_eq!(v.statistics().rejected, 1);
    }

    #[test]
    fn test_key_removed_after_registration_rejects_put() {
        let (v, clock) = validator();
        v.register_pending_put(tx(1), &"k", clock.now_millis());
        clock.advance(1);
        assert!(v.key_removed(&"k"));
        assert!(v.acquire_put_from_load_lock(tx(1), &"k").is_none());
    }

    #[test]
    fn test_load_started_after_removal_is_granted() {
        let (v, clock) = validator();
        v.key_removed(&"k");
        clock.advance(1);
        v.register_pending_put(tx(1), &"k", clock.now_millis());
        assert!(v.acquire_put_from_load_lock(tx(1), &"k").is_some());
    }

    #[test]
    fn test_naked_put_blocked_for_invalidation_period() {
        let (v, clock) = validator();
        v.key_removed(&"k");
        assert!(matches!(v.state_of(&"k"), PutState::Invalid { until: Some(_), .. }));

        clock.advance(v.settings().naked_put_invalidation_period_ms);
        assert!(v.acquire_put_from_load_lock(tx(1), &"k").is_none());

        clock.advance(1);
        assert!(v.acquire_put_from_load_lock(tx(1), &"k").is_some());
    }

    #[test]
    fn test_invalidation_is_per_key() {
        let (v, clock) = validator();
        let t0 = clock.now_millis();
        clock.advance(1);
        v.key_removed(&"a");
        v.register_pending_put(tx(1), &"b", t0);
        assert!(v.acquire_put_from_load_lock(tx(1), &"b").is_some());
    }

    // ========================================================================
    // Transactional invalidation
    // ========================================================================

    #[test]
    fn test_puts_refused_while_invalidating() {
        let (v, clock) = validator();
        assert!(v.begin_invalidating_key(tx(1), &"k"));
        assert!(matches!(v.state_of(&"k"), PutState::Invalid { until: None, .. }));

        clock.advance(1);
        assert!(!v.register_pending_put(tx(2), &"k", clock.now_millis()));
        assert!(v.acquire_put_from_load_lock(tx(2), &"k").is_none());
    }

    #[test]
    fn test_load_during_invalidation_refused_after_end() {
        let (v, clock) = validator();
        v.begin_invalidating_key(tx(1), &"k");
        clock.advance(1);
        let load_started_at = clock.now_millis();
        clock.advance(1);
        assert!(v.end_invalidating_key(tx(1), &"k"));

        clock.advance(1);
        v.register_pending_put(tx(2), &"k", load_started_at);
        assert!(v.acquire_put_from_load_lock(tx(2), &"k").is_none());

        // A load that starts after the invalidating transaction completed
        clock.advance(1);
        v.register_pending_put(tx(3), &"k", clock.now_millis());
        assert!(v.acquire_put_from_load_lock(tx(3), &"k").is_some());
    }

    #[test]
    fn test_overlapping_invalidations_need_every_owner_to_end() {
        let (v, clock) = validator();
        v.begin_invalidating_key(tx(1), &"k");
        v.begin_invalidating_key(tx(2), &"k");
        assert!(v.end_invalidating_key(tx(1), &"k"));
        assert!(matches!(v.state_of(&"k"), PutState::Invalid { until: None, .. }));

        assert!(v.end_invalidating_key(tx(2), &"k"));
        assert!(matches!(v.state_of(&"k"), PutState::Invalid { until: Some(_), .. }));
        clock.advance(1);
    }

    #[test]
    fn test_end_by_non_owner_is_ignored() {
        let (v, _) = validator();
        v.begin_invalidating_key(tx(1), &"k");
        assert!(!v.end_invalidating_key(tx(9), &"k"));
        assert!(!v.end_invalidating_key(tx(9), &"other"));
        assert!(matches!(v.state_of(&"k"), PutState::Invalid { until: None, .. }));
    }

    // ========================================================================
    // Region invalidation
    // ========================================================================

    #[test]
    fn test_region_removed_rejects_earlier_loads() {
        let (v, clock) = validator();
        let t0 = clock.now_millis();
        v.register_pending_put(tx(1), &"a", t0);
        clock.advance(1);
        assert!(v.region_removed());

        assert!(v.acquire_put_from_load_lock(tx(1), &"a").is_none());
        v.register_pending_put(tx(2), &"b", t0);
        assert!(v.acquire_put_from_load_lock(tx(2), &"b").is_none());

        clock.advance(1);
        v.register_pending_put(tx(3), &"b", clock.now_millis());
        assert!(v.acquire_put_from_load_lock(tx(3), &"b").is_some());
    }

    #[test]
    fn test_region_invalidation_in_progress_refuses_everything() {
        let (v, clock) = validator();
        v.begin_invalidating_region();
        clock.advance(1);
        v.register_pending_put(tx(1), &"a", clock.now_millis());
        assert!(v.acquire_put_from_load_lock(tx(1), &"a").is_none());
        assert!(matches!(v.state_of(&"a"), PutState::Invalid { until: None, .. }));
        v.end_invalidating_region();
        assert!(matches!(v.state_of(&"a"), PutState::Invalid { until: Some(_), .. }));
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    #[test]
    fn test_abandoned_pending_puts_are_discarded() {
        let (v, clock) = validator();
        for owner in 1..=3 {
            v.register_pending_put(tx(owner), &"k", clock.now_millis());
        }
        assert_eq!(v.queued_pending_puts(), (3, 0));

        // Old enough for the overage queue, not yet for discarding
        clock.advance(v.settings().pending_put_overage_period_ms + 1);
        drop(v.acquire_put_from_load_lock(tx(99), &"other"));
        assert_eq!(v.queued_pending_puts(), (0, 3));
        assert_eq!(v.statistics().discarded, 0);

        clock.advance(v.settings().max_pending_put_delay_ms);
        drop(v.acquire_put_from_load_lock(tx(99), &"other"));
        assert_eq!(v.queued_pending_puts(), (0, 0));
        assert_eq!(v.statistics().discarded, 3);
        assert_eq!(v.tracked_keys(), 0);
    }

    #[test]
    fn test_completed_pending_puts_leave_the_queue() {
        let (v, clock) = validator();
        v.register_pending_put(tx(1), &"k", clock.now_millis());
        drop(v.acquire_put_from_load_lock(tx(1), &"k"));
        clock.advance(1);
        drop(v.acquire_put_from_load_lock(tx(2), &"j"));
        assert_eq!(v.queued_pending_puts(), (0, 0));
    }

    #[test]
    fn test_expired_removals_are_unlinked() {
        let (v, clock) = validator();
        v.key_removed(&"a");
        assert_eq!(v.tracked_keys(), 1);
        clock.advance(v.settings().naked_put_invalidation_period_ms + 1);
        v.key_removed(&"b");
        assert_eq!(v.tracked_keys(), 1);
        assert_eq!(v.queued_removals(), 1);
    }

    #[test]
    fn test_reregistration_replaces_previous_ticket() {
        let (v, clock) = validator();
        v.register_pending_put(tx(1), &"k", clock.now_millis());
        clock.advance(1);
        v.register_pending_put(tx(1), &"k", clock.now_millis());
        assert!(matches!(v.state_of(&"k"), PutState::PendingPut { owners: 1, .. }));
    }
}
