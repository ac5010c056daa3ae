//! Persistence context
//!
//! The per-session registry of managed state:
//! - instances by [`EntityKey`], guaranteeing one instance per row
//! - [`EntityEntry`] per managed instance, iterated in the order the
//!   instances became managed
//! - [`CollectionEntry`] per collection property of a managed instance
//! - nullifiable keys: entities removed in the current flush
//! - keys inserted during the current transaction
//! - natural-id cross-reference: natural id to identifier and back, per
//!   entity, plus the natural ids invalidated by changes made in this
//!   session and not yet flushed
//!
//! The context is owned by one session and never shared.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use dormant_core::{EntityKey, Error, Identifier, NaturalId, Result};

use crate::collection::{CollectionEntry, CollectionRef};
use crate::entry::{EntityEntry, EntityStatus, LockMode};
use crate::instance::InstanceId;

/// Outcome of resolving a natural id against the persistence context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NaturalIdResolution {
    /// The natural id belongs to this identifier
    Resolved(Identifier),
    /// A managed instance gave this natural id up in this session; it
    /// resolves to nothing until the next flush
    Invalid,
    /// Not known to the context
    Unknown,
}

/// Natural-id cross-reference of one entity
#[derive(Debug, Default)]
struct Resolutions {
    by_id: FxHashMap<Identifier, NaturalId>,
    by_natural_id: FxHashMap<NaturalId, Identifier>,
    invalid: FxHashSet<NaturalId>,
}

/// Managed state of one session
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities_by_key: FxHashMap<EntityKey, InstanceId>,
    entries: FxHashMap<InstanceId, EntityEntry>,
    order: BTreeMap<u64, InstanceId>,
    next_sequence: u64,
    collections: FxHashMap<CollectionRef, CollectionEntry>,
    nullifiable: FxHashSet<EntityKey>,
    inserted: FxHashSet<EntityKey>,
    natural_ids: FxHashMap<String, Resolutions>,
    cascade_level: usize,
    flushing: bool,
    default_read_only: bool,
}

impl PersistenceContext {
    /// Empty context
    pub fn new(default_read_only: bool) -> Self {
        Self {
            default_read_only,
            ..Self::default()
        }
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Start managing `instance`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonUniqueObject`] if a different instance is already
    /// managed under the same key.
    pub fn add_entity(&mut self, instance: InstanceId, mut entry: EntityEntry) -> Result<()> {
        if let Some(existing) = self.entities_by_key.get(entry.key()) {
            if *existing != instance {
                return Err(Error::NonUniqueObject(entry.key().clone()));
            }
        }
        if let Some(previous) = self.entries.remove(&instance) {
            self.order.remove(&previous.sequence());
            self.entities_by_key.remove(previous.key());
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        entry.set_sequence(sequence);
        trace!(target: "dormant::session", key = %entry.key(), status = %entry.status(), "Entity added to context");
        self.entities_by_key.insert(entry.key().clone(), instance);
        self.order.insert(sequence, instance);
        self.entries.insert(instance, entry);
        Ok(())
    }

    /// Stop managing `instance`, dropping its collections and natural-id
    /// resolution
    pub fn remove_entity(&mut self, instance: InstanceId) -> Option<EntityEntry> {
        let entry = self.entries.remove(&instance)?;
        self.order.remove(&entry.sequence());
        if self.entities_by_key.get(entry.key()) == Some(&instance) {
            self.entities_by_key.remove(entry.key());
            self.remove_natural_id_resolution(entry.key().entity_name(), entry.key().id());
        }
        self.collections.retain(|r, _| r.owner != instance);
        trace!(target: "dormant::session", key = %entry.key(), "Entity removed from context");
        Some(entry)
    }

    /// Entry of a managed instance
    pub fn entry(&self, instance: InstanceId) -> Option<&EntityEntry> {
        self.entries.get(&instance)
    }

    /// Mutable entry of a managed instance
    pub fn entry_mut(&mut self, instance: InstanceId) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&instance)
    }

    /// Instance managed under `key`
    pub fn instance_for(&self, key: &EntityKey) -> Option<InstanceId> {
        self.entities_by_key.get(key).copied()
    }

    /// Whether `instance` is managed (in any status)
    pub fn contains(&self, instance: InstanceId) -> bool {
        self.entries.contains_key(&instance)
    }

    /// Managed instances in the order they became managed
    pub fn managed_instances(&self) -> Vec<InstanceId> {
        self.order.values().copied().collect()
    }

    /// Number of managed instances
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is managed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Track a collection
    pub fn add_collection(&mut self, collection: CollectionRef, entry: CollectionEntry) {
        self.collections.insert(collection, entry);
    }

    /// Entry of a tracked collection
    pub fn collection(&self, collection: &CollectionRef) -> Option<&CollectionEntry> {
        self.collections.get(collection)
    }

    /// Mutable entry of a tracked collection
    pub fn collection_mut(&mut self, collection: &CollectionRef) -> Option<&mut CollectionEntry> {
        self.collections.get_mut(collection)
    }

    /// Stop tracking a collection
    pub fn remove_collection(&mut self, collection: &CollectionRef) -> Option<CollectionEntry> {
        self.collections.remove(collection)
    }

    /// Every tracked collection, ordered by owner and property
    pub fn collection_refs(&self) -> Vec<CollectionRef> {
        let mut refs: Vec<CollectionRef> = self.collections.keys().copied().collect();
        refs.sort();
        refs
    }

    /// Forget the previous flush's collection decisions
    pub fn unmark_collections(&mut self) {
        for entry in self.collections.values_mut() {
            entry.unmark();
        }
    }

    // ------------------------------------------------------------------
    // Natural ids
    // ------------------------------------------------------------------

    /// Record that `id` of `entity` holds `natural_id`
    ///
    /// Returns `false` if that was already known. A natural id previously
    /// held by `id` stops resolving to it.
    pub fn cache_natural_id_resolution(&mut self, entity: &str, id: &Identifier, natural_id: NaturalId) -> bool {
        let resolutions = self.natural_ids.entry(entity.to_string()).or_default();
        if let Some(previous) = resolutions.by_id.get(id) {
            if *previous == natural_id {
                return false;
            }
            let previous = previous.clone();
            resolutions.by_natural_id.remove(&previous);
        }
        if let Some(holder) = resolutions.by_natural_id.insert(natural_id.clone(), id.clone()) {
            if holder != *id {
                resolutions.by_id.remove(&holder);
            }
        }
        resolutions.invalid.remove(&natural_id);
        trace!(target: "dormant::session", entity, %id, %natural_id, "Natural id resolution cached");
        resolutions.by_id.insert(id.clone(), natural_id);
        true
    }

    /// Resolve `natural_id` of `entity`
    pub fn find_natural_id_resolution(&self, entity: &str, natural_id: &NaturalId) -> NaturalIdResolution {
        let Some(resolutions) = self.natural_ids.get(entity) else {
            return NaturalIdResolution::Unknown;
        };
        if let Some(id) = resolutions.by_natural_id.get(natural_id) {
            NaturalIdResolution::Resolved(id.clone())
        } else if resolutions.invalid.contains(natural_id) {
            NaturalIdResolution::Invalid
        } else {
            NaturalIdResolution::Unknown
        }
    }

    /// Natural id last recorded for `id` of `entity`
    pub fn find_cached_natural_id(&self, entity: &str, id: &Identifier) -> Option<&NaturalId> {
        self.natural_ids.get(entity)?.by_id.get(id)
    }

    /// Forget the natural id of `id`. Returns the natural id it held.
    pub fn remove_natural_id_resolution(&mut self, entity: &str, id: &Identifier) -> Option<NaturalId> {
        let resolutions = self.natural_ids.get_mut(entity)?;
        let natural_id = resolutions.by_id.remove(id)?;
        resolutions.by_natural_id.remove(&natural_id);
        Some(natural_id)
    }

    /// `natural_id` was given up by a managed instance and must not resolve
    /// through the cache or the store before the next flush
    pub fn stash_invalid_natural_id(&mut self, entity: &str, natural_id: NaturalId) {
        self.natural_ids
            .entry(entity.to_string())
            .or_default()
            .invalid
            .insert(natural_id);
    }

    /// The store has caught up with the session: forget invalidated natural
    /// ids
    pub fn unstash_invalid_natural_ids(&mut self) {
        for resolutions in self.natural_ids.values_mut() {
            resolutions.invalid.clear();
        }
    }

    // ------------------------------------------------------------------
    // Flush bookkeeping
    // ------------------------------------------------------------------

    /// Record that `key` is being removed; references to it flush as NULL
    pub fn add_nullifiable(&mut self, key: EntityKey) {
        self.nullifiable.insert(key);
    }

    /// `key` is no longer being removed
    pub fn remove_nullifiable(&mut self, key: &EntityKey) {
        self.nullifiable.remove(key);
    }

    /// Whether references to `key` must be written as NULL
    pub fn is_nullifiable(&self, key: &EntityKey) -> bool {
        self.nullifiable.contains(key)
    }

    /// Forget the nullifiable keys
    pub fn clear_nullifiable(&mut self) {
        self.nullifiable.clear();
    }

    /// Record a row inserted by the current transaction
    pub fn register_inserted(&mut self, key: EntityKey) {
        self.inserted.insert(key);
    }

    /// Whether `key` was inserted by the current transaction
    pub fn was_inserted(&self, key: &EntityKey) -> bool {
        self.inserted.contains(key)
    }

    /// Keys inserted by the current transaction
    pub fn inserted_keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.inserted.iter()
    }

    /// Current cascade depth
    pub fn cascade_level(&self) -> usize {
        self.cascade_level
    }

    pub(crate) fn increment_cascade_level(&mut self) {
        self.cascade_level += 1;
    }

    pub(crate) fn decrement_cascade_level(&mut self) {
        self.cascade_level = self.cascade_level.saturating_sub(1);
    }

    /// Whether a flush is running
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub(crate) fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    /// Whether newly loaded instances start read-only
    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    /// Change the read-only default for instances loaded from now on
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    /// Status a freshly loaded entity should get
    pub fn loaded_status(&self, mutable: bool) -> EntityStatus {
        if self.default_read_only || !mutable {
            EntityStatus::ReadOnly
        } else {
            EntityStatus::Managed
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Detach everything. Returns the instances that were managed.
    ///
    /// Keys inserted by the current transaction are kept: they stay
    /// uncommitted until the transaction completes.
    pub fn clear(&mut self) -> Vec<InstanceId> {
        let detached = self.managed_instances();
        self.entities_by_key.clear();
        self.entries.clear();
        self.order.clear();
        self.collections.clear();
        self.nullifiable.clear();
        self.natural_ids.clear();
        self.cascade_level = 0;
        self.flushing = false;
        detached
    }

    /// Reset per-transaction state after commit or rollback
    pub fn after_transaction_completion(&mut self) {
        for entry in self.entries.values_mut() {
            entry.set_lock_mode(LockMode::None);
        }
        self.inserted.clear();
    }
}
