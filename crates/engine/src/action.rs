//! Action queue
//!
//! Inserts and deletes are queued when the session operation runs; updates
//! and collection actions are computed by the flush. The queue executes in a
//! fixed order:
//!
//! 1. entity inserts (dependency ordered)
//! 2. deferred foreign-key updates
//! 3. entity updates
//! 4. collection removals
//! 5. collection updates
//! 6. collection creations
//! 7. entity deletes (reverse dependency ordered)

use dormant_core::{CollectionKey, EntityKey, Version};

use crate::collection::CollectionRef;
use crate::dirty::DirtyProperties;
use crate::instance::InstanceId;

/// Row insert of a newly persisted instance
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInsertAction {
    /// Instance to insert
    pub instance: InstanceId,
    /// Key of the new row
    pub key: EntityKey,
}

/// Row update of a dirty instance
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdateAction {
    /// Instance to update
    pub instance: InstanceId,
    /// Key of the row
    pub key: EntityKey,
    /// Changed properties
    pub dirty: DirtyProperties,
    /// Version the row must currently have
    pub previous_version: Option<Version>,
    /// Version written with the update
    pub next_version: Option<Version>,
}

/// Row delete of a removed instance
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDeleteAction {
    /// Instance to delete
    pub instance: InstanceId,
    /// Key of the row
    pub key: EntityKey,
    /// Version the row must currently have
    pub version: Option<Version>,
}

/// Statement on the rows of one collection
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRowsAction {
    /// Collection in the persistence context
    pub collection: CollectionRef,
    /// Key of the collection rows
    pub key: CollectionKey,
}

/// Actions waiting for the next flush
#[derive(Debug, Default)]
pub struct ActionQueue {
    insertions: Vec<EntityInsertAction>,
    updates: Vec<EntityUpdateAction>,
    deletions: Vec<EntityDeleteAction>,
    collection_removals: Vec<CollectionRowsAction>,
    collection_updates: Vec<CollectionRowsAction>,
    collection_creations: Vec<CollectionRowsAction>,
}

impl ActionQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert
    pub fn add_insert(&mut self, action: EntityInsertAction) {
        self.insertions.push(action);
    }

    /// Queue an update
    pub fn add_update(&mut self, action: EntityUpdateAction) {
        self.updates.push(action);
    }

    /// Queue a delete
    pub fn add_delete(&mut self, action: EntityDeleteAction) {
        self.deletions.push(action);
    }

    /// Queue a collection removal
    pub fn add_collection_removal(&mut self, action: CollectionRowsAction) {
        self.collection_removals.push(action);
    }

    /// Queue a collection update
    pub fn add_collection_update(&mut self, action: CollectionRowsAction) {
        self.collection_updates.push(action);
    }

    /// Queue a collection creation
    pub fn add_collection_creation(&mut self, action: CollectionRowsAction) {
        self.collection_creations.push(action);
    }

    /// Drop the queued insert of `instance`. Returns whether there was one.
    pub fn unschedule_insert(&mut self, instance: InstanceId) -> bool {
        let before = self.insertions.len();
        self.insertions.retain(|a| a.instance != instance);
        before != self.insertions.len()
    }

    /// Drop the queued delete of `instance`. Returns whether there was one.
    pub fn unschedule_delete(&mut self, instance: InstanceId) -> bool {
        let before = self.deletions.len();
        self.deletions.retain(|a| a.instance != instance);
        before != self.deletions.len()
    }

    /// Drop every queued action of `instance` and its collections
    pub fn unschedule_all(&mut self, instance: InstanceId) {
        self.insertions.retain(|a| a.instance != instance);
        self.updates.retain(|a| a.instance != instance);
        self.deletions.retain(|a| a.instance != instance);
        self.collection_removals.retain(|a| a.collection.owner != instance);
        self.collection_updates.retain(|a| a.collection.owner != instance);
        self.collection_creations.retain(|a| a.collection.owner != instance);
    }

    /// Whether an insert of `instance` is queued
    pub fn has_insert(&self, instance: InstanceId) -> bool {
        self.insertions.iter().any(|a| a.instance == instance)
    }

    /// Whether a delete of `instance` is queued
    pub fn has_delete(&self, instance: InstanceId) -> bool {
        self.deletions.iter().any(|a| a.instance == instance)
    }

    /// Queued inserts in scheduling order
    pub fn insertions(&self) -> &[EntityInsertAction] {
        &self.insertions
    }

    /// Queued updates
    pub fn updates(&self) -> &[EntityUpdateAction] {
        &self.updates
    }

    /// Queued deletes in scheduling order
    pub fn deletions(&self) -> &[EntityDeleteAction] {
        &self.deletions
    }

    /// Sort updates by entity key
    pub fn sort_updates(&mut self) {
        self.updates.sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// Drop the actions a flush computes, keeping inserts and deletes
    pub fn discard_computed(&mut self) {
        self.updates.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
    }

    /// Take every queued action, leaving the queue empty
    pub fn take(&mut self) -> ActionQueue {
        std::mem::take(self)
    }

    pub(crate) fn into_parts(self) -> QueuedActions {
        QueuedActions {
            insertions: self.insertions,
            updates: self.updates,
            deletions: self.deletions,
            collection_removals: self.collection_removals,
            collection_updates: self.collection_updates,
            collection_creations: self.collection_creations,
        }
    }

    /// Number of queued actions
    pub fn len(&self) -> usize {
        self.insertions.len()
            + self.updates.len()
            + self.deletions.len()
            + self.collection_removals.len()
            + self.collection_updates.len()
            + self.collection_creations.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything
    pub fn clear(&mut self) {
        *self = ActionQueue::default();
    }
}

/// Owned contents of a drained queue
#[derive(Debug, Default)]
pub(crate) struct QueuedActions {
    pub insertions: Vec<EntityInsertAction>,
    pub updates: Vec<EntityUpdateAction>,
    pub deletions: Vec<EntityDeleteAction>,
    pub collection_removals: Vec<CollectionRowsAction>,
    pub collection_updates: Vec<CollectionRowsAction>,
    pub collection_creations: Vec<CollectionRowsAction>,
}
