//! Flush: dirty checking and statement execution
//!
//! A flush runs in two phases. Preparation walks the persistence context
//! and turns its state into queued actions:
//!
//! 1. persist cascades from every managed instance, then delete-orphan
//!    removals
//! 2. dirty check of every managed entity, queueing updates and version
//!    increments
//! 3. collection decisions: recreate, update or remove
//!
//! Execution then drains the queue in foreign-key safe order. Inserts and
//! deletes are ordered by their references; cycles over nullable columns
//! are broken by writing NULL and fixing the column with a separate
//! update.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use dormant_cache::{CacheEntry, CacheKey};
use dormant_core::{
    CascadeAction, ColumnValue, EntityKey, EntityMapping, Error, Identifier, PropertyKind, Result, Row, TxId,
};

use super::{EntityState, Session};
use crate::action::{CollectionRowsAction, EntityDeleteAction, EntityInsertAction, EntityUpdateAction};
use crate::cascade::CascadeContext;
use crate::collection::{CollectionAction, CollectionRef};
use crate::dirty::{find_dirty, requires_version_increment, DirtyProperties};
use crate::entry::{EntityStatus, LockMode};
use crate::instance::{InstanceId, PropertyValue};
use crate::ordering::{plan_order, Dependency};
use crate::transaction::Transaction;

impl Session {
    /// Write every pending change to the store
    ///
    /// # Errors
    ///
    /// - [`Error::TransactionRequired`] outside a transaction
    /// - [`Error::TransientObject`] when an association points at an
    ///   unsaved instance that is not cascaded to
    /// - [`Error::PropertyValue`] for a not-null property holding null
    /// - [`Error::StaleObjectState`] when a versioned row changed
    ///   underneath the session
    /// - store errors such as [`Error::ConstraintViolation`]
    ///
    /// Any of these marks the transaction rollback-only.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.transaction.is_none() {
            return Err(Error::TransactionRequired);
        }
        self.context.set_flushing(true);
        let result = self.flush_everything();
        self.context.set_flushing(false);
        self.guard(result)
    }

    /// Whether a flush would write anything
    ///
    /// Runs the preparation phase. Inserts and deletes it schedules stay
    /// queued; computed updates and collection actions are discarded.
    pub fn is_dirty(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.context.set_flushing(true);
        let result = self.prepare_flush();
        self.context.set_flushing(false);
        result?;
        let dirty = !self.actions.is_empty();
        self.actions.discard_computed();
        self.version_checks.clear();
        Ok(dirty)
    }

    fn flush_everything(&mut self) -> Result<()> {
        self.prepare_flush()?;
        let mut actions = self.actions.take();
        if self.factory.config().order_updates {
            actions.sort_updates();
        }
        debug!(
            target: "dormant::flush",
            inserts = actions.insertions().len(),
            updates = actions.updates().len(),
            deletes = actions.deletions().len(),
            "Flushing"
        );
        let actions = actions.into_parts();
        let tx = self.active_tx()?;

        self.execute_inserts(tx, actions.insertions)?;
        for update in actions.updates {
            self.execute_update(tx, update)?;
        }
        self.execute_version_checks(tx)?;
        for removal in actions.collection_removals {
            self.execute_collection_removal(tx, removal)?;
        }
        for update in actions.collection_updates {
            self.execute_collection_write(tx, update, false)?;
        }
        for creation in actions.collection_creations {
            self.execute_collection_write(tx, creation, true)?;
        }
        self.execute_deletes(tx, actions.deletions)?;

        self.post_flush()?;
        self.factory.stats().record_flush();
        Ok(())
    }

    fn active_tx(&self) -> Result<TxId> {
        self.tx_id().ok_or(Error::TransactionRequired)
    }

    pub(super) fn registry(&mut self) -> Result<&mut Transaction> {
        self.transaction.as_mut().ok_or(Error::TransactionRequired)
    }

    // ------------------------------------------------------------------
    // Preparation
    // ------------------------------------------------------------------

    fn prepare_flush(&mut self) -> Result<()> {
        self.cascade_on_flush()?;
        self.context.unmark_collections();
        self.flush_entities()?;
        self.flush_collections()
    }

    fn cascade_on_flush(&mut self) -> Result<()> {
        let mut ctx = CascadeContext::for_flush();
        for id in self.context.managed_instances() {
            let cascades = self.context.entry(id).map_or(false, |entry| {
                matches!(
                    entry.status(),
                    EntityStatus::Managed | EntityStatus::ReadOnly | EntityStatus::Saving
                )
            });
            if cascades {
                self.persist_with(id, &mut ctx)?;
            }
        }

        let mut orphans = Vec::new();
        for collection in self.context.collection_refs() {
            let owner_alive = self
                .context
                .entry(collection.owner)
                .map_or(false, |entry| !entry.status().is_deleted_or_gone());
            let Some(entry) = self.context.collection(&collection) else {
                continue;
            };
            if !owner_alive {
                continue;
            }
            let owner = self.instances.get(collection.owner)?;
            if !owner.mapping().properties()[collection.property]
                .cascade_style()
                .has_orphan_delete()
            {
                continue;
            }
            orphans.extend(entry.orphans(owner.value(collection.property).targets()));
        }

        let mut ctx = CascadeContext::new(CascadeAction::Remove);
        for orphan in orphans {
            if self.contains(orphan) {
                trace!(target: "dormant::flush", instance = %orphan, "Removing orphan");
                self.remove_with(orphan, &mut ctx)?;
            }
        }
        Ok(())
    }

    fn flush_entities(&mut self) -> Result<()> {
        for id in self.context.managed_instances() {
            let Some(entry) = self.context.entry(id) else {
                continue;
            };
            if entry.status().is_deleted_or_gone() {
                continue;
            }
            let mapping = Arc::clone(entry.mapping());
            let key = entry.key().clone();
            let exists = entry.exists_in_database();
            let modifiable = entry.is_modifiable();
            let lock_mode = entry.lock_mode();
            let previous_version = entry.version();
            let loaded = entry.loaded_state().map(<[ColumnValue]>::to_vec);

            for (index, property) in mapping.associations() {
                if property.kind().is_collection() {
                    if let Some(collection) = self.context.collection_mut(&CollectionRef::new(id, index)) {
                        collection.mark_reached();
                    }
                }
            }

            if !exists {
                self.check_references(id, &mapping)?;
                let columns = self.columns_of(id)?;
                check_nullability(&mapping, &columns, None)?;
                continue;
            }

            let mut dirty = DirtyProperties::new();
            let mut dirty_collection = false;
            if modifiable {
                self.check_references(id, &mapping)?;
                let columns = self.columns_of(id)?;
                if let Some(loaded) = &loaded {
                    Self::check_natural_id_unchanged(&mapping, &key, &columns, loaded)?;
                    dirty = find_dirty(&mapping, &columns, loaded);
                }
                if !dirty.is_empty() {
                    check_nullability(&mapping, &columns, Some(&dirty))?;
                }
                dirty_collection = self.has_dirty_collection(id, &mapping)?;
            }

            let increment = mapping.is_versioned()
                && (requires_version_increment(&mapping, &dirty)
                    || dirty_collection
                    || lock_mode == LockMode::OptimisticForceIncrement);

            if !dirty.is_empty() || increment {
                let next_version = if increment {
                    previous_version.map(|v| v.next())
                } else {
                    previous_version
                };
                trace!(target: "dormant::flush", %key, ?dirty, ?next_version, "Entity dirty");
                self.actions.add_update(EntityUpdateAction {
                    instance: id,
                    key,
                    dirty,
                    previous_version,
                    next_version,
                });
            } else if lock_mode == LockMode::Optimistic && mapping.is_versioned() {
                self.version_checks.push(id);
            }
        }
        Ok(())
    }

    /// Associations of a row about to be written must point at persistent
    /// instances
    fn check_references(&self, id: InstanceId, mapping: &EntityMapping) -> Result<()> {
        let instance = self.instances.get(id)?;
        for (index, property) in mapping.associations() {
            for target in instance.value(index).targets() {
                if self.entity_state(*target)? == EntityState::Transient {
                    return Err(Error::TransientObject {
                        entity: mapping.name().to_string(),
                        property: property.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn has_dirty_collection(&self, id: InstanceId, mapping: &EntityMapping) -> Result<bool> {
        let instance = self.instances.get(id)?;
        for (index, property) in mapping.associations() {
            if !property.kind().is_collection() || !property.is_optimistic_locked() {
                continue;
            }
            let dirty = self
                .context
                .collection(&CollectionRef::new(id, index))
                .map_or(false, |entry| entry.is_dirty(instance.value(index).targets()));
            if dirty {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn flush_collections(&mut self) -> Result<()> {
        for collection in self.context.collection_refs() {
            let owner_exists = self
                .context
                .entry(collection.owner)
                .map_or(false, |entry| entry.exists_in_database());
            let current = self.instances.get(collection.owner)?.value(collection.property).targets().to_vec();
            let Some(entry) = self.context.collection_mut(&collection) else {
                continue;
            };

            let action = if entry.is_inverse() {
                None
            } else if !entry.is_reached() {
                entry
                    .snapshot()
                    .filter(|snapshot| !snapshot.is_empty())
                    .map(|_| CollectionAction::Remove)
            } else if !owner_exists || entry.snapshot().is_none() {
                (!current.is_empty()).then_some(CollectionAction::Recreate)
            } else if entry.is_dirty(&current) {
                Some(if current.is_empty() {
                    CollectionAction::Remove
                } else {
                    CollectionAction::Update
                })
            } else {
                None
            };
            entry.set_action(action);

            let rows = CollectionRowsAction {
                collection,
                key: entry.key().clone(),
            };
            match action {
                Some(CollectionAction::Recreate) => self.actions.add_collection_creation(rows),
                Some(CollectionAction::Update) => self.actions.add_collection_update(rows),
                Some(CollectionAction::Remove) => self.actions.add_collection_removal(rows),
                None => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn execute_inserts(&mut self, tx: TxId, insertions: Vec<EntityInsertAction>) -> Result<()> {
        if insertions.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(insertions.len());
        for action in &insertions {
            rows.push(self.columns_of(action.instance)?);
        }

        let position: FxHashMap<EntityKey, usize> = insertions
            .iter()
            .enumerate()
            .map(|(index, action)| (action.key.clone(), index))
            .collect();
        let mut dependencies = Vec::new();
        let mut columns = Vec::new();
        for (index, action) in insertions.iter().enumerate() {
            let mapping = Arc::clone(self.instances.get(action.instance)?.mapping());
            for (property_index, property) in mapping.associations() {
                let PropertyKind::ManyToOne { target } = property.kind() else {
                    continue;
                };
                let Some(fk) = rows[index][property_index].reference() else {
                    continue;
                };
                if let Some(&before) = position.get(&EntityKey::new(target.as_str(), fk.clone())) {
                    dependencies.push(Dependency {
                        before,
                        after: index,
                        nullable: property.is_nullable(),
                    });
                    columns.push((index, property_index));
                }
            }
        }

        let groups: Vec<&str> = insertions.iter().map(|action| action.key.entity_name()).collect();
        let groups = self.factory.config().order_inserts.then_some(groups.as_slice());
        let plan = plan_order(insertions.len(), &dependencies, groups).map_err(|cycle| {
            let (index, property) = columns[cycle.dependency];
            self.property_error(insertions[index].instance, property)
        })?;

        let mut deferred = Vec::with_capacity(plan.deferred.len());
        for &dependency in &plan.deferred {
            let (index, property) = columns[dependency];
            let value = std::mem::replace(&mut rows[index][property], ColumnValue::Reference(None));
            deferred.push((index, property, value));
        }

        for &index in &plan.order {
            let action = &insertions[index];
            let version = self.instances.get(action.instance)?.version();
            self.factory
                .store()
                .insert(tx, &action.key, Row::new(rows[index].clone(), version))?;
            self.factory.stats().record_entity_insert();
            trace!(target: "dormant::flush", key = %action.key, "Inserted");
            if let Some(entry) = self.context.entry_mut(action.instance) {
                entry.set_exists_in_database(true);
                entry.set_loaded_state(rows[index].clone());
                entry.set_version(version);
            }
            self.instances.get_mut(action.instance)?.mark_persistent();
            self.context.register_inserted(action.key.clone());
        }

        for (index, property, value) in deferred {
            let action = &insertions[index];
            rows[index][property] = value;
            let version = self.instances.get(action.instance)?.version();
            self.factory
                .store()
                .update(tx, &action.key, Row::new(rows[index].clone(), version), version)?;
            if let Some(entry) = self.context.entry_mut(action.instance) {
                entry.set_loaded_state(rows[index].clone());
            }
            debug!(target: "dormant::flush", key = %action.key, "Deferred foreign key written");
        }

        for &index in &plan.order {
            let action = &insertions[index];
            let mapping = Arc::clone(self.instances.get(action.instance)?.mapping());
            self.natural_id_inserted(&mapping, &action.key, &rows[index])?;
            let Some(cache) = self.entity_cache(action.key.entity_name()) else {
                continue;
            };
            let version = self.instances.get(action.instance)?.version();
            let entry = CacheEntry::Entity(Row::new(rows[index].clone(), version));
            cache.after_insert(CacheKey::Entity(action.key.clone()), entry, self.registry()?)?;
        }
        Ok(())
    }

    fn execute_update(&mut self, tx: TxId, action: EntityUpdateAction) -> Result<()> {
        let Some(entry) = self.context.entry(action.instance) else {
            return Ok(());
        };
        let mapping = Arc::clone(entry.mapping());
        let loaded = entry.loaded_state().map(<[ColumnValue]>::to_vec).unwrap_or_default();
        let columns = if entry.is_modifiable() {
            self.columns_of(action.instance)?
        } else {
            loaded.clone()
        };

        if let Some(cache) = self.entity_cache(action.key.entity_name()) {
            let owner = self.lock_owner();
            cache.update(owner, CacheKey::Entity(action.key.clone()), self.registry()?)?;
        }
        let row = Row::new(columns.clone(), action.next_version);
        if let Err(e) = self
            .factory
            .store()
            .update(tx, &action.key, row, action.previous_version)
        {
            if e.is_optimistic_lock_failure() {
                self.factory.stats().record_optimistic_failure();
            }
            return Err(e);
        }
        self.factory.stats().record_entity_update();
        self.natural_id_updated(&mapping, &action.key, &columns, &loaded)?;
        debug!(
            target: "dormant::flush",
            key = %action.key,
            dirty = action.dirty.len(),
            version = ?action.next_version,
            "Updated"
        );

        if let Some(entry) = self.context.entry_mut(action.instance) {
            entry.set_loaded_state(columns);
            entry.set_version(action.next_version);
        }
        self.instances.get_mut(action.instance)?.set_version(action.next_version);
        Ok(())
    }

    fn execute_version_checks(&mut self, tx: TxId) -> Result<()> {
        for id in std::mem::take(&mut self.version_checks) {
            let Some(entry) = self.context.entry(id) else {
                continue;
            };
            if entry.status().is_deleted_or_gone() {
                continue;
            }
            let key = entry.key().clone();
            let expected = entry.version();
            let actual = match self.factory.store().load(Some(tx), &key)? {
                Some(row) => row.version,
                None => None,
            };
            if actual != expected {
                self.factory.stats().record_optimistic_failure();
                return Err(Error::StaleObjectState { key, expected, actual });
            }
            trace!(target: "dormant::flush", %key, "Version checked");
        }
        Ok(())
    }

    fn execute_collection_removal(&mut self, tx: TxId, action: CollectionRowsAction) -> Result<()> {
        self.factory.store().remove_collection(tx, &action.key)?;
        self.evict_collection(&action)?;
        self.factory.stats().record_collection_remove();
        trace!(target: "dormant::flush", key = %action.key, "Collection removed");
        Ok(())
    }

    fn execute_collection_write(&mut self, tx: TxId, action: CollectionRowsAction, created: bool) -> Result<()> {
        let elements = self.element_identifiers(action.collection)?;
        if elements.is_empty() {
            if !created {
                return self.execute_collection_removal(tx, action);
            }
            return Ok(());
        }
        self.factory.store().write_collection(tx, &action.key, elements)?;
        if created {
            self.factory.stats().record_collection_recreate();
        } else {
            self.evict_collection(&action)?;
            self.factory.stats().record_collection_update();
        }
        trace!(target: "dormant::flush", key = %action.key, created, "Collection written");
        Ok(())
    }

    fn evict_collection(&mut self, action: &CollectionRowsAction) -> Result<()> {
        if let Some(cache) = self.collection_cache(action.key.role()) {
            let owner = self.lock_owner();
            cache.remove(owner, CacheKey::Collection(action.key.clone()), self.registry()?)?;
        }
        Ok(())
    }

    /// Identifiers of the current elements. Elements removed in this flush
    /// are left out.
    fn element_identifiers(&self, collection: CollectionRef) -> Result<Vec<Identifier>> {
        let owner = self.instances.get(collection.owner)?;
        let PropertyValue::Collection(elements) = owner.value(collection.property) else {
            return Ok(Vec::new());
        };
        let mut identifiers = Vec::with_capacity(elements.len());
        for element in elements {
            let instance = self.instances.get(*element)?;
            let Some(identifier) = instance.id() else {
                return Err(self.transient_element(collection));
            };
            if self
                .context
                .is_nullifiable(&EntityKey::new(instance.entity_name(), identifier.clone()))
            {
                continue;
            }
            identifiers.push(identifier.clone());
        }
        Ok(identifiers)
    }

    fn execute_deletes(&mut self, tx: TxId, deletions: Vec<EntityDeleteAction>) -> Result<()> {
        if deletions.is_empty() {
            return Ok(());
        }
        let position: FxHashMap<EntityKey, usize> = deletions
            .iter()
            .enumerate()
            .map(|(index, action)| (action.key.clone(), index))
            .collect();

        // The referencing row must go before the row it references.
        let mut dependencies = Vec::new();
        let mut columns = Vec::new();
        for (index, action) in deletions.iter().enumerate() {
            let Some(entry) = self.context.entry(action.instance) else {
                continue;
            };
            let Some(state) = entry.deleted_state() else {
                continue;
            };
            for (property_index, property) in entry.mapping().associations() {
                let PropertyKind::ManyToOne { target } = property.kind() else {
                    continue;
                };
                let Some(fk) = state.get(property_index).and_then(ColumnValue::reference) else {
                    continue;
                };
                match position.get(&EntityKey::new(target.as_str(), fk.clone())) {
                    Some(&referenced) if referenced != index => {
                        dependencies.push(Dependency {
                            before: index,
                            after: referenced,
                            nullable: property.is_nullable(),
                        });
                        columns.push((index, property_index));
                    }
                    _ => {}
                }
            }
        }

        let plan = plan_order(deletions.len(), &dependencies, None).map_err(|cycle| {
            let (index, _) = columns[cycle.dependency];
            Error::constraint(
                "FOREIGN KEY",
                format!(
                    "deleting {} requires breaking a cycle of not-null references",
                    deletions[index].key
                ),
            )
        })?;

        for &dependency in &plan.deferred {
            let (index, property) = columns[dependency];
            let action = &deletions[index];
            let Some(mut row) = self.factory.store().load(Some(tx), &action.key)? else {
                return Err(Error::StaleObjectState {
                    key: action.key.clone(),
                    expected: action.version,
                    actual: None,
                });
            };
            row.columns[property] = ColumnValue::Reference(None);
            row.version = action.version;
            self.factory.store().update(tx, &action.key, row, action.version)?;
            debug!(target: "dormant::flush", key = %action.key, "Foreign key nulled before delete");
        }

        for &index in &plan.order {
            let action = &deletions[index];
            if let Some(cache) = self.entity_cache(action.key.entity_name()) {
                let owner = self.lock_owner();
                cache.remove(owner, CacheKey::Entity(action.key.clone()), self.registry()?)?;
            }
            let removed = self.context.entry(action.instance).and_then(|entry| {
                entry
                    .deleted_state()
                    .map(|state| (Arc::clone(entry.mapping()), state.to_vec()))
            });
            if let Some((mapping, state)) = removed {
                self.natural_id_removed(&mapping, &state)?;
            }
            if let Err(e) = self.factory.store().delete(tx, &action.key, action.version) {
                if e.is_optimistic_lock_failure() {
                    self.factory.stats().record_optimistic_failure();
                }
                return Err(e);
            }
            self.factory.stats().record_entity_delete();
            trace!(target: "dormant::flush", key = %action.key, "Deleted");
            if let Some(entry) = self.context.entry_mut(action.instance) {
                entry.set_status(EntityStatus::Gone);
            }
        }
        Ok(())
    }

    fn post_flush(&mut self) -> Result<()> {
        for id in self.context.managed_instances() {
            let gone = self
                .context
                .entry(id)
                .map_or(false, |entry| entry.status() == EntityStatus::Gone);
            if gone {
                self.context.remove_entity(id);
                self.instances.get_mut(id)?.forget_identity();
            }
        }
        for collection in self.context.collection_refs() {
            let current = self.instances.get(collection.owner)?.value(collection.property).targets().to_vec();
            if let Some(entry) = self.context.collection_mut(&collection) {
                entry.set_snapshot(current);
            }
        }
        self.context.clear_nullifiable();
        self.context.unstash_invalid_natural_ids();
        self.version_checks.clear();
        Ok(())
    }

    fn property_error(&self, id: InstanceId, property: usize) -> Error {
        match self.instances.get(id) {
            Ok(instance) => Error::PropertyValue {
                entity: instance.entity_name().to_string(),
                property: instance.mapping().properties()[property].name().to_string(),
            },
            Err(e) => e,
        }
    }

    fn transient_element(&self, collection: CollectionRef) -> Error {
        match self.instances.get(collection.owner) {
            Ok(owner) => Error::TransientObject {
                entity: owner.entity_name().to_string(),
                property: owner.mapping().properties()[collection.property].name().to_string(),
            },
            Err(e) => e,
        }
    }
}

/// Not-null properties must not be null. With `only`, just those
/// properties are checked.
fn check_nullability(mapping: &EntityMapping, columns: &[ColumnValue], only: Option<&[usize]>) -> Result<()> {
    for (index, property) in mapping.properties().iter().enumerate() {
        if property.is_nullable() || property.kind().is_collection() {
            continue;
        }
        if only.map_or(false, |only| !only.contains(&index)) {
            continue;
        }
        if columns.get(index).map_or(true, ColumnValue::is_null) {
            return Err(Error::PropertyValue {
                entity: mapping.name().to_string(),
                property: property.name().to_string(),
            });
        }
    }
    Ok(())
}
