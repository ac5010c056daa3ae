//! Persist and merge

use std::sync::Arc;

use tracing::debug;

use dormant_core::{CascadeAction, EntityKey, Error, IdGeneration, PropertyKind, Result, Version};

use super::{EntityState, Session};
use crate::action::EntityInsertAction;
use crate::cascade::{CascadeContext, CascadePoint};
use crate::entry::{EntityEntry, EntityStatus};
use crate::instance::{EntityInstance, InstanceId, PropertyValue};

impl Session {
    /// Make a transient instance managed and schedule its insert
    ///
    /// PERSIST cascades along the associations that include it. Persisting
    /// a managed instance only cascades; persisting a removed instance
    /// cancels the removal.
    ///
    /// # Errors
    ///
    /// - [`Error::DetachedEntity`] for detached instances
    /// - [`Error::NonUniqueObject`] if another instance is managed under
    ///   the same key
    /// - [`Error::InvalidState`] if an assigned identifier is missing
    pub fn persist(&mut self, id: InstanceId) -> Result<()> {
        self.ensure_open()?;
        let mut ctx = CascadeContext::new(CascadeAction::Persist);
        let result = self.persist_with(id, &mut ctx);
        self.guard(result)
    }

    pub(super) fn persist_with(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<()> {
        if !ctx.visit(id) {
            return Ok(());
        }
        match self.entity_state(id)? {
            EntityState::Managed => self.cascade(id, CascadePoint::All, ctx),
            EntityState::Removed => {
                let key = self.key_of(id)?;
                if ctx.is_on_flush() {
                    return Err(Error::ObjectDeleted(key));
                }
                self.undelete(id, &key);
                self.cascade(id, CascadePoint::All, ctx)
            }
            EntityState::Detached => Err(Error::DetachedEntity {
                operation: "persist",
                key: self.key_of(id)?,
            }),
            EntityState::Transient => self.save_transient(id, ctx),
        }
    }

    fn undelete(&mut self, id: InstanceId, key: &EntityKey) {
        debug!(target: "dormant::session", %key, "Removed instance persisted again");
        self.actions.unschedule_delete(id);
        self.context.remove_nullifiable(key);
        if let Some(entry) = self.context.entry_mut(id) {
            let restored = entry
                .previous_status()
                .filter(|status| !status.is_deleted_or_gone())
                .unwrap_or(EntityStatus::Managed);
            entry.set_status(restored);
            entry.set_deleted_state(None);
        }
    }

    /// Assign an identifier, register the entry and schedule the insert
    pub(super) fn save_transient(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<()> {
        let mapping = Arc::clone(self.instances.get(id)?.mapping());
        let identifier = match (mapping.id_generation(), self.instances.get(id)?.id()) {
            (IdGeneration::Assigned, Some(identifier)) => identifier.clone(),
            (IdGeneration::Assigned, None) => {
                return Err(Error::InvalidState(format!(
                    "identifier of {} must be assigned before persist",
                    mapping.name()
                )))
            }
            (IdGeneration::Sequence, _) => self.factory.store().next_identifier(mapping.name())?,
        };
        let key = EntityKey::new(mapping.name(), identifier.clone());
        if let Some(existing) = self.context.instance_for(&key) {
            if existing != id {
                return Err(Error::NonUniqueObject(key));
            }
        }

        {
            let instance = self.instances.get_mut(id)?;
            instance.set_id(Some(identifier.clone()));
            if mapping.is_versioned() {
                instance.set_version(Some(Version::INITIAL));
            }
        }

        self.cascade(id, CascadePoint::ToOne, ctx)?;

        let version = self.instances.get(id)?.version();
        let entry = EntityEntry::new(EntityStatus::Saving, key.clone(), Arc::clone(&mapping), None, version, false);
        self.context.add_entity(id, entry)?;
        self.actions.add_insert(EntityInsertAction {
            instance: id,
            key: key.clone(),
        });
        self.register_collections(id, &identifier, &mapping);
        debug!(target: "dormant::session", %key, "Insert scheduled");

        self.cascade(id, CascadePoint::Collections, ctx)?;
        if let Some(entry) = self.context.entry_mut(id) {
            entry.set_status(EntityStatus::Managed);
        }
        Ok(())
    }

    /// Copy the state of `id` onto the managed instance with the same
    /// identity and return that instance
    ///
    /// Transient instances are copied into a new instance that is
    /// persisted; detached ones are copied onto the managed instance,
    /// loading it first if needed. MERGE cascades along the associations
    /// that include it and a merge map shared by the whole cascade keeps
    /// cyclic graphs from being copied twice.
    ///
    /// # Errors
    ///
    /// - [`Error::StaleObjectState`] when a detached versioned instance is
    ///   older than its row, or its row is gone
    /// - [`Error::ObjectDeleted`] when the managed instance is removed
    pub fn merge(&mut self, id: InstanceId) -> Result<InstanceId> {
        self.ensure_open()?;
        let mut ctx = CascadeContext::new(CascadeAction::Merge);
        let result = self.merge_with(id, &mut ctx);
        self.guard(result)
    }

    pub(super) fn merge_with(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<InstanceId> {
        if let Some(copy) = ctx.merged(id) {
            return Ok(copy);
        }
        match self.entity_state(id)? {
            EntityState::Managed => {
                ctx.record_merge(id, id);
                self.cascade(id, CascadePoint::All, ctx)?;
                Ok(id)
            }
            EntityState::Removed => Err(Error::ObjectDeleted(self.key_of(id)?)),
            EntityState::Transient => self.merge_transient(id, ctx),
            EntityState::Detached => self.merge_detached(id, ctx),
        }
    }

    fn merge_transient(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<InstanceId> {
        let source = self.instances.get(id)?;
        let mut copy = EntityInstance::new(Arc::clone(source.mapping()));
        if source.mapping().id_generation() == IdGeneration::Assigned {
            copy.set_id(source.id().cloned());
        }
        let copy = self.instances.insert(copy);
        ctx.record_merge(id, copy);
        ctx.record_merge(copy, copy);

        self.copy_state(id, copy, ctx)?;
        self.save_transient(copy, ctx)?;
        debug!(target: "dormant::session", source = %id, managed = %copy, "Transient instance merged");
        Ok(copy)
    }

    fn merge_detached(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<InstanceId> {
        let key = self.key_of(id)?;
        let (versioned, source_version) = {
            let source = self.instances.get(id)?;
            (source.mapping().is_versioned(), source.version())
        };

        let managed = match self.context.instance_for(&key) {
            Some(managed) => Some(managed),
            None => self.load_by_key(&key)?,
        };
        let Some(managed) = managed else {
            if versioned {
                return Err(Error::StaleObjectState {
                    key,
                    expected: source_version,
                    actual: None,
                });
            }
            // Unversioned row is gone: the instance is saved again
            return self.merge_transient(id, ctx);
        };

        let entry = self.managed_entry(managed, "merge")?;
        if entry.status().is_deleted_or_gone() {
            return Err(Error::ObjectDeleted(key));
        }
        if versioned && entry.version() != source_version {
            return Err(Error::StaleObjectState {
                key,
                expected: source_version,
                actual: entry.version(),
            });
        }

        ctx.record_merge(id, managed);
        ctx.record_merge(managed, managed);
        self.copy_state(id, managed, ctx)?;
        debug!(target: "dormant::session", %key, "Detached instance merged");
        Ok(managed)
    }

    /// Copy every property of `source` onto `target`, merging associations
    /// that cascade MERGE and resolving the others to managed instances
    fn copy_state(&mut self, source: InstanceId, target: InstanceId, ctx: &mut CascadeContext) -> Result<()> {
        let mapping = Arc::clone(self.instances.get(source)?.mapping());
        for (index, property) in mapping.properties().iter().enumerate() {
            let cascades = property.cascade_style().does_cascade(CascadeAction::Merge);
            let value = self.instances.get(source)?.value(index).clone();
            let copied = match (property.kind(), value) {
                (PropertyKind::Basic, value) => value,
                (_, PropertyValue::Entity(Some(element))) => {
                    PropertyValue::Entity(Some(self.merge_association(element, cascades, ctx)?))
                }
                (_, PropertyValue::Collection(elements)) => {
                    let mut merged = Vec::with_capacity(elements.len());
                    for element in elements {
                        merged.push(self.merge_association(element, cascades, ctx)?);
                    }
                    PropertyValue::Collection(merged)
                }
                (_, value) => value,
            };
            self.instances.get_mut(target)?.assign(index, copied)?;
        }
        Ok(())
    }

    fn merge_association(&mut self, element: InstanceId, cascades: bool, ctx: &mut CascadeContext) -> Result<InstanceId> {
        if cascades {
            self.context.increment_cascade_level();
            let merged = self.merge_with(element, ctx);
            self.context.decrement_cascade_level();
            return merged;
        }
        if let Some(copy) = ctx.merged(element) {
            return Ok(copy);
        }
        if self.entity_state(element)? == EntityState::Detached {
            let key = self.key_of(element)?;
            if let Some(managed) = self.context.instance_for(&key) {
                return Ok(managed);
            }
            if let Some(managed) = self.load_by_key(&key)? {
                return Ok(managed);
            }
        }
        Ok(element)
    }
}
