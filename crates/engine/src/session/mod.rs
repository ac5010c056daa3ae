//! Session: the unit of work over one persistence context
//!
//! A session owns its instance arena, persistence context and action
//! queue. Session operations are split across files:
//!
//! - `persist.rs`: persist and merge
//! - `remove.rs`: remove, detach and clear
//! - `load.rs`: find, refresh and hydration through the second-level cache
//! - `natural_id.rs`: lookups by natural id and their cache maintenance
//! - `flush.rs`: dirty checking and statement execution
//! - `lifecycle.rs`: transactions and closing
//!
//! # Entity states
//!
//! | state | meaning |
//! |---|---|
//! | transient | never persisted, unknown to the session |
//! | managed | tracked by the persistence context |
//! | removed | managed, scheduled for deletion |
//! | detached | tied to a row, but not tracked by this session |
//!
//! # Errors
//!
//! Persistence failures ([`Error::marks_rollback_only`]) raised while a
//! transaction is active mark it rollback-only.

mod flush;
mod lifecycle;
mod load;
mod natural_id;
mod persist;
mod remove;

use std::sync::Arc;

use tracing::trace;

use dormant_cache::{LockOwner, RegionAccessStrategy};
use dormant_core::{
    CascadeAction, CollectionKey, ColumnValue, EntityKey, EntityMapping, Error, IdGeneration, Identifier,
    PropertyKind, Result, TxId, Value, Version,
};

use crate::action::ActionQueue;
use crate::cascade::{cascade_targets, CascadeContext, CascadePoint};
use crate::collection::{CollectionEntry, CollectionRef};
use crate::config::FlushMode;
use crate::context::PersistenceContext;
use crate::entry::{EntityEntry, EntityStatus, LockMode};
use crate::factory::SessionFactory;
use crate::instance::{EntityInstance, InstanceId, Instances, PropertyValue};
use crate::transaction::Transaction;

/// Lifecycle state of an instance relative to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Never persisted
    Transient,
    /// Tracked by the persistence context
    Managed,
    /// Scheduled for deletion
    Removed,
    /// Persisted, but not tracked by this session
    Detached,
}

/// Unit of work over one persistence context
pub struct Session {
    factory: SessionFactory,
    instances: Instances,
    context: PersistenceContext,
    actions: ActionQueue,
    transaction: Option<Transaction>,
    flush_mode: FlushMode,
    version_checks: Vec<InstanceId>,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instances", &self.instances.len())
            .field("managed", &self.context.len())
            .field("queued_actions", &self.actions.len())
            .field("transaction", &self.transaction)
            .field("flush_mode", &self.flush_mode)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(factory: SessionFactory) -> Self {
        let config = factory.config();
        let context = PersistenceContext::new(config.default_read_only);
        let flush_mode = config.flush_mode;
        Self {
            factory,
            instances: Instances::new(),
            context,
            actions: ActionQueue::new(),
            transaction: None,
            flush_mode,
            version_checks: Vec::new(),
            closed: false,
        }
    }

    /// Factory this session was opened from
    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    /// Persistence context
    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    /// Actions waiting for the next flush
    pub fn action_queue(&self) -> &ActionQueue {
        &self.actions
    }

    /// Current flush mode
    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    /// Change when this session flushes
    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.flush_mode = mode;
    }

    // ------------------------------------------------------------------
    // Instances and properties
    // ------------------------------------------------------------------

    /// New transient instance of `entity`
    pub fn instantiate(&mut self, entity: &str) -> Result<InstanceId> {
        self.ensure_open()?;
        let mapping = Arc::clone(self.factory.model().entity(entity)?);
        Ok(self.instances.insert(EntityInstance::new(mapping)))
    }

    /// Instance behind `id`
    pub fn instance(&self, id: InstanceId) -> Result<&EntityInstance> {
        self.instances.get(id)
    }

    /// Identifier of `id`, if it has one
    pub fn identifier(&self, id: InstanceId) -> Result<Option<Identifier>> {
        Ok(self.instances.get(id)?.id().cloned())
    }

    /// Version of `id`, if it is versioned and was persisted
    pub fn version(&self, id: InstanceId) -> Result<Option<Version>> {
        Ok(self.instances.get(id)?.version())
    }

    /// Assign the identifier of an instance that is not yet persistent
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the instance is managed or
    /// detached: identifiers of persistent instances are immutable.
    pub fn set_identifier(&mut self, id: InstanceId, identifier: impl Into<Identifier>) -> Result<()> {
        if self.context.contains(id) || self.instances.get(id)?.has_persistent_identity() {
            return Err(Error::InvalidState(format!(
                "identifier of persistent {} can't change",
                id
            )));
        }
        self.instances.get_mut(id)?.set_id(Some(identifier.into()));
        Ok(())
    }

    /// Set a basic property
    pub fn set(&mut self, id: InstanceId, property: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.property_index(id, property)?;
        self.instances
            .get_mut(id)?
            .assign(index, PropertyValue::Basic(value.into()))
    }

    /// Value of a basic property
    pub fn get(&self, id: InstanceId, property: &str) -> Result<Value> {
        let index = self.property_index(id, property)?;
        match self.instances.get(id)?.value(index) {
            PropertyValue::Basic(value) => Ok(value.clone()),
            other => Err(self.mismatch(id, index, "basic", other)),
        }
    }

    /// Point a many-to-one property at `target`
    pub fn set_reference(&mut self, id: InstanceId, property: &str, target: Option<InstanceId>) -> Result<()> {
        if let Some(target) = target {
            self.instances.get(target)?;
        }
        let index = self.property_index(id, property)?;
        self.instances
            .get_mut(id)?
            .assign(index, PropertyValue::Entity(target))
    }

    /// Target of a many-to-one property
    pub fn get_reference(&self, id: InstanceId, property: &str) -> Result<Option<InstanceId>> {
        let index = self.property_index(id, property)?;
        match self.instances.get(id)?.value(index) {
            PropertyValue::Entity(target) => Ok(*target),
            other => Err(self.mismatch(id, index, "many-to-one", other)),
        }
    }

    /// Elements of a collection property
    pub fn elements(&self, id: InstanceId, property: &str) -> Result<Vec<InstanceId>> {
        let index = self.property_index(id, property)?;
        match self.instances.get(id)?.value(index) {
            PropertyValue::Collection(elements) => Ok(elements.clone()),
            other => Err(self.mismatch(id, index, "collection", other)),
        }
    }

    /// Replace the elements of a collection property
    pub fn set_elements(&mut self, id: InstanceId, property: &str, elements: Vec<InstanceId>) -> Result<()> {
        for element in &elements {
            self.instances.get(*element)?;
        }
        let index = self.property_index(id, property)?;
        self.instances
            .get_mut(id)?
            .assign(index, PropertyValue::Collection(elements))
    }

    /// Append `element` to a collection property
    pub fn add_element(&mut self, id: InstanceId, property: &str, element: InstanceId) -> Result<()> {
        let mut elements = self.elements(id, property)?;
        elements.push(element);
        self.set_elements(id, property, elements)
    }

    /// Remove `element` from a collection property. Returns whether it was
    /// present.
    pub fn remove_element(&mut self, id: InstanceId, property: &str, element: InstanceId) -> Result<bool> {
        let mut elements = self.elements(id, property)?;
        let before = elements.len();
        elements.retain(|e| *e != element);
        let removed = elements.len() != before;
        if removed {
            self.set_elements(id, property, elements)?;
        }
        Ok(removed)
    }

    fn property_index(&self, id: InstanceId, property: &str) -> Result<usize> {
        self.instances.get(id)?.mapping().require_property(property)
    }

    fn mismatch(&self, id: InstanceId, index: usize, expected: &str, found: &PropertyValue) -> Error {
        let (entity, property) = match self.instances.get(id) {
            Ok(instance) => (
                instance.entity_name().to_string(),
                instance.mapping().properties()[index].name().to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        };
        Error::TypeMismatch {
            entity,
            property,
            message: format!("expected a {} property, found {:?}", expected, found),
        }
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    /// Lifecycle state of `id`
    pub fn entity_state(&self, id: InstanceId) -> Result<EntityState> {
        let instance = self.instances.get(id)?;
        if let Some(entry) = self.context.entry(id) {
            return Ok(if entry.status().is_deleted_or_gone() {
                EntityState::Removed
            } else {
                EntityState::Managed
            });
        }
        if instance.has_persistent_identity() {
            return Ok(EntityState::Detached);
        }
        match instance.id() {
            None => Ok(EntityState::Transient),
            Some(_) if instance.mapping().id_generation() == IdGeneration::Assigned => Ok(EntityState::Transient),
            Some(_) => Ok(EntityState::Detached),
        }
    }

    /// Persistence context status of `id`, `None` if it is not managed
    pub fn status(&self, id: InstanceId) -> Option<EntityStatus> {
        self.context.entry(id).map(|entry| entry.status())
    }

    /// Whether `id` is managed and not removed
    pub fn contains(&self, id: InstanceId) -> bool {
        self.context
            .entry(id)
            .map_or(false, |entry| !entry.status().is_deleted_or_gone())
    }

    /// Whether changes to `id` are ignored at flush
    pub fn is_read_only(&self, id: InstanceId) -> Result<bool> {
        let entry = self.managed_entry(id, "is_read_only")?;
        Ok(entry.status() == EntityStatus::ReadOnly)
    }

    /// Make a managed instance read-only or modifiable again
    ///
    /// Switching back to modifiable takes the current state as the new
    /// baseline: changes made while read-only are never written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for removed instances and for making
    /// an instance of an immutable entity modifiable.
    pub fn set_read_only(&mut self, id: InstanceId, read_only: bool) -> Result<()> {
        let status = self.managed_entry(id, "set_read_only")?.status();
        if status.is_deleted_or_gone() {
            return Err(Error::InvalidState(format!("can't change read-only state of removed {}", id)));
        }
        if read_only {
            if let Some(entry) = self.context.entry_mut(id) {
                entry.set_status(EntityStatus::ReadOnly);
            }
            return Ok(());
        }
        if !self.instances.get(id)?.mapping().is_mutable() {
            return Err(Error::InvalidState(format!(
                "instance of immutable entity {} can't be made modifiable",
                self.instances.get(id)?.entity_name()
            )));
        }
        if status == EntityStatus::ReadOnly {
            let columns = self.columns_of(id)?;
            let version = self.instances.get(id)?.version();
            if let Some(entry) = self.context.entry_mut(id) {
                entry.set_loaded_state(columns);
                entry.set_version(version);
                entry.set_status(EntityStatus::Managed);
            }
        }
        Ok(())
    }

    /// Whether instances loaded from now on start read-only
    pub fn is_default_read_only(&self) -> bool {
        self.context.is_default_read_only()
    }

    /// Change the read-only default for instances loaded from now on
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.context.set_default_read_only(read_only);
    }

    /// Request an optimistic lock on a managed instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when an optimistic lock is requested
    /// on an unversioned entity, and [`Error::ObjectDeleted`] for removed
    /// instances.
    pub fn lock(&mut self, id: InstanceId, mode: LockMode) -> Result<()> {
        let entry = self.managed_entry(id, "lock")?;
        if entry.status().is_deleted_or_gone() {
            return Err(Error::ObjectDeleted(entry.key().clone()));
        }
        if mode != LockMode::None && !entry.mapping().is_versioned() {
            return Err(Error::InvalidState(format!(
                "{} is not versioned and can't be locked optimistically",
                entry.mapping().name()
            )));
        }
        trace!(target: "dormant::session", key = %entry.key(), ?mode, "Lock requested");
        if let Some(entry) = self.context.entry_mut(id) {
            entry.set_lock_mode(mode);
        }
        Ok(())
    }

    /// Lock mode of a managed instance
    pub fn lock_mode(&self, id: InstanceId) -> Result<LockMode> {
        Ok(self.managed_entry(id, "lock_mode")?.lock_mode())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::InvalidState("session is closed".into()))
        } else {
            Ok(())
        }
    }

    fn managed_entry(&self, id: InstanceId, operation: &'static str) -> Result<&EntityEntry> {
        match self.context.entry(id) {
            Some(entry) => Ok(entry),
            None => Err(self.not_managed(id, operation)),
        }
    }

    fn not_managed(&self, id: InstanceId, operation: &'static str) -> Error {
        match self.instances.get(id) {
            Ok(instance) => match (instance.has_persistent_identity(), instance.id()) {
                (true, Some(identifier)) => Error::DetachedEntity {
                    operation,
                    key: EntityKey::new(instance.entity_name(), identifier.clone()),
                },
                _ => Error::InvalidState(format!("{} passed to {} is not managed", id, operation)),
            },
            Err(e) => e,
        }
    }

    /// Mark the transaction rollback-only on persistence failures
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.marks_rollback_only() {
                if let Some(tx) = self.transaction.as_mut() {
                    tx.set_rollback_only();
                }
            }
        }
        result
    }

    fn tx_id(&self) -> Option<TxId> {
        self.transaction.as_ref().map(Transaction::id)
    }

    fn lock_owner(&self) -> LockOwner {
        LockOwner::current(self.tx_id())
    }

    fn entity_cache(&self, entity: &str) -> Option<Arc<dyn RegionAccessStrategy>> {
        self.factory.entity_cache(entity).cloned()
    }

    fn collection_cache(&self, role: &str) -> Option<Arc<dyn RegionAccessStrategy>> {
        self.factory.collection_cache(role).cloned()
    }

    /// Key of an instance that has an identifier
    fn key_of(&self, id: InstanceId) -> Result<EntityKey> {
        let instance = self.instances.get(id)?;
        match instance.id() {
            Some(identifier) => Ok(EntityKey::new(instance.entity_name(), identifier.clone())),
            None => Err(Error::InvalidState(format!(
                "{} of {} has no identifier",
                id,
                instance.entity_name()
            ))),
        }
    }

    /// Column image of the current state. References to instances removed
    /// in this session are written as NULL.
    fn columns_of(&self, id: InstanceId) -> Result<Vec<ColumnValue>> {
        let instance = self.instances.get(id)?;
        instance
            .state()
            .iter()
            .map(|value| {
                Ok(match value {
                    PropertyValue::Basic(v) => ColumnValue::Value(v.clone()),
                    PropertyValue::Entity(None) => ColumnValue::Reference(None),
                    PropertyValue::Entity(Some(target)) => self.reference_column(*target)?,
                    PropertyValue::Collection(_) => ColumnValue::Collection,
                })
            })
            .collect()
    }

    fn reference_column(&self, target: InstanceId) -> Result<ColumnValue> {
        let instance = self.instances.get(target)?;
        let Some(identifier) = instance.id() else {
            return Ok(ColumnValue::Reference(None));
        };
        let key = EntityKey::new(instance.entity_name(), identifier.clone());
        if self.context.is_nullifiable(&key) {
            return Ok(ColumnValue::Reference(None));
        }
        Ok(ColumnValue::Reference(Some(identifier.clone())))
    }

    /// Track a collection entry for every collection property of `id`
    fn register_collections(&mut self, id: InstanceId, identifier: &Identifier, mapping: &EntityMapping) {
        for (index, property) in mapping.associations() {
            if let PropertyKind::OneToMany { mapped_by, .. } = property.kind() {
                let role = mapping.collection_role(index);
                let key = CollectionKey::new(role.clone(), identifier.clone());
                self.context.add_collection(
                    CollectionRef::new(id, index),
                    CollectionEntry::new_collection(role, key, mapped_by.is_some()),
                );
            }
        }
    }

    /// Apply the context's action to every association of `id` at `point`
    fn cascade(&mut self, id: InstanceId, point: CascadePoint, ctx: &mut CascadeContext) -> Result<()> {
        let targets = cascade_targets(self.instances.get(id)?, ctx.action(), point);
        if targets.is_empty() {
            return Ok(());
        }
        self.context.increment_cascade_level();
        let result = targets
            .into_iter()
            .try_for_each(|(_, target)| self.cascade_to(target, ctx));
        self.context.decrement_cascade_level();
        result
    }

    fn cascade_to(&mut self, target: InstanceId, ctx: &mut CascadeContext) -> Result<()> {
        match ctx.action() {
            CascadeAction::Persist => self.persist_with(target, ctx),
            CascadeAction::Merge => self.merge_with(target, ctx).map(|_| ()),
            CascadeAction::Remove => self.remove_with(target, ctx),
            CascadeAction::Refresh => self.refresh_with(target, ctx),
            CascadeAction::Detach => self.detach_with(target, ctx),
        }
    }
}
