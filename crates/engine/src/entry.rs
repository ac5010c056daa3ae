//! Entity entries
//!
//! An [`EntityEntry`] is the persistence context's bookkeeping for one
//! managed instance: its key, lifecycle status, the column image last
//! synchronised with the store and the version that image carries.

use std::fmt;
use std::sync::Arc;

use dormant_core::{ColumnValue, EntityKey, EntityMapping, Version};

/// Lifecycle status of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Tracked and dirty-checked
    Managed,
    /// Tracked but never dirty-checked or updated
    ReadOnly,
    /// Scheduled for deletion at the next flush
    Deleted,
    /// Deleted in the store, awaiting eviction from the context
    Gone,
    /// Being assembled from a row
    Loading,
    /// Being persisted
    Saving,
}

impl EntityStatus {
    /// Whether the instance is deleted or about to be
    pub fn is_deleted_or_gone(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Gone)
    }

    /// Status name
    pub fn name(self) -> &'static str {
        match self {
            EntityStatus::Managed => "MANAGED",
            EntityStatus::ReadOnly => "READ_ONLY",
            EntityStatus::Deleted => "DELETED",
            EntityStatus::Gone => "GONE",
            EntityStatus::Loading => "LOADING",
            EntityStatus::Saving => "SAVING",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock held on a managed instance for the rest of the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    /// No lock
    #[default]
    None,
    /// Version checked against the store at flush
    Optimistic,
    /// Version incremented at flush even if nothing changed
    OptimisticForceIncrement,
}

/// Persistence context entry of one instance
#[derive(Debug, Clone)]
pub struct EntityEntry {
    status: EntityStatus,
    previous_status: Option<EntityStatus>,
    key: EntityKey,
    mapping: Arc<EntityMapping>,
    loaded_state: Option<Vec<ColumnValue>>,
    deleted_state: Option<Vec<ColumnValue>>,
    version: Option<Version>,
    exists_in_database: bool,
    lock_mode: LockMode,
    sequence: u64,
}

impl EntityEntry {
    pub(crate) fn new(
        status: EntityStatus,
        key: EntityKey,
        mapping: Arc<EntityMapping>,
        loaded_state: Option<Vec<ColumnValue>>,
        version: Option<Version>,
        exists_in_database: bool,
    ) -> Self {
        Self {
            status,
            previous_status: None,
            key,
            mapping,
            loaded_state,
            deleted_state: None,
            version,
            exists_in_database,
            lock_mode: LockMode::None,
            sequence: 0,
        }
    }

    /// Current status
    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// Status before the last transition
    pub fn previous_status(&self) -> Option<EntityStatus> {
        self.previous_status
    }

    pub(crate) fn set_status(&mut self, status: EntityStatus) {
        if status != self.status {
            self.previous_status = Some(self.status);
            self.status = status;
        }
    }

    /// Entity key
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Entity mapping
    pub fn mapping(&self) -> &Arc<EntityMapping> {
        &self.mapping
    }

    /// Column image last read from or written to the store
    pub fn loaded_state(&self) -> Option<&[ColumnValue]> {
        self.loaded_state.as_deref()
    }

    pub(crate) fn set_loaded_state(&mut self, state: Vec<ColumnValue>) {
        self.loaded_state = Some(state);
    }

    /// Column image captured when the instance was removed
    pub fn deleted_state(&self) -> Option<&[ColumnValue]> {
        self.deleted_state.as_deref()
    }

    pub(crate) fn set_deleted_state(&mut self, state: Option<Vec<ColumnValue>>) {
        self.deleted_state = state;
    }

    /// Version of the loaded state
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }

    /// Whether the row has been inserted
    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    pub(crate) fn set_exists_in_database(&mut self, exists: bool) {
        self.exists_in_database = exists;
    }

    /// Current lock mode
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub(crate) fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    /// Whether changes to the instance are written at flush
    pub fn is_modifiable(&self) -> bool {
        self.status == EntityStatus::Managed && self.mapping.is_mutable()
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }
}
