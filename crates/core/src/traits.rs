//! Core trait definitions
//!
//! This module defines the seams between the persistence engine and its
//! external collaborators:
//!
//! - [`EntityStore`]: the statement executor. Every write happens inside a
//!   store transaction identified by a [`TxId`]; the engine never renders SQL.
//! - [`Synchronization`]: callbacks invoked around transaction completion,
//!   used by the second-level cache to react to commit and rollback.
//! - [`SynchronizationRegistry`]: where synchronizations are registered for
//!   the current transaction.

use crate::error::Result;
use crate::natural_id::NaturalId;
use crate::row::Row;
use crate::types::{CollectionKey, EntityKey, Identifier, TxId};
use crate::version::Version;

/// Statement executor for entity and collection rows
///
/// Implementations must be thread-safe: a session factory shares one store
/// across all sessions.
///
/// # Errors
///
/// - [`Error::ConstraintViolation`](crate::Error::ConstraintViolation) when a
///   write breaks a primary-key, not-null, foreign-key or natural-id
///   uniqueness constraint
/// - [`Error::StaleObjectState`](crate::Error::StaleObjectState) when an update
///   or delete finds a different version (or no row)
/// - [`Error::Transaction`](crate::Error::Transaction) when `tx` is not active
pub trait EntityStore: Send + Sync {
    /// Start a store transaction
    fn begin(&self, tx: TxId) -> Result<()>;

    /// Make the transaction's writes permanent
    fn commit(&self, tx: TxId) -> Result<()>;

    /// Undo the transaction's writes
    fn rollback(&self, tx: TxId) -> Result<()>;

    /// Next value of the entity's identifier sequence
    fn next_identifier(&self, entity: &str) -> Result<Identifier>;

    /// Read a row as seen by `tx` (committed state plus the transaction's own
    /// writes), `None` if absent
    fn load(&self, tx: Option<TxId>, key: &EntityKey) -> Result<Option<Row>>;

    /// Identifier of the `entity` row holding `natural_id` as seen by `tx`,
    /// `None` if no row does
    fn resolve_natural_id(&self, tx: Option<TxId>, entity: &str, natural_id: &NaturalId) -> Result<Option<Identifier>>;

    /// Insert a new row
    fn insert(&self, tx: TxId, key: &EntityKey, row: Row) -> Result<()>;

    /// Overwrite a row whose version must currently be `expected`
    fn update(&self, tx: TxId, key: &EntityKey, row: Row, expected: Option<Version>) -> Result<()>;

    /// Delete a row whose version must currently be `expected`
    fn delete(&self, tx: TxId, key: &EntityKey, expected: Option<Version>) -> Result<()>;

    /// Element identifiers of a collection as seen by `tx`, empty if it has
    /// no rows
    fn load_collection(&self, tx: Option<TxId>, key: &CollectionKey) -> Result<Vec<Identifier>>;

    /// Replace all rows of a collection
    fn write_collection(&self, tx: TxId, key: &CollectionKey, elements: Vec<Identifier>) -> Result<()>;

    /// Delete all rows of a collection
    fn remove_collection(&self, tx: TxId, key: &CollectionKey) -> Result<()>;
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    /// Changes were committed
    Committed,
    /// Changes were rolled back
    RolledBack,
}

impl TransactionOutcome {
    /// Whether the transaction committed
    pub fn is_committed(self) -> bool {
        matches!(self, TransactionOutcome::Committed)
    }
}

/// Callback around transaction completion
pub trait Synchronization: Send {
    /// Invoked before the store commits; an error rolls the transaction back
    fn before_completion(&mut self) -> Result<()> {
        Ok(())
    }

    /// Invoked once the outcome is known
    fn after_completion(&mut self, outcome: TransactionOutcome);
}

/// Registry of synchronizations for the current transaction
pub trait SynchronizationRegistry {
    /// Register a synchronization
    fn register_synchronization(&mut self, synchronization: Box<dyn Synchronization>);
}

impl SynchronizationRegistry for Vec<Box<dyn Synchronization>> {
    fn register_synchronization(&mut self, synchronization: Box<dyn Synchronization>) {
        self.push(synchronization);
    }
}
