//! Error types for Dormant
//!
//! This module defines the error hierarchy surfaced by every crate in the
//! workspace. Persistence failures are typed so callers can react to the
//! condition rather than the message:
//!
//! - optimistic-lock failures: [`Error::StaleObjectState`]
//! - constraint violations reported by the store: [`Error::ConstraintViolation`]
//! - missing rows: [`Error::EntityNotFound`]
//! - misuse of the session API: [`Error::TransientObject`],
//!   [`Error::DetachedEntity`], [`Error::NonUniqueObject`], ...
//!
//! Stale second-level cache puts are never errors; they are dropped and
//! counted.

use crate::natural_id::NaturalId;
use crate::types::EntityKey;
use crate::version::Version;
use std::io;
use thiserror::Error;

/// Result type alias for Dormant operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Dormant operations
#[derive(Debug, Error)]
pub enum Error {
    /// Row was updated or deleted by another transaction
    #[error("row was updated or deleted by another transaction: {key} (expected {expected:?}, found {actual:?})")]
    StaleObjectState {
        /// Entity whose row changed underneath the session
        key: EntityKey,
        /// Version the session last saw
        expected: Option<Version>,
        /// Version found in the store, `None` if the row is gone
        actual: Option<Version>,
    },

    /// The store rejected a write
    #[error("constraint violation [{constraint}]: {message}")]
    ConstraintViolation {
        /// Constraint name, e.g. `PRIMARY KEY` or `FK Order.customer`
        constraint: String,
        /// Human-readable description
        message: String,
    },

    /// No row exists for the key
    #[error("no row with the given identifier exists: {0}")]
    EntityNotFound(EntityKey),

    /// Another instance with the same key is already managed
    #[error("a different instance with the same identifier is already managed: {0}")]
    NonUniqueObject(EntityKey),

    /// An association references an instance that was never persisted
    #[error("{entity}.{property} references an unsaved transient instance; persist it before flushing")]
    TransientObject {
        /// Owning entity name
        entity: String,
        /// Association property
        property: String,
    },

    /// A not-null property holds null or an unsaved reference
    #[error("not-null property references a null or transient value: {entity}.{property}")]
    PropertyValue {
        /// Owning entity name
        entity: String,
        /// Offending property
        property: String,
    },

    /// An immutable natural id was changed on a persistent instance
    #[error("immutable natural id of {key} was altered from {from} to {to}")]
    NaturalIdAltered {
        /// Instance whose natural id changed
        key: EntityKey,
        /// Natural id the row holds
        from: NaturalId,
        /// Natural id the instance holds now
        to: NaturalId,
    },

    /// Cascade reached an instance scheduled for deletion
    #[error("removed instance would be re-saved by cascade (remove it from its associations): {0}")]
    ObjectDeleted(EntityKey),

    /// Operation not allowed on a detached instance
    #[error("detached instance passed to {operation}: {key}")]
    DetachedEntity {
        /// Session operation name
        operation: &'static str,
        /// Key of the detached instance
        key: EntityKey,
    },

    /// Instance handle unknown to the session
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// Entity name not present in the mapping model
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// Property name not present on the entity
    #[error("unknown property: {entity}.{property}")]
    UnknownProperty {
        /// Entity name
        entity: String,
        /// Property name
        property: String,
    },

    /// Value does not fit the property kind
    #[error("type mismatch for {entity}.{property}: {message}")]
    TypeMismatch {
        /// Entity name
        entity: String,
        /// Property name
        property: String,
        /// What was expected
        message: String,
    },

    /// Invalid mapping model
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Operation requires an active transaction
    #[error("no transaction is in progress")]
    TransactionRequired,

    /// Transaction could not complete
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Second-level cache failure
    #[error("cache error: {0}")]
    Cache(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Store failure not covered by a more specific variant
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a constraint violation
    pub fn constraint(constraint: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConstraintViolation {
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    /// Whether this is an optimistic-lock failure
    pub fn is_optimistic_lock_failure(&self) -> bool {
        matches!(self, Error::StaleObjectState { .. })
    }

    /// Whether this is a constraint violation reported by the store
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::ConstraintViolation { .. })
    }

    /// Whether the failure leaves the current transaction unusable
    ///
    /// Persistence failures (store, locking, graph state) mark the transaction
    /// rollback-only; argument errors such as an unknown property do not.
    pub fn marks_rollback_only(&self) -> bool {
        matches!(
            self,
            Error::StaleObjectState { .. }
                | Error::ConstraintViolation { .. }
                | Error::EntityNotFound(_)
                | Error::TransientObject { .. }
                | Error::PropertyValue { .. }
                | Error::NaturalIdAltered { .. }
                | Error::ObjectDeleted(_)
                | Error::Storage(_)
                | Error::Io(_)
        )
    }
}
