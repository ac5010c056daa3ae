//! Core types and traits for Dormant
//!
//! This crate defines the foundational types used throughout the system:
//! - Identifier, EntityKey, CollectionKey, TxId: identity of rows and transactions
//! - Value: basic property values with dirty-checking sameness
//! - Version: optimistic-lock versions
//! - MappingModel: resolved entity/property metadata
//! - NaturalId: business key of an entity, resolvable to its identifier
//! - CascadeAction, CascadeStyle: cascade configuration per association
//! - Row, ColumnValue: row images exchanged with the store
//! - Error: error type hierarchy
//! - Traits: EntityStore (statement executor) and transaction synchronizations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cascade;
pub mod error;
pub mod mapping;
pub mod natural_id;
pub mod row;
pub mod traits;
pub mod types;
pub mod value;
pub mod version;

pub use cascade::{CascadeAction, CascadeStyle};
pub use error::{Error, Result};
pub use mapping::{
    EntityMapping, IdGeneration, MappingModel, MappingModelBuilder, PropertyKind, PropertyMapping,
};
pub use natural_id::NaturalId;
pub use row::{ColumnValue, Row};
pub use traits::{
    EntityStore, Synchronization, SynchronizationRegistry, TransactionOutcome,
};
pub use types::{CollectionKey, EntityKey, Identifier, TxId};
pub use value::Value;
pub use version::Version;
