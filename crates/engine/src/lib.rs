//! Session engine for Dormant
//!
//! This crate implements the unit of work on top of the store and cache
//! layers:
//! - Session: persist, merge, remove, find, refresh, detach, flush
//! - Persistence context: one managed instance per row, entity and
//!   collection entries, read-only tracking
//! - Flush: cascades, dirty checking, version increments and foreign-key
//!   ordered statement execution
//! - Session factory: shared store, second-level cache strategies,
//!   statistics
//!
//! The engine is the only component that knows about:
//! - Entity instances and their lifecycle states
//! - Cascades along mapped associations
//! - When cached entries must be invalidated

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod cascade;
pub mod collection;
pub mod config;
pub mod context;
pub mod dirty;
pub mod entry;
pub mod factory;
pub mod instance;
pub mod ordering;
pub mod session;
pub mod stats;
pub mod transaction;

pub use action::{ActionQueue, CollectionRowsAction, EntityDeleteAction, EntityInsertAction, EntityUpdateAction};
pub use cascade::{CascadeContext, CascadePoint};
pub use collection::{CollectionAction, CollectionEntry, CollectionRef};
pub use config::{FlushMode, SessionFactoryConfig};
pub use context::{NaturalIdResolution, PersistenceContext};
pub use entry::{EntityEntry, EntityStatus, LockMode};
pub use factory::{SessionFactory, SessionFactoryBuilder};
pub use instance::{EntityInstance, InstanceId, PropertyValue};
pub use session::{EntityState, Session};
pub use stats::{Statistics, StatisticsSnapshot};
pub use transaction::{Transaction, TransactionStatus};
