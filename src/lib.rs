//! Dormant - unit of work and transactional second-level cache for
//! object/relational mapping
//!
//! Dormant tracks entity instances in a session-scoped persistence context,
//! detects changes by comparing them with the state last read from the
//! store, and writes inserts, updates and deletes in foreign-key safe order
//! at flush. Entities can be looked up by identifier or by natural id. A
//! second-level cache shared by all sessions is kept consistent with the
//! store by the put-from-load validator.
//!
//! # Quick Start
//!
//! ```
//! use dormant::{CascadeStyle, EntityMapping, MappingModel, PropertyMapping, SessionFactory};
//!
//! let model = MappingModel::builder()
//!     .entity(
//!         EntityMapping::new("Author")
//!             .versioned()
//!             .property(PropertyMapping::basic("name"))
//!             .property(PropertyMapping::one_to_many("books", "Book").cascade(CascadeStyle::ALL)),
//!     )
//!     .entity(EntityMapping::new("Book").property(PropertyMapping::basic("title")))
//!     .build()?;
//! let factory = SessionFactory::builder(model).build()?;
//!
//! let mut session = factory.open_session();
//! session.begin_transaction()?;
//! let author = session.instantiate("Author")?;
//! session.set(author, "name", "Le Guin")?;
//! let book = session.instantiate("Book")?;
//! session.set(book, "title", "The Dispossessed")?;
//! session.add_element(author, "books", book)?;
//! session.persist(author)?;
//! session.commit()?;
//!
//! assert_eq!(factory.statistics().entity_inserts, 2);
//! # Ok::<(), dormant::Error>(())
//! ```
//!
//! # Architecture
//!
//! - `dormant-core`: mapping model, identifiers, values, rows, errors and
//!   the store seam
//! - `dormant-storage`: transactional in-memory store
//! - `dormant-cache`: regions, access strategies, put-from-load validator
//! - `dormant-engine`: sessions, persistence context, flush and cascades

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod logging;

pub use dormant_cache::{
    AccessType, CacheEntry, CacheKey, CacheRegion, CacheSettings, Clock, InMemoryRegionFactory, LockOwner,
    ManualClock, PutFromLoadValidator, RegionAccessStrategy, RegionFactory, RegionSettings, SystemClock,
    ValidatorSettings,
};
pub use dormant_core::{
    CascadeAction, CascadeStyle, CollectionKey, ColumnValue, EntityKey, EntityMapping, EntityStore, Error,
    IdGeneration, Identifier, MappingModel, NaturalId, PropertyKind, PropertyMapping, Result, Row, Synchronization,
    SynchronizationRegistry, TransactionOutcome, TxId, Value, Version,
};
pub use dormant_engine::{
    EntityState, EntityStatus, FlushMode, InstanceId, LockMode, NaturalIdResolution, PersistenceContext, Session,
    SessionFactory,
    SessionFactoryBuilder, SessionFactoryConfig, StatisticsSnapshot, TransactionStatus,
};
pub use dormant_storage::MemoryStore;

/// Lower layers, for callers that need more than the facade
pub mod layers {
    pub use dormant_cache as cache;
    pub use dormant_core as core;
    pub use dormant_engine as engine;
    pub use dormant_storage as storage;
}
