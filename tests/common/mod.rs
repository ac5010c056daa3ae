//! Shared test utilities for the integration suites.
//!
//! Import via `mod common;` from any test file.

#![allow(dead_code)]

use std::sync::Arc;

pub use dormant::{
    CascadeStyle, EntityKey, EntityMapping, EntityState, EntityStatus, Error, Identifier, InMemoryRegionFactory,
    InstanceId, LockMode, ManualClock, MappingModel, MemoryStore, PropertyMapping, Session, SessionFactory,
    SessionFactoryConfig, Value, Version,
};
use dormant::{CacheSettings, EntityStore};

// ============================================================================
// Models
// ============================================================================

/// Author (versioned, cached) owning a cascaded collection of books. Books
/// point back at their author through a nullable many-to-one.
pub fn library_model() -> MappingModel {
    MappingModel::builder()
        .entity(
            EntityMapping::new("Author")
                .versioned()
                .cacheable("library")
                .property(PropertyMapping::basic("name"))
                .property(PropertyMapping::one_to_many("books", "Book").cascade(CascadeStyle::ALL_DELETE_ORPHAN)),
        )
        .entity(
            EntityMapping::new("Book")
                .versioned()
                .cacheable("library")
                .property(PropertyMapping::basic("title").not_null())
                .property(PropertyMapping::many_to_one("author", "Author")),
        )
        .build()
        .expect("library model")
}

/// Department / employee graph with references in both directions
pub fn company_model() -> MappingModel {
    MappingModel::builder()
        .entity(
            EntityMapping::new("Department")
                .property(PropertyMapping::basic("name"))
                .property(PropertyMapping::many_to_one("manager", "Employee")),
        )
        .entity(
            EntityMapping::new("Employee")
                .property(PropertyMapping::basic("name"))
                .property(PropertyMapping::many_to_one("department", "Department").not_null())
                .property(PropertyMapping::many_to_one("mentor", "Employee")),
        )
        .build()
        .expect("company model")
}

// ============================================================================
// Factories
// ============================================================================

/// Factory plus direct handles on its store and clock
pub struct TestFactory {
    pub factory: SessionFactory,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl TestFactory {
    /// Factory over `model` with the default (transactional) cache
    pub fn cached(model: MappingModel) -> Self {
        Self::build(model, SessionFactoryConfig::default())
    }

    /// Factory over `model` with the cache disabled
    pub fn uncached(model: MappingModel) -> Self {
        Self::build(model, SessionFactoryConfig::without_cache())
    }

    /// Factory over `model` with `config`
    pub fn build(model: MappingModel, config: SessionFactoryConfig) -> Self {
        dormant::logging::init_test();
        let store = Arc::new(MemoryStore::new(Arc::new(model.clone())));
        let clock = Arc::new(ManualClock::new(1_000));
        let regions = Arc::new(InMemoryRegionFactory::with_clock(
            config.cache.clone(),
            Arc::clone(&clock) as Arc<dyn dormant::Clock>,
        ));
        let factory = SessionFactory::builder(model)
            .store(Arc::clone(&store) as Arc<dyn EntityStore>)
            .region_factory(regions)
            .config(config)
            .build()
            .expect("session factory");
        Self { factory, store, clock }
    }

    pub fn session(&self) -> Session {
        self.factory.open_session()
    }

    /// Move the cache clock past every pending invalidation window
    pub fn tick(&self) {
        self.clock.advance(CacheSettings::default().validator.naked_put_invalidation_period_ms + 1);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Persist an author with the given book titles and commit. Returns the
/// author's identifier.
pub fn seed_author(factory: &SessionFactory, name: &str, titles: &[&str]) -> Identifier {
    let mut session = factory.open_session();
    session.begin_transaction().expect("begin");
    let author = session.instantiate("Author").expect("author");
    session.set(author, "name", name).expect("name");
    for title in titles {
        let book = session.instantiate("Book").expect("book");
        session.set(book, "title", *title).expect("title");
        session.set_reference(book, "author", Some(author)).expect("author ref");
        session.add_element(author, "books", book).expect("add book");
    }
    session.persist(author).expect("persist");
    session.commit().expect("commit");
    session.identifier(author).expect("instance").expect("identifier")
}

/// Title of every book of `author`, sorted
pub fn titles(session: &Session, author: InstanceId) -> Vec<String> {
    let mut titles: Vec<String> = session
        .elements(author, "books")
        .expect("books")
        .into_iter()
        .map(|book| match session.get(book, "title").expect("title") {
            Value::String(s) => s,
            other => panic!("unexpected title {:?}", other),
        })
        .collect();
    titles.sort();
    titles
}
