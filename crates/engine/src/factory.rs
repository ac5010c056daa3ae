//! Session factory
//!
//! The factory is the shared, thread-safe half of the engine: mapping
//! model, store, configuration, second-level cache access strategies and
//! statistics. Sessions are cheap, single-owner views opened from it.
//!
//! # Caching
//!
//! Every entity mapped with `cacheable(region)` gets the access strategy of
//! that region, built through the configured [`RegionFactory`]. Collections
//! of a cacheable owner are cached in the owner's region, except inverse
//! collections, whose elements are found through the element rows.
//! Natural-id resolutions of a cacheable entity get their own region,
//! `"<region>##NaturalId"`, with the entity region's access type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::info;

use dormant_cache::{Clock, InMemoryRegionFactory, RegionAccessStrategy, RegionFactory, SystemClock};
use dormant_core::{EntityStore, MappingModel, Result, TxId};
use dormant_storage::MemoryStore;

use crate::config::SessionFactoryConfig;
use crate::session::Session;
use crate::stats::{Statistics, StatisticsSnapshot};

/// Shared factory of sessions
///
/// Cloning is cheap: clones share the same store, caches and statistics.
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    model: Arc<MappingModel>,
    store: Arc<dyn EntityStore>,
    config: SessionFactoryConfig,
    region_factory: Option<Arc<dyn RegionFactory>>,
    entity_caches: FxHashMap<String, Arc<dyn RegionAccessStrategy>>,
    collection_caches: FxHashMap<String, Arc<dyn RegionAccessStrategy>>,
    natural_id_caches: FxHashMap<String, Arc<dyn RegionAccessStrategy>>,
    clock: Arc<dyn Clock>,
    next_tx: AtomicU64,
    stats: Statistics,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.inner.model.len())
            .field("cached_entities", &self.inner.entity_caches.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl SessionFactory {
    /// Start building a factory for `model`
    pub fn builder(model: MappingModel) -> SessionFactoryBuilder {
        SessionFactoryBuilder::new(model)
    }

    /// Open a new session
    pub fn open_session(&self) -> Session {
        self.inner.stats.record_session_opened();
        Session::new(self.clone())
    }

    /// Mapping model
    pub fn model(&self) -> &Arc<MappingModel> {
        &self.inner.model
    }

    /// Statement executor shared by all sessions
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.inner.store
    }

    /// Configuration the factory was built with
    pub fn config(&self) -> &SessionFactoryConfig {
        &self.inner.config
    }

    /// Region factory, if the second-level cache is enabled
    pub fn region_factory(&self) -> Option<&Arc<dyn RegionFactory>> {
        self.inner.region_factory.as_ref()
    }

    /// Access strategy caching `entity`, if it is cacheable
    pub fn entity_cache(&self, entity: &str) -> Option<&Arc<dyn RegionAccessStrategy>> {
        self.inner.entity_caches.get(entity)
    }

    /// Access strategy caching the collection `role`, if it is cacheable
    pub fn collection_cache(&self, role: &str) -> Option<&Arc<dyn RegionAccessStrategy>> {
        self.inner.collection_caches.get(role)
    }

    /// Access strategy caching the natural-id resolutions of `entity`
    pub fn natural_id_cache(&self, entity: &str) -> Option<&Arc<dyn RegionAccessStrategy>> {
        self.inner.natural_id_caches.get(entity)
    }

    /// Time source used for put-from-load timestamps
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Evict every cached entity, collection and natural-id resolution
    pub fn evict_all(&self) {
        for strategy in self.inner.entity_caches.values() {
            strategy.evict_all();
        }
        for strategy in self.inner.natural_id_caches.values() {
            strategy.evict_all();
        }
    }

    /// Current statistics
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    pub(crate) fn stats(&self) -> &Statistics {
        &self.inner.stats
    }

    pub(crate) fn next_transaction_id(&self) -> TxId {
        TxId::new(self.inner.next_tx.fetch_add(1, Ordering::Relaxed))
    }
}

/// Builder for [`SessionFactory`]
pub struct SessionFactoryBuilder {
    model: MappingModel,
    store: Option<Arc<dyn EntityStore>>,
    config: SessionFactoryConfig,
    region_factory: Option<Arc<dyn RegionFactory>>,
}

impl SessionFactoryBuilder {
    fn new(model: MappingModel) -> Self {
        Self {
            model,
            store: None,
            config: SessionFactoryConfig::default(),
            region_factory: None,
        }
    }

    /// Statement executor; defaults to a fresh [`MemoryStore`]
    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Configuration; defaults to [`SessionFactoryConfig::default`]
    pub fn config(mut self, config: SessionFactoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Region factory; defaults to an [`InMemoryRegionFactory`] built from
    /// the cache settings
    pub fn region_factory(mut self, region_factory: Arc<dyn RegionFactory>) -> Self {
        self.region_factory = Some(region_factory);
        self
    }

    /// Build the factory and the access strategy of every cacheable entity
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`](dormant_core::Error::Configuration)
    /// for invalid cache settings or a region requested with two access
    /// types.
    pub fn build(self) -> Result<SessionFactory> {
        let model = Arc::new(self.model);
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new(Arc::clone(&model))),
        };
        self.config.cache.validator.validate()?;

        let region_factory = if self.config.cache.enabled {
            Some(self.region_factory.unwrap_or_else(|| {
                Arc::new(InMemoryRegionFactory::new(self.config.cache.clone())) as Arc<dyn RegionFactory>
            }))
        } else {
            None
        };

        let mut entity_caches = FxHashMap::default();
        let mut collection_caches = FxHashMap::default();
        let mut natural_id_caches = FxHashMap::default();
        if let Some(regions) = &region_factory {
            for mapping in model.entities() {
                let Some(region) = mapping.cache_region() else {
                    continue;
                };
                let access = self.config.cache.access_for(region);
                let strategy = regions.build_access(region, access)?;
                if let Some(natural_id_region) = mapping.natural_id_cache_region() {
                    let resolutions = regions.build_access(&natural_id_region, access)?;
                    natural_id_caches.insert(mapping.name().to_string(), resolutions);
                }
                for (index, property) in mapping.associations() {
                    if property.kind().is_collection() && property.kind().mapped_by().is_none() {
                        collection_caches.insert(mapping.collection_role(index), Arc::clone(&strategy));
                    }
                }
                entity_caches.insert(mapping.name().to_string(), strategy);
            }
        }

        let clock = match &region_factory {
            Some(regions) => regions.clock(),
            None => Arc::new(SystemClock) as Arc<dyn Clock>,
        };

        info!(
            target: "dormant::session",
            entities = model.len(),
            cached_entities = entity_caches.len(),
            cached_collections = collection_caches.len(),
            cached_natural_ids = natural_id_caches.len(),
            "Session factory built"
        );

        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                model,
                store,
                config: self.config,
                region_factory,
                entity_caches,
                collection_caches,
                natural_id_caches,
                clock,
                next_tx: AtomicU64::new(1),
                stats: Statistics::default(),
            }),
        })
    }
}
