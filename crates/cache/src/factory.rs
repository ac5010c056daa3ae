//! Region factory
//!
//! The session factory asks a [`RegionFactory`] for the access strategy of
//! every cacheable entity and collection. [`InMemoryRegionFactory`] builds one
//! [`CacheRegion`] and one [`PutFromLoadValidator`] per region name and hands
//! out the same strategy to every caller asking for that region.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dormant_core::{Error, Result};
use tracing::info;

use crate::access::{
    NonstrictReadWriteAccess, ReadOnlyAccess, RegionAccessStrategy, RegionValidator,
    TransactionalAccess,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{AccessType, CacheSettings};
use crate::region::CacheRegion;

/// Builds cache regions and their access strategies
pub trait RegionFactory: Send + Sync + fmt::Debug {
    /// Access strategy of `region` using `access`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the region was already built with
    /// a different access type.
    fn build_access(&self, region: &str, access: AccessType) -> Result<Arc<dyn RegionAccessStrategy>>;

    /// Time source shared by the regions
    fn clock(&self) -> Arc<dyn Clock>;
}

/// Region factory keeping every region in process memory
pub struct InMemoryRegionFactory {
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    strategies: DashMap<String, Arc<dyn RegionAccessStrategy>>,
    validators: DashMap<String, Arc<RegionValidator>>,
}

impl fmt::Debug for InMemoryRegionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRegionFactory")
            .field("regions", &self.strategies.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl InMemoryRegionFactory {
    /// Factory using the wall clock
    pub fn new(settings: CacheSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Factory using `clock`
    pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            strategies: DashMap::new(),
            validators: DashMap::new(),
        }
    }

    /// Settings this factory was built with
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Access strategy of `region` using its configured access type
    pub fn build_configured_access(&self, region: &str) -> Result<Arc<dyn RegionAccessStrategy>> {
        self.build_access(region, self.settings.access_for(region))
    }

    /// Region built under `name`, if any
    pub fn region(&self, name: &str) -> Option<Arc<CacheRegion>> {
        self.strategies
            .get(name)
            .map(|strategy| Arc::clone(strategy.value().region()))
    }

    /// Validator of a transactional region, if any
    pub fn validator(&self, name: &str) -> Option<Arc<RegionValidator>> {
        self.validators.get(name).map(|v| Arc::clone(v.value()))
    }

    /// Names of all regions built so far, sorted
    pub fn region_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Evict every entry of every region
    pub fn evict_all(&self) {
        let strategies: Vec<_> = self.strategies.iter().map(|e| Arc::clone(e.value())).collect();
        for strategy in strategies {
            strategy.evict_all();
        }
    }

    fn create(&self, name: &str, access: AccessType) -> Arc<dyn RegionAccessStrategy> {
        let region = Arc::new(CacheRegion::new(name));
        let clock = Arc::clone(&self.clock);
        info!(target: "dormant::cache", region = name, access = access.name(), "Building cache region");
        match access {
            AccessType::ReadOnly => Arc::new(ReadOnlyAccess::new(region, clock)),
            AccessType::NonstrictReadWrite => Arc::new(NonstrictReadWriteAccess::new(region, clock)),
            AccessType::Transactional => {
                let validator = Arc::new(RegionValidator::new(
                    name,
                    self.settings.validator.clone(),
                    Arc::clone(&clock),
                ));
                self.validators.insert(name.to_string(), Arc::clone(&validator));
                Arc::new(TransactionalAccess::new(region, validator, clock))
            }
        }
    }
}

impl RegionFactory for InMemoryRegionFactory {
    fn build_access(&self, region: &str, access: AccessType) -> Result<Arc<dyn RegionAccessStrategy>> {
        match self.strategies.entry(region.to_string()) {
            Entry::Occupied(existing) => {
                let strategy = existing.get();
                if strategy.access_type() != access {
                    return Err(Error::Configuration(format!(
                        "region {} is already {}, can't use it as {}",
                        region,
                        strategy.access_type().name(),
                        access.name()
                    )));
                }
                Ok(Arc::clone(strategy))
            }
            Entry::Vacant(vacant) => {
                let strategy = self.create(region, access);
                vacant.insert(Arc::clone(&strategy));
                Ok(strategy)
            }
        }
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}
