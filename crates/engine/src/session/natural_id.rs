//! Natural-id resolution
//!
//! A natural id resolves persistence context first, then the natural-id
//! cache region, then the store. Before the context is asked, managed
//! instances of the entity are synchronized: an instance whose natural id
//! changed in this session is re-registered under the new value and the
//! old value is stashed as invalid until the next flush, so neither the
//! cache nor the store (which still hold the old value) can resolve it.
//!
//! Shared resolutions follow the entity's cache protocol. A store query
//! runs the put-from-load protocol; inserts publish their resolution once
//! the transaction commits; updates that change the natural id and deletes
//! invalidate the affected keys until completion.

use std::sync::Arc;

use tracing::{debug, trace};

use dormant_cache::{CacheEntry, CacheKey, RegionAccessStrategy};
use dormant_core::{ColumnValue, EntityKey, EntityMapping, Error, Identifier, NaturalId, Result};

use super::Session;
use crate::context::NaturalIdResolution;
use crate::instance::InstanceId;

/// Where a natural id was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Context,
    Cache,
    Store,
}

impl Session {
    /// Managed instance of `entity` whose natural id is `natural_id`,
    /// loading it if needed
    ///
    /// Returns `None` if no row holds the natural id, the instance holding
    /// it was removed in this session, or a managed instance gave it up
    /// since the last flush.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownEntity`] for an unmapped entity
    /// - [`Error::InvalidState`] if the entity has no natural id or the
    ///   number of values differs
    /// - [`Error::TypeMismatch`] if a value doesn't fit its property
    pub fn find_by_natural_id(&mut self, entity: &str, natural_id: NaturalId) -> Result<Option<InstanceId>> {
        self.ensure_open()?;
        let mapping = Arc::clone(self.factory.model().entity(entity)?);
        natural_id.validate(&mapping)?;
        let result = self.resolve_natural_id(&mapping, &natural_id);
        self.guard(result)
    }

    /// Natural id held by the current state of a managed instance
    pub fn natural_id(&self, id: InstanceId) -> Result<Option<NaturalId>> {
        let instance = self.instances.get(id)?;
        Ok(NaturalId::from_columns(instance.mapping(), &self.columns_of(id)?))
    }

    fn resolve_natural_id(&mut self, mapping: &Arc<EntityMapping>, natural_id: &NaturalId) -> Result<Option<InstanceId>> {
        self.synchronize_natural_ids(mapping)?;

        let (identifier, source) = match self.context.find_natural_id_resolution(mapping.name(), natural_id) {
            NaturalIdResolution::Resolved(identifier) => (identifier, Source::Context),
            NaturalIdResolution::Invalid => {
                debug!(target: "dormant::session", entity = mapping.name(), %natural_id, "Natural id was changed in this session");
                return Ok(None);
            }
            NaturalIdResolution::Unknown => match self.cached_natural_id_resolution(mapping, natural_id) {
                Some(identifier) => (identifier, Source::Cache),
                None => match self.query_natural_id(mapping, natural_id)? {
                    Some(identifier) => (identifier, Source::Store),
                    None => return Ok(None),
                },
            },
        };
        trace!(target: "dormant::session", entity = mapping.name(), %natural_id, %identifier, ?source, "Natural id resolved");

        if let Some(found) = self.load_holding(mapping, natural_id, identifier)? {
            return Ok(Some(found));
        }
        if source != Source::Cache {
            return Ok(None);
        }

        // The cached resolution points at a row that no longer holds it
        debug!(target: "dormant::cache", entity = mapping.name(), %natural_id, "Stale natural id resolution evicted");
        if let Some(cache) = self.natural_id_cache(mapping.name()) {
            cache.evict(&CacheKey::natural_id(mapping.name(), natural_id.clone()));
        }
        match self.query_natural_id(mapping, natural_id)? {
            Some(identifier) => self.load_holding(mapping, natural_id, identifier),
            None => Ok(None),
        }
    }

    /// Load `identifier` and check that it still holds `natural_id`
    fn load_holding(
        &mut self,
        mapping: &EntityMapping,
        natural_id: &NaturalId,
        identifier: Identifier,
    ) -> Result<Option<InstanceId>> {
        let Some(found) = self.load_by_key(&EntityKey::new(mapping.name(), identifier.clone()))? else {
            self.context.remove_natural_id_resolution(mapping.name(), &identifier);
            return Ok(None);
        };
        if self.natural_id(found)?.as_ref() == Some(natural_id) {
            Ok(Some(found))
        } else {
            Ok(None)
        }
    }

    /// Re-register managed instances whose natural id changed in this
    /// session
    fn synchronize_natural_ids(&mut self, mapping: &EntityMapping) -> Result<()> {
        let cache = self.natural_id_cache(mapping.name());
        for id in self.context.managed_instances() {
            let Some(entry) = self.context.entry(id) else {
                continue;
            };
            if entry.mapping().name() != mapping.name() || entry.status().is_deleted_or_gone() {
                continue;
            }
            let identifier = entry.key().id().clone();
            let Some(current) = self.natural_id(id)? else {
                continue;
            };
            let cached = self
                .context
                .find_cached_natural_id(mapping.name(), &identifier)
                .cloned();
            if cached.as_ref() == Some(&current) {
                continue;
            }
            self.context
                .cache_natural_id_resolution(mapping.name(), &identifier, current.clone());
            if let Some(previous) = cached {
                debug!(
                    target: "dormant::session",
                    entity = mapping.name(),
                    %identifier,
                    from = %previous,
                    to = %current,
                    "Natural id changed in session"
                );
                if let Some(cache) = &cache {
                    cache.evict(&CacheKey::natural_id(mapping.name(), previous.clone()));
                }
                self.context.stash_invalid_natural_id(mapping.name(), previous);
            }
        }
        Ok(())
    }

    fn cached_natural_id_resolution(&mut self, mapping: &EntityMapping, natural_id: &NaturalId) -> Option<Identifier> {
        let cache = self.natural_id_cache(mapping.name())?;
        match cache.get(&CacheKey::natural_id(mapping.name(), natural_id.clone())) {
            // Recorded in the context once the loaded row confirms it
            Some(CacheEntry::Resolution(identifier)) => {
                self.factory.stats().record_natural_id_cache_hit();
                Some(identifier)
            }
            _ => {
                self.factory.stats().record_natural_id_cache_miss();
                None
            }
        }
    }

    /// Resolve through the store, offering the answer to the natural-id
    /// cache
    fn query_natural_id(&mut self, mapping: &EntityMapping, natural_id: &NaturalId) -> Result<Option<Identifier>> {
        let cache = self.natural_id_cache(mapping.name());
        let cache_key = CacheKey::natural_id(mapping.name(), natural_id.clone());
        if let Some(cache) = &cache {
            cache.before_load(self.lock_owner(), &cache_key, cache.clock().now_millis());
        }
        self.factory.stats().record_natural_id_query();
        let resolved = self
            .factory
            .store()
            .resolve_natural_id(self.tx_id(), mapping.name(), natural_id)?;
        let Some(identifier) = resolved else {
            return Ok(None);
        };

        let inserted = self
            .context
            .was_inserted(&EntityKey::new(mapping.name(), identifier.clone()));
        if let (Some(cache), false) = (&cache, inserted) {
            let entry = CacheEntry::Resolution(identifier.clone());
            if cache.put_from_load(self.lock_owner(), cache_key.clone(), entry, true)? {
                self.factory.stats().record_natural_id_cache_put();
            } else {
                trace!(target: "dormant::cache", key = %cache_key, "Natural id resolution not cached");
            }
        }
        self.context
            .cache_natural_id_resolution(mapping.name(), &identifier, natural_id.clone());
        Ok(Some(identifier))
    }

    pub(super) fn natural_id_cache(&self, entity: &str) -> Option<Arc<dyn RegionAccessStrategy>> {
        self.factory.natural_id_cache(entity).cloned()
    }

    /// Record the natural id a row of `key` holds
    pub(super) fn cache_natural_id_from_columns(&mut self, mapping: &EntityMapping, key: &EntityKey, columns: &[ColumnValue]) {
        if let Some(natural_id) = NaturalId::from_columns(mapping, columns) {
            self.context
                .cache_natural_id_resolution(mapping.name(), key.id(), natural_id);
        }
    }

    /// Fail if an immutable natural id differs from the one in the row
    pub(super) fn check_natural_id_unchanged(
        mapping: &EntityMapping,
        key: &EntityKey,
        columns: &[ColumnValue],
        loaded: &[ColumnValue],
    ) -> Result<()> {
        if mapping.is_natural_id_mutable() {
            return Ok(());
        }
        let (Some(from), Some(to)) = (
            NaturalId::from_columns(mapping, loaded),
            NaturalId::from_columns(mapping, columns),
        ) else {
            return Ok(());
        };
        if from == to {
            return Ok(());
        }
        Err(Error::NaturalIdAltered {
            key: key.clone(),
            from,
            to,
        })
    }

    /// Invalidate the shared resolutions touched by an update from
    /// `loaded` to `columns` and publish the new one after commit
    pub(super) fn natural_id_updated(
        &mut self,
        mapping: &EntityMapping,
        key: &EntityKey,
        columns: &[ColumnValue],
        loaded: &[ColumnValue],
    ) -> Result<()> {
        let (Some(from), Some(to)) = (
            NaturalId::from_columns(mapping, loaded),
            NaturalId::from_columns(mapping, columns),
        ) else {
            return Ok(());
        };
        if from == to {
            return Ok(());
        }
        self.context
            .cache_natural_id_resolution(mapping.name(), key.id(), to.clone());
        let Some(cache) = self.natural_id_cache(mapping.name()) else {
            return Ok(());
        };
        let owner = self.lock_owner();
        let registry = self.registry()?;
        cache.remove(owner, CacheKey::natural_id(mapping.name(), from), &mut *registry)?;
        let published = CacheKey::natural_id(mapping.name(), to);
        cache.remove(owner, published.clone(), &mut *registry)?;
        cache.after_insert(published, CacheEntry::Resolution(key.id().clone()), registry)
    }

    /// Invalidate the shared resolution of a deleted row
    pub(super) fn natural_id_removed(&mut self, mapping: &EntityMapping, state: &[ColumnValue]) -> Result<()> {
        let (Some(cache), Some(natural_id)) = (
            self.natural_id_cache(mapping.name()),
            NaturalId::from_columns(mapping, state),
        ) else {
            return Ok(());
        };
        let owner = self.lock_owner();
        cache.remove(owner, CacheKey::natural_id(mapping.name(), natural_id), self.registry()?)
    }

    /// Publish the resolution of an inserted row once the transaction
    /// commits
    pub(super) fn natural_id_inserted(&mut self, mapping: &EntityMapping, key: &EntityKey, row: &[ColumnValue]) -> Result<()> {
        self.cache_natural_id_from_columns(mapping, key, row);
        let (Some(cache), Some(natural_id)) = (
            self.natural_id_cache(mapping.name()),
            NaturalId::from_columns(mapping, row),
        ) else {
            return Ok(());
        };
        cache.after_insert(
            CacheKey::natural_id(mapping.name(), natural_id),
            CacheEntry::Resolution(key.id().clone()),
            self.registry()?,
        )
    }
}
