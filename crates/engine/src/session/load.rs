//! Loading: find, refresh and hydration
//!
//! Rows are resolved persistence context first, then second-level cache,
//! then store. A store read of a cacheable entity runs the put-from-load
//! protocol: the pending put is registered before the read starts and the
//! row is offered to the cache afterwards, where the validator refuses it
//! if the key was invalidated in between. Rows inserted by the current
//! transaction are never offered.

use std::sync::Arc;

use tracing::{debug, trace};

use dormant_cache::{CacheEntry, CacheKey, RegionAccessStrategy};
use dormant_core::{
    CascadeAction, CollectionKey, ColumnValue, EntityKey, EntityMapping, Error, Identifier, PropertyKind, Result, Row,
};

use super::{EntityState, Session};
use crate::cascade::{CascadeContext, CascadePoint};
use crate::collection::{CollectionEntry, CollectionRef};
use crate::entry::{EntityEntry, EntityStatus};
use crate::instance::{EntityInstance, InstanceId, PropertyValue};

impl Session {
    /// Managed instance of `entity` with identifier `id`, loading it if
    /// needed
    ///
    /// Associations and collections are loaded eagerly through the same
    /// path. Returns `None` if no row exists or the instance was removed in
    /// this session.
    pub fn find(&mut self, entity: &str, id: impl Into<Identifier>) -> Result<Option<InstanceId>> {
        self.ensure_open()?;
        let mapping = self.factory.model().entity(entity)?;
        let key = EntityKey::new(mapping.name(), id);
        let result = self.load_by_key(&key);
        self.guard(result)
    }

    pub(super) fn load_by_key(&mut self, key: &EntityKey) -> Result<Option<InstanceId>> {
        if let Some(existing) = self.context.instance_for(key) {
            let removed = self
                .context
                .entry(existing)
                .map_or(false, |entry| entry.status().is_deleted_or_gone());
            return Ok(if removed { None } else { Some(existing) });
        }

        let mapping = Arc::clone(self.factory.model().entity(key.entity_name())?);
        let Some(row) = self.fetch_row(&mapping, key)? else {
            trace!(target: "dormant::session", %key, "No row");
            return Ok(None);
        };

        let mut instance = EntityInstance::new(Arc::clone(&mapping));
        instance.set_id(Some(key.id().clone()));
        instance.set_version(row.version);
        instance.mark_persistent();
        let id = self.instances.insert(instance);

        let entry = EntityEntry::new(
            EntityStatus::Loading,
            key.clone(),
            Arc::clone(&mapping),
            Some(row.columns.clone()),
            row.version,
            true,
        );
        self.context.add_entity(id, entry)?;
        if let Err(e) = self.hydrate(id, &mapping, &row) {
            self.context.remove_entity(id);
            return Err(e);
        }

        self.cache_natural_id_from_columns(&mapping, key, &row.columns);
        let status = self.context.loaded_status(mapping.is_mutable());
        if let Some(entry) = self.context.entry_mut(id) {
            entry.set_status(status);
        }
        self.factory.stats().record_entity_load();
        debug!(target: "dormant::session", %key, %status, "Entity loaded");
        Ok(Some(id))
    }

    /// Row of `key` from the cache or the store
    fn fetch_row(&mut self, mapping: &EntityMapping, key: &EntityKey) -> Result<Option<Row>> {
        let Some(cache) = self.entity_cache(mapping.name()) else {
            self.factory.stats().record_entity_fetch();
            return self.factory.store().load(self.tx_id(), key);
        };

        let cache_key = CacheKey::Entity(key.clone());
        if let Some(CacheEntry::Entity(row)) = cache.get(&cache_key) {
            self.factory.stats().record_cache_hit();
            trace!(target: "dormant::cache", %key, "Second-level cache hit");
            return Ok(Some(row));
        }
        self.factory.stats().record_cache_miss();

        let owner = self.lock_owner();
        let offer = !self.context.was_inserted(key);
        if offer {
            cache.before_load(owner, &cache_key, cache.clock().now_millis());
        }
        self.factory.stats().record_entity_fetch();
        let row = self.factory.store().load(self.tx_id(), key)?;
        if let (true, Some(row)) = (offer, &row) {
            self.offer_to_cache(&cache, cache_key, CacheEntry::Entity(row.clone()))?;
        }
        Ok(row)
    }

    fn offer_to_cache(&self, cache: &Arc<dyn RegionAccessStrategy>, key: CacheKey, entry: CacheEntry) -> Result<()> {
        if cache.put_from_load(self.lock_owner(), key.clone(), entry, false)? {
            self.factory.stats().record_cache_put();
        } else {
            self.factory.stats().record_stale_put();
            debug!(target: "dormant::cache", %key, "Stale put-from-load dropped");
        }
        Ok(())
    }

    /// Fill the properties of `id` from `row`, loading associations and
    /// collections
    fn hydrate(&mut self, id: InstanceId, mapping: &EntityMapping, row: &Row) -> Result<()> {
        if row.columns.len() != mapping.property_count() {
            return Err(Error::Storage(format!(
                "row of {} has {} columns, mapping has {} properties",
                mapping.name(),
                row.columns.len(),
                mapping.property_count()
            )));
        }
        let identifier = self.key_of(id)?.id().clone();
        for (index, property) in mapping.properties().iter().enumerate() {
            let value = match (property.kind(), &row.columns[index]) {
                (PropertyKind::Basic, ColumnValue::Value(value)) => PropertyValue::Basic(value.clone()),
                (PropertyKind::ManyToOne { target }, ColumnValue::Reference(reference)) => match reference {
                    Some(fk) => PropertyValue::Entity(self.load_by_key(&EntityKey::new(target.as_str(), fk.clone()))?),
                    None => PropertyValue::Entity(None),
                },
                (PropertyKind::OneToMany { .. }, _) => {
                    PropertyValue::Collection(self.load_collection(id, &identifier, mapping, index)?)
                }
                (kind, column) => {
                    return Err(Error::TypeMismatch {
                        entity: mapping.name().to_string(),
                        property: property.name().to_string(),
                        message: format!("{:?} property can't load column {:?}", kind, column),
                    })
                }
            };
            self.instances.get_mut(id)?.assign(index, value)?;
        }
        Ok(())
    }

    /// Elements of collection `index` of `owner`, registering its entry
    fn load_collection(
        &mut self,
        owner: InstanceId,
        owner_id: &Identifier,
        mapping: &EntityMapping,
        index: usize,
    ) -> Result<Vec<InstanceId>> {
        let property = &mapping.properties()[index];
        let target = property.kind().target().unwrap_or_default().to_string();
        let inverse = property.kind().mapped_by().is_some();
        let role = mapping.collection_role(index);
        let key = CollectionKey::new(role.clone(), owner_id.clone());

        let identifiers = self.fetch_collection(mapping, &role, &key)?;
        let mut elements = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            if let Some(element) = self.load_by_key(&EntityKey::new(target.as_str(), identifier))? {
                elements.push(element);
            }
        }

        self.context.add_collection(
            CollectionRef::new(owner, index),
            CollectionEntry::loaded(role, key, inverse, elements.clone()),
        );
        self.factory.stats().record_collection_load();
        Ok(elements)
    }

    fn fetch_collection(&mut self, owner: &EntityMapping, role: &str, key: &CollectionKey) -> Result<Vec<Identifier>> {
        let Some(cache) = self.collection_cache(role) else {
            return self.factory.store().load_collection(self.tx_id(), key);
        };

        let cache_key = CacheKey::Collection(key.clone());
        if let Some(CacheEntry::Collection(elements)) = cache.get(&cache_key) {
            self.factory.stats().record_cache_hit();
            return Ok(elements);
        }
        self.factory.stats().record_cache_miss();

        let owner_key = EntityKey::new(owner.name(), key.owner().clone());
        let offer = !self.context.was_inserted(&owner_key);
        if offer {
            cache.before_load(self.lock_owner(), &cache_key, cache.clock().now_millis());
        }
        let elements = self.factory.store().load_collection(self.tx_id(), key)?;
        if offer {
            self.offer_to_cache(&cache, cache_key, CacheEntry::Collection(elements.clone()))?;
        }
        Ok(elements)
    }

    /// Re-read the state of a managed instance from the store
    ///
    /// The cached entry is evicted first so the store is always read.
    /// REFRESH cascades along the associations that include it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntityNotFound`] if the row no longer exists.
    pub fn refresh(&mut self, id: InstanceId) -> Result<()> {
        self.ensure_open()?;
        let mut ctx = CascadeContext::new(CascadeAction::Refresh);
        let result = self.refresh_with(id, &mut ctx);
        self.guard(result)
    }

    pub(super) fn refresh_with(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<()> {
        if !ctx.visit(id) {
            return Ok(());
        }
        match self.entity_state(id)? {
            EntityState::Managed => {}
            EntityState::Removed => return Err(Error::ObjectDeleted(self.key_of(id)?)),
            _ => return Err(self.not_managed(id, "refresh")),
        }
        self.cascade(id, CascadePoint::All, ctx)?;

        let key = self.key_of(id)?;
        let mapping = Arc::clone(self.instances.get(id)?.mapping());
        if let Some(cache) = self.entity_cache(mapping.name()) {
            cache.evict(&CacheKey::Entity(key.clone()));
            for (index, _) in mapping.associations() {
                let collection = CollectionKey::new(mapping.collection_role(index), key.id().clone());
                cache.evict(&CacheKey::Collection(collection));
            }
        }

        self.factory.stats().record_entity_fetch();
        let row = self
            .factory
            .store()
            .load(self.tx_id(), &key)?
            .ok_or_else(|| Error::EntityNotFound(key.clone()))?;
        self.hydrate(id, &mapping, &row)?;
        self.instances.get_mut(id)?.set_version(row.version);
        self.cache_natural_id_from_columns(&mapping, &key, &row.columns);
        if let Some(entry) = self.context.entry_mut(id) {
            entry.set_loaded_state(row.columns);
            entry.set_version(row.version);
        }
        debug!(target: "dormant::session", %key, "Entity refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SessionFactoryConfig;
    use crate::factory::SessionFactory;
    use dormant_core::{EntityMapping, Error, MappingModel, PropertyMapping, Value};

    fn factory() -> SessionFactory {
        let model = MappingModel::builder()
            .entity(
                EntityMapping::new("Team")
                    .property(PropertyMapping::basic("name"))
                    .property(PropertyMapping::one_to_many("players", "Player").mapped_by("team")),
            )
            .entity(
                EntityMapping::new("Player")
                    .property(PropertyMapping::basic("name"))
                    .property(PropertyMapping::many_to_one("team", "Team")),
            )
            .build()
            .unwrap();
        SessionFactory::builder(model)
            .config(SessionFactoryConfig::without_cache())
            .build()
            .unwrap()
    }

    fn seed(factory: &SessionFactory) -> i64 {
        let mut session = factory.open_session();
        session.begin_transaction().unwrap();
        let team = session.instantiate("Team").unwrap();
        session.set(team, "name", "Rovers").unwrap();
        session.persist(team).unwrap();
        for name in ["ada", "bo"] {
            let player = session.instantiate("Player").unwrap();
            session.set(player, "name", name).unwrap();
            session.set_reference(player, "team", Some(team)).unwrap();
            session.persist(player).unwrap();
        }
        session.commit().unwrap();
        session.identifier(team).unwrap().and_then(|id| id.as_int()).unwrap()
    }

    #[test]
    fn test_find_loads_graph_once() {
        let factory = factory();
        let team_id = seed(&factory);
        let mut session = factory.open_session();
        let team = session.find("Team", team_id).unwrap().unwrap();
        let players = session.elements(team, "players").unwrap();
        assert_eq!(players.len(), 2);
        for player in players {
            assert_eq!(session.get_reference(player, "team").unwrap(), Some(team));
        }
        assert_eq!(session.find("Team", team_id).unwrap(), Some(team));
    }

    #[test]
    fn test_find_missing_row() {
        let factory = factory();
        let mut session = factory.open_session();
        assert_eq!(session.find("Team", 99i64).unwrap(), None);
        assert!(matches!(session.find("Nope", 1i64), Err(Error::UnknownEntity(_))));
    }

    #[test]
    fn test_refresh_discards_changes() {
        let factory = factory();
        let team_id = seed(&factory);
        let mut session = factory.open_session();
        let team = session.find("Team", team_id).unwrap().unwrap();
        session.set(team, "name", "Wanderers").unwrap();
        session.refresh(team).unwrap();
        assert_eq!(session.get(team, "name").unwrap(), Value::from("Rovers"));
    }
}
