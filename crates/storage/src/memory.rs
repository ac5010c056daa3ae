//! MemoryStore: transactional in-memory row store
//!
//! This module implements the [`EntityStore`] trait using:
//! - `BTreeMap<EntityKey, Row>` for committed entity rows
//! - `BTreeMap<CollectionKey, Vec<Identifier>>` for committed collection rows
//! - one write set per active transaction, layered over the committed maps
//! - `parking_lot::RwLock` for thread-safe access
//! - `DashMap` of `AtomicI64` for identifier sequences
//!
//! # Isolation
//!
//! Reads see committed state plus the reading transaction's own writes (read
//! committed). Writes are validated first-committer-wins: a transaction that
//! wrote a row fails at commit if another transaction committed a different
//! version of that row in the meantime.
//!
//! # Constraints
//!
//! Every write is checked against the mapping model as seen by the writing
//! transaction:
//! - PRIMARY KEY: no two rows share a key
//! - NOT NULL: non-nullable basic properties and many-to-one references
//! - FOREIGN KEY: references, collection owners and collection elements must
//!   point at existing rows; a row still referenced cannot be deleted
//! - UNIQUE: no two rows of an entity share a natural id; natural ids with a
//!   null part are exempt

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use dormant_core::{
    CollectionKey, ColumnValue, EntityKey, EntityMapping, EntityStore, Error, Identifier,
    MappingModel, NaturalId, PropertyKind, Result, Row, TxId, Version,
};

/// Write operation recorded by the store, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Row inserted
    Insert(EntityKey),
    /// Row updated
    Update(EntityKey),
    /// Row deleted
    Delete(EntityKey),
    /// Collection rows replaced
    WriteCollection(CollectionKey),
    /// Collection rows deleted
    RemoveCollection(CollectionKey),
    /// Transaction committed
    Commit(TxId),
    /// Transaction rolled back
    Rollback(TxId),
}

/// Pending write of one row inside a transaction
#[derive(Debug, Clone)]
struct RowWrite {
    /// Committed version when the transaction first wrote the row;
    /// `None` if the row did not exist
    base: Option<Option<Version>>,
    /// New image, `None` for a delete
    image: Option<Row>,
}

#[derive(Debug, Default)]
struct WriteSet {
    rows: BTreeMap<EntityKey, RowWrite>,
    collections: BTreeMap<CollectionKey, Option<Vec<Identifier>>>,
}

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<EntityKey, Row>,
    collections: BTreeMap<CollectionKey, Vec<Identifier>>,
    transactions: FxHashMap<TxId, WriteSet>,
}

impl Tables {
    fn write_set(&self, tx: Option<TxId>) -> Option<&WriteSet> {
        tx.and_then(|tx| self.transactions.get(&tx))
    }

    fn write_set_mut(&mut self, tx: TxId) -> Result<&mut WriteSet> {
        self.transactions.get_mut(&tx).ok_or_else(|| inactive(tx))
    }

    fn row(&self, tx: Option<TxId>, key: &EntityKey) -> Option<&Row> {
        match self.write_set(tx).and_then(|ws| ws.rows.get(key)) {
            Some(write) => write.image.as_ref(),
            None => self.rows.get(key),
        }
    }

    fn collection(&self, tx: Option<TxId>, key: &CollectionKey) -> Option<&Vec<Identifier>> {
        match self.write_set(tx).and_then(|ws| ws.collections.get(key)) {
            Some(write) => write.as_ref(),
            None => self.collections.get(key),
        }
    }

    fn visible_rows(&self, tx: Option<TxId>) -> Vec<(&EntityKey, &Row)> {
        let ws = self.write_set(tx);
        let mut rows: Vec<(&EntityKey, &Row)> = self
            .rows
            .iter()
            .filter(|(k, _)| ws.map_or(true, |ws| !ws.rows.contains_key(*k)))
            .collect();
        if let Some(ws) = ws {
            rows.extend(
                ws.rows
                    .iter()
                    .filter_map(|(k, w)| w.image.as_ref().map(|row| (k, row))),
            );
        }
        rows
    }

    fn visible_collections(&self, tx: Option<TxId>) -> Vec<(&CollectionKey, &Vec<Identifier>)> {
        let ws = self.write_set(tx);
        let mut collections: Vec<(&CollectionKey, &Vec<Identifier>)> = self
            .collections
            .iter()
            .filter(|(k, _)| ws.map_or(true, |ws| !ws.collections.contains_key(*k)))
            .collect();
        if let Some(ws) = ws {
            collections.extend(
                ws.collections
                    .iter()
                    .filter_map(|(k, w)| w.as_ref().map(|elements| (k, elements))),
            );
        }
        collections
    }

    fn record_row_write(&mut self, tx: TxId, key: &EntityKey, image: Option<Row>) -> Result<()> {
        let base = self.rows.get(key).map(|row| row.version);
        let ws = self.write_set_mut(tx)?;
        match ws.rows.get_mut(key) {
            Some(write) => write.image = image,
            None => {
                ws.rows.insert(key.clone(), RowWrite { base, image });
            }
        }
        Ok(())
    }
}

/// Keys of the `mapping` rows visible to `tx` holding `natural_id`
fn natural_id_holders<'t>(
    tables: &'t Tables,
    tx: Option<TxId>,
    mapping: &EntityMapping,
    natural_id: &NaturalId,
) -> Vec<&'t EntityKey> {
    if natural_id.parts().iter().any(ColumnValue::is_null) {
        return Vec::new();
    }
    tables
        .visible_rows(tx)
        .into_iter()
        .filter(|(key, _)| key.entity_name() == mapping.name())
        .filter(|(_, row)| NaturalId::from_columns(mapping, &row.columns).as_ref() == Some(natural_id))
        .map(|(key, _)| key)
        .collect()
}

fn inactive(tx: TxId) -> Error {
    Error::Transaction(format!("{} is not active", tx))
}

/// Transactional in-memory implementation of [`EntityStore`]
///
/// Shared between sessions through `Arc`. Besides the trait operations it
/// exposes a log of executed writes and a load counter, which tests use to
/// observe statement ordering and cache effectiveness.
#[derive(Debug)]
pub struct MemoryStore {
    model: Arc<MappingModel>,
    tables: RwLock<Tables>,
    sequences: DashMap<String, AtomicI64>,
    operations: Mutex<Vec<StoreOp>>,
    loads: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store for `model`
    pub fn new(model: Arc<MappingModel>) -> Self {
        Self {
            model,
            tables: RwLock::new(Tables::default()),
            sequences: DashMap::new(),
            operations: Mutex::new(Vec::new()),
            loads: AtomicU64::new(0),
        }
    }

    /// Mapping model the store validates against
    pub fn model(&self) -> &Arc<MappingModel> {
        &self.model
    }

    /// Committed image of a row
    pub fn committed_row(&self, key: &EntityKey) -> Option<Row> {
        self.tables.read().rows.get(key).cloned()
    }

    /// Committed elements of a collection
    pub fn committed_collection(&self, key: &CollectionKey) -> Option<Vec<Identifier>> {
        self.tables.read().collections.get(key).cloned()
    }

    /// Number of committed rows of `entity`
    pub fn row_count(&self, entity: &str) -> usize {
        self.tables
            .read()
            .rows
            .keys()
            .filter(|k| k.entity_name() == entity)
            .count()
    }

    /// Number of transactions currently active
    pub fn active_transactions(&self) -> usize {
        self.tables.read().transactions.len()
    }

    /// Writes executed so far, in order
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().clone()
    }

    /// Forget the recorded operations
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    /// Number of row loads served
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    fn record(&self, op: StoreOp) {
        trace!(target: "dormant::store", op = ?op, "Executed");
        self.operations.lock().push(op);
    }

    fn mapping(&self, entity: &str) -> Result<&Arc<EntityMapping>> {
        self.model.entity(entity)
    }

    /// Resolve a collection role to its owner mapping and property index
    fn collection_mapping(&self, role: &str) -> Result<(&Arc<EntityMapping>, usize)> {
        let (entity, property) = role
            .split_once('.')
            .ok_or_else(|| Error::Storage(format!("malformed collection role '{}'", role)))?;
        let mapping = self.mapping(entity)?;
        let index = mapping.require_property(property)?;
        if !mapping.properties()[index].kind().is_collection() {
            return Err(Error::Storage(format!("{} is not a collection", role)));
        }
        Ok((mapping, index))
    }

    /// Check a row image against NOT NULL, FOREIGN KEY and UNIQUE constraints
    fn check_row(&self, tables: &Tables, tx: TxId, key: &EntityKey, row: &Row) -> Result<()> {
        let mapping = self.mapping(key.entity_name())?;
        if row.columns.len() != mapping.property_count() {
            return Err(Error::Storage(format!(
                "{} expects {} columns, got {}",
                key,
                mapping.property_count(),
                row.columns.len()
            )));
        }
        if mapping.is_versioned() && row.version.is_none() {
            return Err(Error::Storage(format!("{} is versioned but the row has no version", key)));
        }

        for (property, column) in mapping.properties().iter().zip(&row.columns) {
            let qualified = || format!("{}.{}", mapping.name(), property.name());
            match (property.kind(), column) {
                (PropertyKind::Basic, ColumnValue::Value(value)) => {
                    if value.is_null() && !property.is_nullable() {
                        return Err(Error::constraint(
                            format!("NOT NULL {}", qualified()),
                            format!("{} has a null {}", key, property.name()),
                        ));
                    }
                }
                (PropertyKind::ManyToOne { target }, ColumnValue::Reference(reference)) => {
                    match reference {
                        None if !property.is_nullable() => {
                            return Err(Error::constraint(
                                format!("NOT NULL {}", qualified()),
                                format!("{} has a null {}", key, property.name()),
                            ))
                        }
                        None => {}
                        Some(id) => {
                            let target_key = EntityKey::new(target.as_str(), id.clone());
                            if tables.row(Some(tx), &target_key).is_none() {
                                return Err(Error::constraint(
                                    format!("FK {}", qualified()),
                                    format!("{} references missing {}", key, target_key),
                                ));
                            }
                        }
                    }
                }
                (PropertyKind::OneToMany { .. }, ColumnValue::Collection) => {}
                (_, other) => {
                    return Err(Error::Storage(format!(
                        "column {} of {} cannot hold {:?}",
                        qualified(),
                        key,
                        other
                    )))
                }
            }
        }

        if let Some(natural_id) = NaturalId::from_columns(mapping, &row.columns) {
            let holder = natural_id_holders(tables, Some(tx), mapping, &natural_id)
                .into_iter()
                .find(|holder| *holder != key);
            if let Some(holder) = holder {
                return Err(Error::constraint(
                    format!("UNIQUE {}.natural_id", mapping.name()),
                    format!("{} has natural id {} of {}", key, natural_id, holder),
                ));
            }
        }
        Ok(())
    }

    /// Check that a collection's owner and elements exist
    fn check_collection(&self, tables: &Tables, tx: TxId, key: &CollectionKey, elements: &[Identifier]) -> Result<()> {
        let (owner, index) = self.collection_mapping(key.role())?;
        let target = owner.properties()[index].kind().target().unwrap_or_default();
        let owner_key = EntityKey::new(owner.name(), key.owner().clone());
        if tables.row(Some(tx), &owner_key).is_none() {
            return Err(Error::constraint(
                format!("FK {}", key.role()),
                format!("collection owner {} does not exist", owner_key),
            ));
        }
        for element in elements {
            let element_key = EntityKey::new(target, element.clone());
            if tables.row(Some(tx), &element_key).is_none() {
                return Err(Error::constraint(
                    format!("FK {}", key.role()),
                    format!("{} references missing {}", key, element_key),
                ));
            }
        }
        Ok(())
    }

    /// Validate a write set against the rows committed since it was built
    ///
    /// First committer wins on versions. Constraints were checked when each
    /// statement ran, but only against what the transaction could see then,
    /// so they are checked again against the committed tables.
    fn validate_commit(&self, tables: &Tables, tx: TxId) -> Result<()> {
        let ws = tables.transactions.get(&tx).ok_or_else(|| inactive(tx))?;

        for (key, write) in &ws.rows {
            let current = tables.rows.get(key).map(|row| row.version);
            if current != write.base {
                debug!(target: "dormant::store", %tx, %key, "Commit conflict");
                return Err(match (write.base, current) {
                    (None, Some(_)) => Error::constraint(
                        "PRIMARY KEY",
                        format!("{} was inserted by a concurrent transaction", key),
                    ),
                    _ => Error::StaleObjectState {
                        key: key.clone(),
                        expected: write.base.flatten(),
                        actual: current.flatten(),
                    },
                });
            }
        }

        for (key, write) in &ws.rows {
            match &write.image {
                Some(row) => self.check_row(tables, tx, key, row)?,
                None => {
                    if let Some(constraint) = self.find_referrer(tables, tx, key) {
                        return Err(Error::constraint(
                            constraint,
                            format!("{} is referenced by a concurrently committed row", key),
                        ));
                    }
                }
            }
        }
        for (key, elements) in &ws.collections {
            if let Some(elements) = elements {
                self.check_collection(tables, tx, key, elements)?;
            }
        }
        Ok(())
    }

    /// Find a row or collection that still references `key`
    fn find_referrer(&self, tables: &Tables, tx: TxId, key: &EntityKey) -> Option<String> {
        for (other, row) in tables.visible_rows(Some(tx)) {
            if other == key {
                continue;
            }
            let Ok(mapping) = self.mapping(other.entity_name()) else {
                continue;
            };
            for (index, property) in mapping.associations() {
                if property.kind().is_to_one()
                    && property.kind().target() == Some(key.entity_name())
                    && row.columns.get(index).and_then(ColumnValue::reference) == Some(key.id())
                {
                    return Some(format!("FK {}.{}", mapping.name(), property.name()));
                }
            }
        }
        for (collection, elements) in tables.visible_collections(Some(tx)) {
            let Ok((owner, index)) = self.collection_mapping(collection.role()) else {
                continue;
            };
            let owned = owner.name() == key.entity_name() && collection.owner() == key.id();
            let contained = owner.properties()[index].kind().target() == Some(key.entity_name())
                && elements.contains(key.id());
            if owned || contained {
                return Some(format!("FK {}", collection.role()));
            }
        }
        None
    }

    fn check_version(
        key: &EntityKey,
        current: Option<&Row>,
        expected: Option<Version>,
    ) -> Result<()> {
        match current {
            None => Err(Error::StaleObjectState {
                key: key.clone(),
                expected,
                actual: None,
            }),
            Some(row) if row.version != expected => Err(Error::StaleObjectState {
                key: key.clone(),
                expected,
                actual: row.version,
            }),
            Some(_) => Ok(()),
        }
    }
}

impl EntityStore for MemoryStore {
    fn begin(&self, tx: TxId) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.transactions.contains_key(&tx) {
            return Err(Error::Transaction(format!("{} is already active", tx)));
        }
        tables.transactions.insert(tx, WriteSet::default());
        debug!(target: "dormant::store", %tx, "Transaction started");
        Ok(())
    }

    fn commit(&self, tx: TxId) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.transactions.contains_key(&tx) {
            return Err(inactive(tx));
        }
        if let Err(e) = self.validate_commit(&tables, tx) {
            tables.transactions.remove(&tx);
            drop(tables);
            debug!(target: "dormant::store", %tx, error = %e, "Commit refused");
            self.record(StoreOp::Rollback(tx));
            return Err(e);
        }
        let ws = tables.transactions.remove(&tx).ok_or_else(|| inactive(tx))?;

        for (key, write) in ws.rows {
            match write.image {
                Some(row) => {
                    tables.rows.insert(key, row);
                }
                None => {
                    tables.rows.remove(&key);
                }
            }
        }
        for (key, elements) in ws.collections {
            match elements {
                Some(elements) => {
                    tables.collections.insert(key, elements);
                }
                None => {
                    tables.collections.remove(&key);
                }
            }
        }
        drop(tables);
        self.record(StoreOp::Commit(tx));
        debug!(target: "dormant::store", %tx, "Transaction committed");
        Ok(())
    }

    /// Discards the transaction's writes. Rolling back a transaction that is
    /// no longer active (for example after a failed commit) is a no-op.
    fn rollback(&self, tx: TxId) -> Result<()> {
        let removed = self.tables.write().transactions.remove(&tx).is_some();
        if removed {
            self.record(StoreOp::Rollback(tx));
            debug!(target: "dormant::store", %tx, "Transaction rolled back");
        }
        Ok(())
    }

    fn next_identifier(&self, entity: &str) -> Result<Identifier> {
        self.mapping(entity)?;
        let next = self
            .sequences
            .entry(entity.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        Ok(Identifier::Int(next))
    }

    fn load(&self, tx: Option<TxId>, key: &EntityKey) -> Result<Option<Row>> {
        self.mapping(key.entity_name())?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.tables.read().row(tx, key).cloned())
    }

    fn resolve_natural_id(&self, tx: Option<TxId>, entity: &str, natural_id: &NaturalId) -> Result<Option<Identifier>> {
        let mapping = self.mapping(entity)?;
        natural_id.validate(mapping)?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read();
        let resolved = natural_id_holders(&tables, tx, mapping, natural_id)
            .first()
            .map(|key| key.id().clone());
        trace!(target: "dormant::store", entity, %natural_id, resolved = ?resolved, "Natural id resolved");
        Ok(resolved)
    }

    fn insert(&self, tx: TxId, key: &EntityKey, row: Row) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.transactions.contains_key(&tx) {
            return Err(inactive(tx));
        }
        if tables.row(Some(tx), key).is_some() {
            return Err(Error::constraint(
                "PRIMARY KEY",
                format!("duplicate key {}", key),
            ));
        }
        self.check_row(&tables, tx, key, &row)?;
        tables.record_row_write(tx, key, Some(row))?;
        drop(tables);
        self.record(StoreOp::Insert(key.clone()));
        Ok(())
    }

    fn update(&self, tx: TxId, key: &EntityKey, row: Row, expected: Option<Version>) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.transactions.contains_key(&tx) {
            return Err(inactive(tx));
        }
        Self::check_version(key, tables.row(Some(tx), key), expected)?;
        self.check_row(&tables, tx, key, &row)?;
        tables.record_row_write(tx, key, Some(row))?;
        drop(tables);
        self.record(StoreOp::Update(key.clone()));
        Ok(())
    }

    fn delete(&self, tx: TxId, key: &EntityKey, expected: Option<Version>) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.transactions.contains_key(&tx) {
            return Err(inactive(tx));
        }
        Self::check_version(key, tables.row(Some(tx), key), expected)?;
        if let Some(constraint) = self.find_referrer(&tables, tx, key) {
            return Err(Error::constraint(
                constraint,
                format!("{} is still referenced", key),
            ));
        }
        tables.record_row_write(tx, key, None)?;
        drop(tables);
        self.record(StoreOp::Delete(key.clone()));
        Ok(())
    }

    fn load_collection(&self, tx: Option<TxId>, key: &CollectionKey) -> Result<Vec<Identifier>> {
        let (owner, index) = self.collection_mapping(key.role())?;
        let tables = self.tables.read();
        let kind = owner.properties()[index].kind();

        // Inverse collections have no rows of their own: their elements are
        // the rows whose owning reference points back at the owner.
        if let (Some(target), Some(mapped_by)) = (kind.target(), kind.mapped_by()) {
            let element_mapping = self.mapping(target)?;
            let back = element_mapping.require_property(mapped_by)?;
            let mut elements: Vec<Identifier> = tables
                .visible_rows(tx)
                .into_iter()
                .filter(|(k, row)| {
                    k.entity_name() == target
                        && row.columns.get(back).and_then(ColumnValue::reference) == Some(key.owner())
                })
                .map(|(k, _)| k.id().clone())
                .collect();
            elements.sort();
            return Ok(elements);
        }

        Ok(tables.collection(tx, key).cloned().unwrap_or_default())
    }

    fn write_collection(&self, tx: TxId, key: &CollectionKey, elements: Vec<Identifier>) -> Result<()> {
        let (owner, index) = self.collection_mapping(key.role())?;
        let kind = owner.properties()[index].kind();
        if kind.mapped_by().is_some() {
            return Err(Error::Storage(format!(
                "{} is inverse and has no collection rows",
                key.role()
            )));
        }

        let mut tables = self.tables.write();
        if !tables.transactions.contains_key(&tx) {
            return Err(inactive(tx));
        }
        self.check_collection(&tables, tx, key, &elements)?;
        tables
            .write_set_mut(tx)?
            .collections
            .insert(key.clone(), Some(elements));
        drop(tables);
        self.record(StoreOp::WriteCollection(key.clone()));
        Ok(())
    }

    fn remove_collection(&self, tx: TxId, key: &CollectionKey) -> Result<()> {
        self.collection_mapping(key.role())?;
        let mut tables = self.tables.write();
        tables
            .write_set_mut(tx)?
            .collections
            .insert(key.clone(), None);
        drop(tables);
        self.record(StoreOp::RemoveCollection(key.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dormant_core::{EntityMapping, PropertyMapping, Value};

    fn value_column(value: impl Into<Value>) -> ColumnValue {
        ColumnValue::Value(value.into())
    }

    fn model() -> Arc<MappingModel> {
        Arc::new(
            MappingModel::builder()
                .entity(
                    EntityMapping::new("Customer")
                        .versioned()
                        .property(PropertyMapping::basic("name").not_null()),
                )
                .entity(
                    EntityMapping::new("Order")
                        .property(PropertyMapping::many_to_one("customer", "Customer").not_null())
                        .property(PropertyMapping::one_to_many("tags", "Tag")),
                )
                .entity(EntityMapping::new("Tag").property(PropertyMapping::basic("label")))
                .build()
                .unwrap(),
        )
    }

    fn customer_row(name: &str, version: u64) -> Row {
        Row::new(vec![value_column(name)], Some(Version::new(version)))
    }

    fn order_row(customer: i64) -> Row {
        Row::new(
            vec![
                ColumnValue::Reference(Some(Identifier::Int(customer))),
                ColumnValue::Collection,
            ],
            None,
        )
    }

    fn tx(n: u64) -> TxId {
        TxId::new(n)
    }

    #[test]
    fn test_insert_commit_load() {
        let store = MemoryStore::new(model());
        let key = EntityKey::new("Customer", 1i64);
        store.begin(tx(1)).unwrap();
        store.insert(tx(1), &key, customer_row("ada", 0)).unwrap();

        // Visible to the writer, not to others until commit
        assert!(store.load(Some(tx(1)), &key).unwrap().is_some());
        assert!(store.load(None, &key).unwrap().is_none());

        store.commit(tx(1)).unwrap();
        assert_eq!(store.load(None, &key).unwrap(), Some(customer_row("ada", 0)));
        assert_eq!(store.row_count("Customer"), 1);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = MemoryStore::new(model());
        store.begin(tx(1)).unwrap();
        store
            .insert(tx(1), &EntityKey::new("Customer", 1i64), customer_row("ada", 0))
            .unwrap();
        store.rollback(tx(1)).unwrap();
        assert_eq!(store.row_count("Customer"), 0);
        assert_eq!(store.active_transactions(), 0);
        // Second rollback is a no-op
        store.rollback(tx(1)).unwrap();
    }

    #[test]
    fn test_duplicate_primary_key() {
        let store = MemoryStore::new(model());
        let key = EntityKey::new("Customer", 1i64);
        store.begin(tx(1)).unwrap();
        store.insert(tx(1), &key, customer_row("ada", 0)).unwrap();
        let err = store.insert(tx(1), &key, customer_row("bob", 0)).unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_not_null_violation() {
        let store = MemoryStore::new(model());
        store.begin(tx(1)).unwrap();
        let row = Row::new(vec![ColumnValue::Value(Value::Null)], Some(Version::INITIAL));
        let err = store
            .insert(tx(1), &EntityKey::new("Customer", 1i64), row)
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "NOT NULL Customer.name"));
    }

    #[test]
    fn test_foreign_key_on_insert_and_delete() {
        let store = MemoryStore::new(model());
        store.begin(tx(1)).unwrap();
        let err = store
            .insert(tx(1), &EntityKey::new("Order", 1i64), order_row(9))
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let customer = EntityKey::new("Customer", 9i64);
        store.insert(tx(1), &customer, customer_row("ada", 0)).unwrap();
        store
            .insert(tx(1), &EntityKey::new("Order", 1i64), order_row(9))
            .unwrap();
        let err = store
            .delete(tx(1), &customer, Some(Version::INITIAL))
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "FK Order.customer"));
    }

    #[test]
    fn test_version_mismatch_is_stale_state() {
        let store = MemoryStore::new(model());
        let key = EntityKey::new("Customer", 1i64);
        store.begin(tx(1)).unwrap();
        store.insert(tx(1), &key, customer_row("ada", 0)).unwrap();
        store.commit(tx(1)).unwrap();

        store.begin(tx(2)).unwrap();
        let err = store
            .update(tx(2), &key, customer_row("eve", 6), Some(Version::new(5)))
            .unwrap_err();
        assert!(err.is_optimistic_lock_failure());
    }

    #[test]
    fn test_first_committer_wins() {
        let store = MemoryStore::new(model());
        let key = EntityKey::new("Customer", 1i64);
        store.begin(tx(1)).unwrap();
        store.insert(tx(1), &key, customer_row("ada", 0)).unwrap();
        store.commit(tx(1)).unwrap();

        store.begin(tx(2)).unwrap();
        store.begin(tx(3)).unwrap();
        store
            .update(tx(2), &key, customer_row("two", 1), Some(Version::INITIAL))
            .unwrap();
        store
            .update(tx(3), &key, customer_row("three", 1), Some(Version::INITIAL))
            .unwrap();
        store.commit(tx(2)).unwrap();
        let err = store.commit(tx(3)).unwrap_err();
        assert!(err.is_optimistic_lock_failure());
        assert_eq!(store.committed_row(&key), Some(customer_row("two", 1)));
    }

    #[test]
    fn test_collection_rows_reference_elements() {
        let store = MemoryStore::new(model());
        store.begin(tx(1)).unwrap();
        store
            .insert(tx(1), &EntityKey::new("Customer", 1i64), customer_row("ada", 0))
            .unwrap();
        store
            .insert(tx(1), &EntityKey::new("Order", 1i64), order_row(1))
            .unwrap();
        let tags = CollectionKey::new("Order.tags", 1i64);
        let err = store
            .write_collection(tx(1), &tags, vec![Identifier::Int(5)])
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let tag = EntityKey::new("Tag", 5i64);
        store
            .insert(tx(1), &tag, Row::new(vec![value_column("red")], None))
            .unwrap();
        store
            .write_collection(tx(1), &tags, vec![Identifier::Int(5)])
            .unwrap();
        assert!(store.delete(tx(1), &tag, None).unwrap_err().is_constraint_violation());

        store.commit(tx(1)).unwrap();
        assert_eq!(
            store.load_collection(None, &tags).unwrap(),
            vec![Identifier::Int(5)]
        );
    }

    #[test]
    fn test_operation_log_order() {
        let store = MemoryStore::new(model());
        store.begin(tx(1)).unwrap();
        let key = EntityKey::new("Customer", 1i64);
        store.insert(tx(1), &key, customer_row("ada", 0)).unwrap();
        store
            .update(tx(1), &key, customer_row("ada", 1), Some(Version::INITIAL))
            .unwrap();
        store.commit(tx(1)).unwrap();
        assert_eq!(
            store.operations(),
            vec![
                StoreOp::Insert(key.clone()),
                StoreOp::Update(key),
                StoreOp::Commit(tx(1))
            ]
        );
    }

    #[test]
    fn test_sequences_per_entity() {
        let store = MemoryStore::new(model());
        assert_eq!(store.next_identifier("Customer").unwrap(), Identifier::Int(1));
        assert_eq!(store.next_identifier("Customer").unwrap(), Identifier::Int(2));
        assert_eq!(store.next_identifier("Order").unwrap(), Identifier::Int(1));
        assert!(matches!(
            store.next_identifier("Nope"),
            Err(Error::UnknownEntity(_))
        ));
    }
}
