//! Integration tests for MemoryStore
//!
//! These tests exercise the store through the `EntityStore` trait only:
//! - read-committed visibility between concurrent transactions
//! - first-committer-wins under real thread contention
//! - foreign keys checked against each transaction's own view
//! - committed state matching a simple model over random histories

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use dormant_core::{
    CollectionKey, ColumnValue, EntityKey, EntityMapping, EntityStore, Error, Identifier, MappingModel,
    NaturalId, PropertyMapping, Row, TxId, Value, Version,
};
use dormant_storage::{MemoryStore, StoreOp};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Helper Functions
// ============================================================================

fn bank_model() -> Arc<MappingModel> {
    Arc::new(
        MappingModel::builder()
            .entity(EntityMapping::new("Account").versioned().property(PropertyMapping::basic("balance").not_null()))
            .build()
            .unwrap(),
    )
}

fn shop_model() -> Arc<MappingModel> {
    Arc::new(
        MappingModel::builder()
            .entity(
                EntityMapping::new("Customer")
                    .property(PropertyMapping::basic("name"))
                    .property(PropertyMapping::one_to_many("favourites", "Product")),
            )
            .entity(EntityMapping::new("Product").property(PropertyMapping::basic("sku")))
            .entity(
                EntityMapping::new("Order")
                    .property(PropertyMapping::many_to_one("customer", "Customer").not_null()),
            )
            .build()
            .unwrap(),
    )
}

fn note_model() -> Arc<MappingModel> {
    Arc::new(
        MappingModel::builder()
            .entity(EntityMapping::new("Note").versioned().property(PropertyMapping::basic("text")))
            .build()
            .unwrap(),
    )
}

fn library_model() -> Arc<MappingModel> {
    Arc::new(
        MappingModel::builder()
            .entity(
                EntityMapping::new("Book")
                    .property(PropertyMapping::basic("isbn").natural_id())
                    .property(PropertyMapping::basic("title")),
            )
            .build()
            .unwrap(),
    )
}

fn book_row(isbn: impl Into<Value>, title: &str) -> Row {
    Row::new(
        vec![ColumnValue::Value(isbn.into()), ColumnValue::Value(Value::from(title))],
        None,
    )
}

fn value_row(value: impl Into<Value>, version: Option<Version>) -> Row {
    Row::new(vec![ColumnValue::Value(value.into())], version)
}

fn reference_row(id: i64) -> Row {
    Row::new(vec![ColumnValue::Reference(Some(Identifier::Int(id)))], None)
}

fn account(id: i64) -> EntityKey {
    EntityKey::new("Account", id)
}

fn balance(row: &Row) -> i64 {
    match &row.columns[0] {
        ColumnValue::Value(Value::Int(n)) => *n,
        other => panic!("unexpected balance column {:?}", other),
    }
}

// ============================================================================
// Isolation
// ============================================================================

#[test]
fn test_uncommitted_writes_are_invisible_to_other_transactions() {
    let store = MemoryStore::new(shop_model());
    let key = EntityKey::new("Customer", 1i64);
    let (writer, reader) = (TxId::new(1), TxId::new(2));
    store.begin(writer).unwrap();
    store.begin(reader).unwrap();

    store
        .insert(writer, &key, Row::new(vec![ColumnValue::Value("ada".into()), ColumnValue::Collection], None))
        .unwrap();
    assert!(store.load(Some(writer), &key).unwrap().is_some());
    assert!(store.load(Some(reader), &key).unwrap().is_none());

    store.commit(writer).unwrap();

    // Read committed: the open reader sees the write once it commits
    assert!(store.load(Some(reader), &key).unwrap().is_some());
    store.rollback(reader).unwrap();
    assert_eq!(store.active_transactions(), 0);
}

#[test]
fn test_collection_rows_follow_the_same_visibility() {
    let store = MemoryStore::new(shop_model());
    let owner = EntityKey::new("Customer", 1i64);
    let favourites = CollectionKey::new("Customer.favourites", 1i64);

    let setup = TxId::new(1);
    store.begin(setup).unwrap();
    store
        .insert(setup, &owner, Row::new(vec![ColumnValue::Value("ada".into()), ColumnValue::Collection], None))
        .unwrap();
    for id in [10i64, 11] {
        store
            .insert(setup, &EntityKey::new("Product", id), value_row(format!("sku-{}", id), None))
            .unwrap();
    }
    store.commit(setup).unwrap();

    let writer = TxId::new(2);
    store.begin(writer).unwrap();
    store
        .write_collection(writer, &favourites, vec![Identifier::Int(10), Identifier::Int(11)])
        .unwrap();
    assert_eq!(store.load_collection(None, &favourites).unwrap(), Vec::<Identifier>::new());
    assert_eq!(store.load_collection(Some(writer), &favourites).unwrap().len(), 2);
    store.commit(writer).unwrap();

    // Product 10 is now an element and cannot be deleted out from under it
    let deleter = TxId::new(3);
    store.begin(deleter).unwrap();
    let err = store.delete(deleter, &EntityKey::new("Product", 10i64), None).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "FK Customer.favourites"));
    store.remove_collection(deleter, &favourites).unwrap();
    store.delete(deleter, &EntityKey::new("Product", 10i64), None).unwrap();
    store.commit(deleter).unwrap();

    assert_eq!(store.committed_collection(&favourites), None);
    assert_eq!(store.row_count("Product"), 1);
}

#[test]
fn test_reference_to_uncommitted_row_is_rejected() {
    let store = MemoryStore::new(shop_model());
    let (parent_tx, child_tx) = (TxId::new(1), TxId::new(2));
    store.begin(parent_tx).unwrap();
    store.begin(child_tx).unwrap();

    store
        .insert(
            parent_tx,
            &EntityKey::new("Customer", 7i64),
            Row::new(vec![ColumnValue::Value(Value::Null), ColumnValue::Collection], None),
        )
        .unwrap();

    let err = store
        .insert(child_tx, &EntityKey::new("Order", 1i64), reference_row(7))
        .unwrap_err();
    assert!(err.is_constraint_violation());

    store.commit(parent_tx).unwrap();
    store
        .insert(child_tx, &EntityKey::new("Order", 1i64), reference_row(7))
        .unwrap();
    store.commit(child_tx).unwrap();
    assert_eq!(store.row_count("Order"), 1);
}

fn seed_customer(store: &MemoryStore, tx: TxId, id: i64) {
    store.begin(tx).unwrap();
    store
        .insert(
            tx,
            &EntityKey::new("Customer", id),
            Row::new(vec![ColumnValue::Value("ada".into()), ColumnValue::Collection], None),
        )
        .unwrap();
    store.commit(tx).unwrap();
}

#[test]
fn test_insert_referencing_concurrently_deleted_row_fails_at_commit() {
    let store = MemoryStore::new(shop_model());
    seed_customer(&store, TxId::new(1), 1);
    let customer = EntityKey::new("Customer", 1i64);
    let order = EntityKey::new("Order", 1i64);

    let (inserter, deleter) = (TxId::new(2), TxId::new(3));
    store.begin(inserter).unwrap();
    store.begin(deleter).unwrap();
    store.insert(inserter, &order, reference_row(1)).unwrap();
    // The deleter cannot see the uncommitted order
    store.delete(deleter, &customer, None).unwrap();
    store.commit(deleter).unwrap();

    let err = store.commit(inserter).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "FK Order.customer"));
    assert_eq!(store.committed_row(&order), None);
    assert_eq!(store.committed_row(&customer), None);
    assert_eq!(store.active_transactions(), 0);
    assert_eq!(store.operations().last(), Some(&StoreOp::Rollback(inserter)));
}

#[test]
fn test_delete_of_concurrently_referenced_row_fails_at_commit() {
    let store = MemoryStore::new(shop_model());
    seed_customer(&store, TxId::new(1), 1);
    let customer = EntityKey::new("Customer", 1i64);
    let order = EntityKey::new("Order", 1i64);

    let (inserter, deleter) = (TxId::new(2), TxId::new(3));
    store.begin(inserter).unwrap();
    store.begin(deleter).unwrap();
    store.insert(inserter, &order, reference_row(1)).unwrap();
    store.delete(deleter, &customer, None).unwrap();
    store.commit(inserter).unwrap();

    let err = store.commit(deleter).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "FK Order.customer"));
    assert!(store.committed_row(&customer).is_some());
    assert!(store.committed_row(&order).is_some());
}

#[test]
fn test_collection_element_deleted_concurrently_fails_at_commit() {
    let store = MemoryStore::new(shop_model());
    seed_customer(&store, TxId::new(1), 1);
    let product = EntityKey::new("Product", 10i64);
    let seed = TxId::new(2);
    store.begin(seed).unwrap();
    store.insert(seed, &product, value_row("sku-10", None)).unwrap();
    store.commit(seed).unwrap();

    let favourites = CollectionKey::new("Customer.favourites", 1i64);
    let (writer, deleter) = (TxId::new(3), TxId::new(4));
    store.begin(writer).unwrap();
    store.begin(deleter).unwrap();
    store.write_collection(writer, &favourites, vec![Identifier::Int(10)]).unwrap();
    store.delete(deleter, &product, None).unwrap();
    store.commit(deleter).unwrap();

    let err = store.commit(writer).unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "FK Customer.favourites"));
    assert_eq!(store.committed_collection(&favourites), None);
}

#[test]
fn test_natural_id_resolves_per_transaction_view() {
    let store = MemoryStore::new(library_model());
    let (writer, reader) = (TxId::new(1), TxId::new(2));
    store.begin(writer).unwrap();
    store.begin(reader).unwrap();
    let isbn = NaturalId::simple("978-0");
    store.insert(writer, &EntityKey::new("Book", 1i64), book_row("978-0", "Dune")).unwrap();

    assert_eq!(store.resolve_natural_id(Some(writer), "Book", &isbn).unwrap(), Some(Identifier::Int(1)));
    assert_eq!(store.resolve_natural_id(Some(reader), "Book", &isbn).unwrap(), None);
    store.commit(writer).unwrap();
    assert_eq!(store.resolve_natural_id(Some(reader), "Book", &isbn).unwrap(), Some(Identifier::Int(1)));
    assert_eq!(store.resolve_natural_id(None, "Book", &NaturalId::simple("978-1")).unwrap(), None);
    assert!(matches!(
        store.resolve_natural_id(None, "Book", &NaturalId::of(["978-0", "Dune"])),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_duplicate_natural_id_is_rejected() {
    let store = MemoryStore::new(library_model());
    let tx = TxId::new(1);
    store.begin(tx).unwrap();
    store.insert(tx, &EntityKey::new("Book", 1i64), book_row("978-0", "Dune")).unwrap();
    let err = store
        .insert(tx, &EntityKey::new("Book", 2i64), book_row("978-0", "Emma"))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "UNIQUE Book.natural_id"));

    // Rewriting a row with its own natural id is fine, and null parts are exempt
    store
        .update(tx, &EntityKey::new("Book", 1i64), book_row("978-0", "Dune II"), None)
        .unwrap();
    store.insert(tx, &EntityKey::new("Book", 3i64), book_row(Value::Null, "Anon")).unwrap();
    store.insert(tx, &EntityKey::new("Book", 4i64), book_row(Value::Null, "Anon")).unwrap();
    store.commit(tx).unwrap();
}

#[test]
fn test_concurrent_duplicate_natural_id_fails_at_commit() {
    let store = MemoryStore::new(library_model());
    let (first, second) = (TxId::new(1), TxId::new(2));
    store.begin(first).unwrap();
    store.begin(second).unwrap();
    store.insert(first, &EntityKey::new("Book", 1i64), book_row("978-0", "Dune")).unwrap();
    store.insert(second, &EntityKey::new("Book", 2i64), book_row("978-0", "Emma")).unwrap();
    store.commit(first).unwrap();

    let err = store.commit(second).unwrap_err();
    assert!(err.is_constraint_violation());
    assert_eq!(store.row_count("Book"), 1);
    assert_eq!(store.operations().last(), Some(&StoreOp::Rollback(second)));
}

#[test]
fn test_failed_commit_leaves_committed_state_untouched() {
    let store = MemoryStore::new(bank_model());
    let seed = TxId::new(1);
    store.begin(seed).unwrap();
    store.insert(seed, &account(1), value_row(100i64, Some(Version::INITIAL))).unwrap();
    store.commit(seed).unwrap();

    let (first, second) = (TxId::new(2), TxId::new(3));
    store.begin(first).unwrap();
    store.begin(second).unwrap();
    store
        .update(first, &account(1), value_row(90i64, Some(Version::new(1))), Some(Version::INITIAL))
        .unwrap();
    store
        .update(second, &account(1), value_row(50i64, Some(Version::new(1))), Some(Version::INITIAL))
        .unwrap();
    store.commit(first).unwrap();

    let err = store.commit(second).unwrap_err();
    assert!(err.is_optimistic_lock_failure());
    // The losing transaction is already gone; rolling it back is a no-op
    store.rollback(second).unwrap();

    let row = store.committed_row(&account(1)).unwrap();
    assert_eq!(balance(&row), 90);
    assert_eq!(row.version, Some(Version::new(1)));
    assert_eq!(store.operations().last(), Some(&StoreOp::Rollback(second)));
}

// ============================================================================
// Contention
// ============================================================================

/// Random transfers between a handful of accounts from several threads
///
/// Every transfer reads both balances, writes both with the version it read
/// and retries on a version conflict. No money may appear or vanish.
#[test]
fn test_concurrent_transfers_preserve_total() {
    const ACCOUNTS: i64 = 4;
    const THREADS: u64 = 6;
    const TRANSFERS: usize = 50;
    const INITIAL: i64 = 1_000;

    let store = Arc::new(MemoryStore::new(bank_model()));
    let next_tx = Arc::new(AtomicU64::new(1));
    let seed = TxId::new(next_tx.fetch_add(1, Ordering::SeqCst));
    store.begin(seed).unwrap();
    for id in 0..ACCOUNTS {
        store.insert(seed, &account(id), value_row(INITIAL, Some(Version::INITIAL))).unwrap();
    }
    store.commit(seed).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            let next_tx = Arc::clone(&next_tx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xACC0 + t);
                let mut conflicts = 0u64;
                barrier.wait();
                for _ in 0..TRANSFERS {
                    let from = rng.gen_range(0..ACCOUNTS);
                    let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                    let amount = rng.gen_range(1..=25);
                    loop {
                        let tx = TxId::new(next_tx.fetch_add(1, Ordering::SeqCst));
                        match transfer(&store, tx, from, to, amount) {
                            Ok(()) => break,
                            Err(e) if e.is_optimistic_lock_failure() => {
                                store.rollback(tx).unwrap();
                                conflicts += 1;
                            }
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                }
                conflicts
            })
        })
        .collect();

    let conflicts: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let rows: Vec<Row> = (0..ACCOUNTS).map(|id| store.committed_row(&account(id)).unwrap()).collect();
    assert_eq!(rows.iter().map(balance).sum::<i64>(), INITIAL * ACCOUNTS);
    // Each successful transfer bumps two versions
    let bumps: u64 = rows.iter().map(|row| row.version.unwrap().as_u64()).sum();
    assert_eq!(bumps, THREADS * TRANSFERS as u64 * 2);
    assert_eq!(store.active_transactions(), 0);
    println!("{} conflicts retried", conflicts);
}

fn transfer(store: &MemoryStore, tx: TxId, from: i64, to: i64, amount: i64) -> dormant_core::Result<()> {
    store.begin(tx)?;
    for (id, delta) in [(from, -amount), (to, amount)] {
        let key = account(id);
        let row = store
            .load(Some(tx), &key)?
            .ok_or_else(|| Error::Storage(format!("{} vanished", key)))?;
        let version = row.version;
        let next = version.map(Version::next);
        store.update(tx, &key, value_row(balance(&row) + delta, next), version)?;
    }
    store.commit(tx)
}

#[test]
fn test_concurrent_inserts_of_the_same_key_admit_one() {
    let store = Arc::new(MemoryStore::new(note_model()));
    let threads = 8u64;
    let barrier = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let tx = TxId::new(t + 1);
                store.begin(tx).unwrap();
                store
                    .insert(tx, &EntityKey::new("Note", 1i64), value_row(format!("from {}", t), Some(Version::INITIAL)))
                    .unwrap();
                barrier.wait();
                store.commit(tx)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.into_iter().filter_map(|r| r.err()) {
        assert!(matches!(err, Error::ConstraintViolation { ref constraint, .. } if constraint == "PRIMARY KEY"));
    }
    assert_eq!(store.row_count("Note"), 1);
}

// ============================================================================
// Random histories
// ============================================================================

#[derive(Debug, Clone)]
enum Write {
    Insert(i64),
    Update(i64),
    Delete(i64),
}

fn write_strategy() -> impl Strategy<Value = Write> {
    prop_oneof![
        (0i64..5).prop_map(Write::Insert),
        (0i64..5).prop_map(Write::Update),
        (0i64..5).prop_map(Write::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Committed rows always equal the writes of committed transactions
    /// applied in order; rolled back transactions leave no trace.
    #[test]
    fn committed_state_matches_model(
        history in prop::collection::vec((prop::collection::vec(write_strategy(), 1..6), any::<bool>()), 1..12)
    ) {
        let store = MemoryStore::new(note_model());
        let mut committed: BTreeMap<i64, u64> = BTreeMap::new();

        for (n, (writes, commit)) in history.into_iter().enumerate() {
            let tx = TxId::new(n as u64 + 1);
            store.begin(tx).unwrap();
            let mut view = committed.clone();

            for write in writes {
                match write {
                    Write::Insert(id) => {
                        let result = store.insert(
                            tx,
                            &EntityKey::new("Note", id),
                            value_row(id, Some(Version::INITIAL)),
                        );
                        if view.contains_key(&id) {
                            prop_assert!(result.unwrap_err().is_constraint_violation());
                        } else {
                            prop_assert!(result.is_ok());
                            view.insert(id, 0);
                        }
                    }
                    Write::Update(id) => {
                        let current = view.get(&id).copied();
                        let expected = Some(Version::new(current.unwrap_or(0)));
                        let result = store.update(
                            tx,
                            &EntityKey::new("Note", id),
                            value_row(id, expected.map(Version::next)),
                            expected,
                        );
                        match current {
                            Some(v) => {
                                prop_assert!(result.is_ok());
                                view.insert(id, v + 1);
                            }
                            None => prop_assert!(result.unwrap_err().is_optimistic_lock_failure()),
                        }
                    }
                    Write::Delete(id) => {
                        let current = view.get(&id).copied();
                        let result = store.delete(
                            tx,
                            &EntityKey::new("Note", id),
                            current.map(Version::new),
                        );
                        prop_assert_eq!(result.is_ok(), current.is_some());
                        view.remove(&id);
                    }
                }
            }

            if commit {
                store.commit(tx).unwrap();
                committed = view;
            } else {
                store.rollback(tx).unwrap();
            }

            for id in 0i64..5 {
                let row = store.committed_row(&EntityKey::new("Note", id));
                prop_assert_eq!(row.and_then(|r| r.version), committed.get(&id).map(|v| Version::new(*v)));
            }
        }
        prop_assert_eq!(store.active_transactions(), 0);
    }
}
