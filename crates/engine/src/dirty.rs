//! Dirty checking
//!
//! Compares the current column image of an instance with the image last
//! synchronised with the store. Only updatable properties count; collection
//! placeholders never do, collections are checked through their entries.
//! Basic values use [`Value::is_same`](dormant_core::Value::is_same): an
//! untouched NaN never reports a change, a sign flip of zero does.

use smallvec::SmallVec;

use dormant_core::{ColumnValue, EntityMapping};

/// Indexes of changed properties
pub type DirtyProperties = SmallVec<[usize; 8]>;

/// Whether two column values hold the same state
pub fn is_same_column(current: &ColumnValue, loaded: &ColumnValue) -> bool {
    match (current, loaded) {
        (ColumnValue::Value(a), ColumnValue::Value(b)) => a.is_same(b),
        (ColumnValue::Reference(a), ColumnValue::Reference(b)) => a == b,
        (ColumnValue::Collection, ColumnValue::Collection) => true,
        _ => false,
    }
}

/// Updatable properties whose current column differs from the loaded one
pub fn find_dirty(mapping: &EntityMapping, current: &[ColumnValue], loaded: &[ColumnValue]) -> DirtyProperties {
    mapping
        .properties()
        .iter()
        .enumerate()
        .filter(|(_, property)| property.is_updatable() && !property.kind().is_collection())
        .filter(|(index, _)| match (current.get(*index), loaded.get(*index)) {
            (Some(a), Some(b)) => !is_same_column(a, b),
            _ => true,
        })
        .map(|(index, _)| index)
        .collect()
}

/// Whether any of `dirty` participates in optimistic locking
pub fn requires_version_increment(mapping: &EntityMapping, dirty: &[usize]) -> bool {
    dirty
        .iter()
        .any(|index| mapping.properties()[*index].is_optimistic_locked())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dormant_core::{Identifier, PropertyMapping, Value};
    use proptest::prelude::*;

    fn mapping() -> EntityMapping {
        EntityMapping::new("Account")
            .property(PropertyMapping::basic("owner").immutable())
            .property(PropertyMapping::basic("balance"))
            .property(PropertyMapping::basic("note").excluded_from_optimistic_lock())
            .property(PropertyMapping::many_to_one("branch", "Branch"))
            .property(PropertyMapping::one_to_many("entries", "Entry"))
    }

    fn row(owner: &str, balance: f64, note: &str, branch: Option<i64>) -> Vec<ColumnValue> {
        vec![
            ColumnValue::Value(Value::from(owner)),
            ColumnValue::Value(Value::Float(balance)),
            ColumnValue::Value(Value::from(note)),
            ColumnValue::Reference(branch.map(Identifier::Int)),
            ColumnValue::Collection,
        ]
    }

    #[test]
    fn test_unchanged_nan_is_not_dirty() {
        let loaded = row("ada", f64::NAN, "", None);
        let current = row("ada", f64::NAN, "", None);
        assert!(find_dirty(&mapping(), &current, &loaded).is_empty());
    }

    #[test]
    fn test_signed_zero_change_is_dirty() {
        let loaded = row("ada", 0.0, "", None);
        let current = row("ada", -0.0, "", None);
        assert_eq!(find_dirty(&mapping(), &current, &loaded).as_slice(), &[1]);
        assert!(find_dirty(&mapping(), &loaded, &loaded).is_empty());
    }

    #[test]
    fn test_immutable_property_is_ignored() {
        let loaded = row("ada", 1.0, "", None);
        let current = row("grace", 1.0, "", None);
        assert!(find_dirty(&mapping(), &current, &loaded).is_empty());
    }

    #[test]
    fn test_reference_change_is_dirty() {
        let loaded = row("ada", 1.0, "", Some(1));
        let current = row("ada", 1.0, "", None);
        assert_eq!(find_dirty(&mapping(), &current, &loaded).as_slice(), &[3]);
    }

    #[test]
    fn test_version_increment_only_for_locked_properties() {
        let m = mapping();
        assert!(!requires_version_increment(&m, &[2]));
        assert!(requires_version_increment(&m, &[1, 2]));
    }

    /// Floats by bit pattern, every NaN alike; everything else by `==`
    fn same_state(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Float(x), Value::Float(y)) => (x.is_nan() && y.is_nan()) || x.to_bits() == y.to_bits(),
            _ => a == b,
        }
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_map(Value::Float),
            prop_oneof![Just(0.0f64), Just(-0.0f64), Just(f64::NAN)].prop_map(Value::Float),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    proptest! {
        #[test]
        fn prop_identical_images_are_clean(
            owner in "[a-z]{1,6}",
            balance in any::<f64>(),
            note in "[a-z]{0,6}",
            branch in proptest::option::of(any::<i64>()),
        ) {
            let loaded = row(&owner, balance, &note, branch);
            let current = loaded.clone();
            prop_assert!(find_dirty(&mapping(), &current, &loaded).is_empty());
        }

        #[test]
        fn prop_changed_balance_is_reported(a in value_strategy(), b in value_strategy()) {
            let mut loaded = row("ada", 0.0, "", None);
            let mut current = loaded.clone();
            loaded[1] = ColumnValue::Value(a.clone());
            current[1] = ColumnValue::Value(b.clone());
            let dirty = find_dirty(&mapping(), &current, &loaded);
            prop_assert_eq!(dirty.contains(&1), !same_state(&a, &b));
            prop_assert!(dirty.iter().all(|i| *i == 1));
        }
    }
}
