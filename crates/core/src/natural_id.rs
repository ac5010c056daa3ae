//! Natural ids
//!
//! A [`NaturalId`] is the tuple of an entity's natural-id column values, in
//! property order. Basic parts compare with [`Value::is_same`] and hash and
//! order consistently with it, so a natural id holding a float can key a
//! hash map or an ordered map.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mapping::{EntityMapping, PropertyKind};
use crate::row::ColumnValue;
use crate::value::Value;

/// Values of the natural-id properties of one entity row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaturalId(Vec<ColumnValue>);

impl NaturalId {
    /// Natural id made of `parts`
    pub fn new(parts: Vec<ColumnValue>) -> Self {
        Self(parts)
    }

    /// Natural id of a single basic property
    pub fn simple(value: impl Into<Value>) -> Self {
        Self(vec![ColumnValue::Value(value.into())])
    }

    /// Natural id made of basic values only
    pub fn of<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self(values.into_iter().map(|v| ColumnValue::Value(v.into())).collect())
    }

    /// Natural id held by a row of `mapping`, `None` if the entity has no
    /// natural id
    pub fn from_columns(mapping: &EntityMapping, columns: &[ColumnValue]) -> Option<Self> {
        let indexes = mapping.natural_id_properties();
        if indexes.is_empty() {
            return None;
        }
        indexes
            .iter()
            .map(|&index| columns.get(index).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Parts in property order
    pub fn parts(&self) -> &[ColumnValue] {
        &self.0
    }

    /// Check that the parts fit the natural-id properties of `mapping`
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the entity has no natural id or the
    ///   number of parts differs
    /// - [`Error::TypeMismatch`] for a value given to a many-to-one part,
    ///   or a reference given to a basic part
    pub fn validate(&self, mapping: &EntityMapping) -> Result<()> {
        let indexes = mapping.natural_id_properties();
        if indexes.is_empty() {
            return Err(Error::InvalidState(format!("{} has no natural id", mapping.name())));
        }
        if indexes.len() != self.0.len() {
            return Err(Error::InvalidState(format!(
                "natural id of {} has {} parts, got {}",
                mapping.name(),
                indexes.len(),
                self.0.len()
            )));
        }
        for (&index, part) in indexes.iter().zip(&self.0) {
            let property = &mapping.properties()[index];
            match (property.kind(), part) {
                (PropertyKind::Basic, ColumnValue::Value(_))
                | (PropertyKind::ManyToOne { .. }, ColumnValue::Reference(_)) => {}
                (kind, part) => {
                    return Err(Error::TypeMismatch {
                        entity: mapping.name().to_string(),
                        property: property.name().to_string(),
                        message: format!("natural id part {:?} doesn't fit a {:?} property", part, kind),
                    })
                }
            }
        }
        Ok(())
    }
}

impl PartialEq for NaturalId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NaturalId {}

impl PartialOrd for NaturalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NaturalId {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            let order = compare_parts(a, b);
            if order != Ordering::Equal {
                return order;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl Hash for NaturalId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for part in &self.0 {
            match part {
                ColumnValue::Value(value) => {
                    0u8.hash(state);
                    value_rank(value).hash(state);
                    match value {
                        Value::Null => {}
                        Value::Bool(b) => b.hash(state),
                        Value::Int(i) => i.hash(state),
                        Value::Float(f) => Value::canonical_bits(*f).hash(state),
                        Value::String(s) => s.hash(state),
                        Value::Bytes(b) => b.hash(state),
                    }
                }
                ColumnValue::Reference(id) => {
                    1u8.hash(state);
                    id.hash(state);
                }
                ColumnValue::Collection => 2u8.hash(state),
            }
        }
    }
}

impl fmt::Display for NaturalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match part {
                ColumnValue::Value(value) => write!(f, "{}", value)?,
                ColumnValue::Reference(Some(id)) => write!(f, "{}", id)?,
                ColumnValue::Reference(None) => write!(f, "null")?,
                ColumnValue::Collection => write!(f, "<collection>")?,
            }
        }
        write!(f, "]")
    }
}

fn part_rank(part: &ColumnValue) -> u8 {
    match part {
        ColumnValue::Value(_) => 0,
        ColumnValue::Reference(_) => 1,
        ColumnValue::Collection => 2,
    }
}

fn value_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) => 2,
        Value::Float(_) => 3,
        Value::String(_) => 4,
        Value::Bytes(_) => 5,
    }
}

fn compare_parts(a: &ColumnValue, b: &ColumnValue) -> Ordering {
    match (a, b) {
        (ColumnValue::Value(a), ColumnValue::Value(b)) => compare_values(a, b),
        (ColumnValue::Reference(a), ColumnValue::Reference(b)) => a.cmp(b),
        _ => part_rank(a).cmp(&part_rank(b)),
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => Value::canonical_bits(*a).cmp(&Value::canonical_bits(*b)),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
        _ => value_rank(a).cmp(&value_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PropertyMapping;
    use crate::types::Identifier;
    use std::collections::HashSet;

    fn book() -> EntityMapping {
        EntityMapping::new("Book")
            .property(PropertyMapping::basic("title"))
            .property(PropertyMapping::basic("isbn").natural_id())
            .property(PropertyMapping::many_to_one("publisher", "Publisher").natural_id())
    }

    #[test]
    fn test_from_columns_picks_natural_id_properties() {
        let columns = vec![
            ColumnValue::Value(Value::from("Dune")),
            ColumnValue::Value(Value::from("978-0441013593")),
            ColumnValue::Reference(Some(Identifier::Int(7))),
        ];
        let natural_id = NaturalId::from_columns(&book(), &columns).unwrap();
        assert_eq!(
            natural_id.parts(),
            &[
                ColumnValue::Value(Value::from("978-0441013593")),
                ColumnValue::Reference(Some(Identifier::Int(7))),
            ]
        );
        assert_eq!(natural_id.to_string(), "[\"978-0441013593\", 7]");
        assert!(NaturalId::from_columns(&EntityMapping::new("Plain"), &columns).is_none());
    }

    #[test]
    fn test_validate_checks_arity_and_kinds() {
        let mapping = book();
        let good = NaturalId::new(vec![
            ColumnValue::Value(Value::from("x")),
            ColumnValue::Reference(None),
        ]);
        assert!(good.validate(&mapping).is_ok());
        assert!(matches!(
            NaturalId::simple("x").validate(&mapping),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            NaturalId::of(["x", "y"]).validate(&mapping),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            NaturalId::simple("x").validate(&EntityMapping::new("Plain")),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_float_parts_follow_sameness() {
        let mut set = HashSet::new();
        set.insert(NaturalId::simple(f64::NAN));
        assert!(set.contains(&NaturalId::simple(-f64::NAN)));
        assert_ne!(NaturalId::simple(0.0), NaturalId::simple(-0.0));
        assert_ne!(NaturalId::simple(1i64), NaturalId::simple(1.0));
        assert!(NaturalId::simple(1i64) < NaturalId::simple(2i64));
    }
}
