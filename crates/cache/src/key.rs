//! Cache keys and entries

use dormant_core::{CollectionKey, EntityKey, Identifier, NaturalId, Row};
use std::fmt;

/// Key of a second-level cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Entity row
    Entity(EntityKey),
    /// Collection elements
    Collection(CollectionKey),
    /// Natural-id resolution of an entity
    NaturalId {
        /// Entity name
        entity: String,
        /// Natural id values
        natural_id: NaturalId,
    },
}

impl CacheKey {
    /// Key of the resolution of `natural_id` for `entity`
    pub fn natural_id(entity: impl Into<String>, natural_id: NaturalId) -> Self {
        CacheKey::NaturalId {
            entity: entity.into(),
            natural_id,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Entity(key) => write!(f, "{}", key),
            CacheKey::Collection(key) => write!(f, "{}", key),
            CacheKey::NaturalId { entity, natural_id } => write!(f, "{}##{}", entity, natural_id),
        }
    }
}

impl From<EntityKey> for CacheKey {
    fn from(key: EntityKey) -> Self {
        CacheKey::Entity(key)
    }
}

impl From<CollectionKey> for CacheKey {
    fn from(key: CollectionKey) -> Self {
        CacheKey::Collection(key)
    }
}

/// Disassembled state held by the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    /// Row image of an entity, version included
    Entity(Row),
    /// Element identifiers of a collection
    Collection(Vec<Identifier>),
    /// Identifier a natural id resolves to
    Resolution(Identifier),
}

impl CacheEntry {
    /// Row image, if this is an entity entry
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            CacheEntry::Entity(row) => Some(row),
            _ => None,
        }
    }

    /// Element identifiers, if this is a collection entry
    pub fn as_elements(&self) -> Option<&[Identifier]> {
        match self {
            CacheEntry::Collection(elements) => Some(elements),
            _ => None,
        }
    }

    /// Resolved identifier, if this is a natural-id entry
    pub fn as_resolution(&self) -> Option<&Identifier> {
        match self {
            CacheEntry::Resolution(id) => Some(id),
            _ => None,
        }
    }
}
