//! Identity types
//!
//! This module defines:
//! - Identifier: primary key value of an entity row
//! - EntityKey: entity name + identifier, the identity of a row
//! - CollectionKey: collection role + owner identifier
//! - TxId: store transaction identifier

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Primary key value of an entity
///
/// Identifiers are totally ordered so keys can live in ordered maps and
/// updates can be issued in a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    /// Numeric identifier (sequence generated or assigned)
    Int(i64),
    /// Natural string key
    Str(String),
    /// UUID key
    Uuid(Uuid),
}

impl Identifier {
    /// Get as i64 if this is a numeric identifier
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Identifier::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Int(i) => write!(f, "{}", i),
            Identifier::Str(s) => write!(f, "{}", s),
            Identifier::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<i64> for Identifier {
    fn from(i: i64) -> Self {
        Identifier::Int(i)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Identifier::Str(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Identifier::Str(s)
    }
}

impl From<Uuid> for Identifier {
    fn from(u: Uuid) -> Self {
        Identifier::Uuid(u)
    }
}

/// Identity of an entity row: `(entity name, identifier)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    entity: String,
    id: Identifier,
}

impl EntityKey {
    /// Create a key for `entity` with identifier `id`
    pub fn new(entity: impl Into<String>, id: impl Into<Identifier>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Entity name
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    /// Identifier value
    pub fn id(&self) -> &Identifier {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Identity of a collection: `(role, owner identifier)`
///
/// The role is `"<Entity>.<property>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionKey {
    role: String,
    owner: Identifier,
}

impl CollectionKey {
    /// Create a key for collection `role` owned by `owner`
    pub fn new(role: impl Into<String>, owner: impl Into<Identifier>) -> Self {
        Self {
            role: role.into(),
            owner: owner.into(),
        }
    }

    /// Collection role, `"<Entity>.<property>"`
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Identifier of the owning entity
    pub fn owner(&self) -> &Identifier {
        &self.owner
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.owner)
    }
}

/// Store transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(u64);

impl TxId {
    /// Wrap a raw transaction number
    pub const fn new(raw: u64) -> Self {
        TxId(raw)
    }

    /// Raw transaction number
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}
