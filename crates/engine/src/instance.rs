//! Entity instances
//!
//! Instances live in a per-session arena and are addressed by [`InstanceId`].
//! An instance holds one [`PropertyValue`] per mapped property, in mapping
//! order. Associations point at other instances of the same arena, so an
//! object graph (cycles included) is just a set of ids.
//!
//! Whether an instance is transient, managed, removed or detached is decided
//! by the session from its persistence context, not stored here; the
//! instance only remembers whether it has ever been tied to a database row.

use std::fmt;
use std::sync::Arc;

use dormant_core::{EntityMapping, Error, Identifier, IdGeneration, PropertyKind, Result, Value, Version};

/// Handle of an instance inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

impl InstanceId {
    /// Arena slot
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// Current value of one property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Scalar value
    Basic(Value),
    /// To-one association
    Entity(Option<InstanceId>),
    /// Collection elements in order
    Collection(Vec<InstanceId>),
}

impl PropertyValue {
    /// Empty value for a property of `kind`
    pub fn empty(kind: &PropertyKind) -> Self {
        match kind {
            PropertyKind::Basic => PropertyValue::Basic(Value::Null),
            PropertyKind::ManyToOne { .. } => PropertyValue::Entity(None),
            PropertyKind::OneToMany { .. } => PropertyValue::Collection(Vec::new()),
        }
    }

    /// Instances this value points at
    pub fn targets(&self) -> &[InstanceId] {
        match self {
            PropertyValue::Basic(_) => &[],
            PropertyValue::Entity(Some(target)) => std::slice::from_ref(target),
            PropertyValue::Entity(None) => &[],
            PropertyValue::Collection(elements) => elements,
        }
    }
}

/// In-memory state of one entity instance
#[derive(Debug, Clone)]
pub struct EntityInstance {
    mapping: Arc<EntityMapping>,
    id: Option<Identifier>,
    version: Option<Version>,
    state: Vec<PropertyValue>,
    persistent_identity: bool,
}

impl EntityInstance {
    /// New transient instance with every property empty
    pub fn new(mapping: Arc<EntityMapping>) -> Self {
        let state = mapping
            .properties()
            .iter()
            .map(|p| PropertyValue::empty(p.kind()))
            .collect();
        Self {
            mapping,
            id: None,
            version: None,
            state,
            persistent_identity: false,
        }
    }

    /// Mapping of the instance's entity
    pub fn mapping(&self) -> &Arc<EntityMapping> {
        &self.mapping
    }

    /// Entity name
    pub fn entity_name(&self) -> &str {
        self.mapping.name()
    }

    /// Identifier, if assigned or generated
    pub fn id(&self) -> Option<&Identifier> {
        self.id.as_ref()
    }

    pub(crate) fn set_id(&mut self, id: Option<Identifier>) {
        self.id = id;
    }

    /// Version, if the entity is versioned and the instance was persisted
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }

    /// Property values in mapping order
    pub fn state(&self) -> &[PropertyValue] {
        &self.state
    }

    /// Value of the property at `index`
    pub fn value(&self, index: usize) -> &PropertyValue {
        &self.state[index]
    }

    pub(crate) fn value_mut(&mut self, index: usize) -> &mut PropertyValue {
        &mut self.state[index]
    }

    /// Whether the instance has been tied to a database row
    pub fn has_persistent_identity(&self) -> bool {
        self.persistent_identity
    }

    pub(crate) fn mark_persistent(&mut self) {
        self.persistent_identity = true;
    }

    /// Turn a removed instance back into a transient one. Generated
    /// identifiers are rolled back; assigned ones are kept.
    pub(crate) fn forget_identity(&mut self) {
        self.persistent_identity = false;
        self.version = None;
        if self.mapping.id_generation() == IdGeneration::Sequence {
            self.id = None;
        }
    }

    /// Store `value` into the property at `index`, checking it fits the
    /// property kind
    pub(crate) fn assign(&mut self, index: usize, value: PropertyValue) -> Result<()> {
        let property = &self.mapping.properties()[index];
        let fits = matches!(
            (property.kind(), &value),
            (PropertyKind::Basic, PropertyValue::Basic(_))
                | (PropertyKind::ManyToOne { .. }, PropertyValue::Entity(_))
                | (PropertyKind::OneToMany { .. }, PropertyValue::Collection(_))
        );
        if !fits {
            return Err(Error::TypeMismatch {
                entity: self.mapping.name().to_string(),
                property: property.name().to_string(),
                message: format!("{:?} property can't hold {:?}", property.kind(), value),
            });
        }
        self.state[index] = value;
        Ok(())
    }
}

/// Arena of every instance a session has seen
#[derive(Debug, Default)]
pub struct Instances {
    slots: Vec<EntityInstance>,
}

impl Instances {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance and return its handle
    pub fn insert(&mut self, instance: EntityInstance) -> InstanceId {
        let id = InstanceId(self.slots.len() as u32);
        self.slots.push(instance);
        id
    }

    /// Instance behind `id`
    pub fn get(&self, id: InstanceId) -> Result<&EntityInstance> {
        self.slots
            .get(id.index())
            .ok_or_else(|| Error::UnknownInstance(id.to_string()))
    }

    /// Mutable instance behind `id`
    pub fn get_mut(&mut self, id: InstanceId) -> Result<&mut EntityInstance> {
        self.slots
            .get_mut(id.index())
            .ok_or_else(|| Error::UnknownInstance(id.to_string()))
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
