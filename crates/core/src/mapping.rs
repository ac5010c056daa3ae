//! Resolved mapping model
//!
//! The mapping model is the already-resolved metadata the engine consumes:
//! which entities exist, how their identifiers are generated, which
//! properties they have, and how associations cascade. Parsing annotations or
//! mapping documents into this form is someone else's job; the model is
//! built programmatically:
//!
//! ```
//! use dormant_core::{CascadeStyle, EntityMapping, MappingModel, PropertyMapping};
//!
//! let model = MappingModel::builder()
//!     .entity(EntityMapping::new("Customer").property(PropertyMapping::basic("name").not_null()))
//!     .entity(
//!         EntityMapping::new("Order")
//!             .versioned()
//!             .property(PropertyMapping::many_to_one("customer", "Customer").not_null())
//!             .property(
//!                 PropertyMapping::one_to_many("lines", "Line").cascade(CascadeStyle::ALL_DELETE_ORPHAN),
//!             ),
//!     )
//!     .entity(EntityMapping::new("Line").property(PropertyMapping::basic("sku")))
//!     .build()
//!     .unwrap();
//!
//! assert!(model.entity("Order").unwrap().is_versioned());
//! ```
//!
//! Every property occupies one slot in an instance's state array and one
//! column of a [`Row`](crate::Row); collection properties occupy a
//! placeholder column because their elements are stored separately.
//!
//! Basic and many-to-one properties marked [`PropertyMapping::natural_id`]
//! together form the entity's natural id: a unique business key that can
//! be resolved to the identifier. Natural ids are immutable unless the
//! entity is mapped with [`EntityMapping::mutable_natural_id`].

use crate::cascade::CascadeStyle;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// How identifiers are produced for new instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGeneration {
    /// Application assigns the identifier before persisting
    Assigned,
    /// Store sequence generates an integer identifier on persist
    Sequence,
}

/// Kind of a mapped property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// Scalar column
    Basic,
    /// Foreign key to another entity
    ManyToOne {
        /// Referenced entity name
        target: String,
    },
    /// Collection of another entity
    OneToMany {
        /// Element entity name
        target: String,
        /// Many-to-one property on the element that owns the relationship.
        /// When set the collection is inverse: no collection rows are written
        /// and the elements are found through that foreign key.
        mapped_by: Option<String>,
    },
}

impl PropertyKind {
    /// Whether this is a scalar column
    pub fn is_basic(&self) -> bool {
        matches!(self, PropertyKind::Basic)
    }

    /// Whether this is a many-to-one association
    pub fn is_to_one(&self) -> bool {
        matches!(self, PropertyKind::ManyToOne { .. })
    }

    /// Whether this is a collection
    pub fn is_collection(&self) -> bool {
        matches!(self, PropertyKind::OneToMany { .. })
    }

    /// Associated entity name, if this is an association
    pub fn target(&self) -> Option<&str> {
        match self {
            PropertyKind::Basic => None,
            PropertyKind::ManyToOne { target } | PropertyKind::OneToMany { target, .. } => {
                Some(target)
            }
        }
    }

    /// Owning property on the element side of an inverse collection
    pub fn mapped_by(&self) -> Option<&str> {
        match self {
            PropertyKind::OneToMany { mapped_by, .. } => mapped_by.as_deref(),
            _ => None,
        }
    }
}

/// One mapped property of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMapping {
    name: String,
    kind: PropertyKind,
    nullable: bool,
    updatable: bool,
    cascade: CascadeStyle,
    optimistic_lock: bool,
    natural_id: bool,
}

impl PropertyMapping {
    fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
            updatable: true,
            cascade: CascadeStyle::NONE,
            optimistic_lock: true,
            natural_id: false,
        }
    }

    /// Scalar property
    pub fn basic(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Basic)
    }

    /// Many-to-one association to `target`
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            PropertyKind::ManyToOne {
                target: target.into(),
            },
        )
    }

    /// One-to-many collection of `target`
    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            PropertyKind::OneToMany {
                target: target.into(),
                mapped_by: None,
            },
        )
    }

    /// Make a collection inverse, owned by the element's `property`
    pub fn mapped_by(mut self, property: impl Into<String>) -> Self {
        if let PropertyKind::OneToMany { mapped_by, .. } = &mut self.kind {
            *mapped_by = Some(property.into());
        }
        self
    }

    /// Disallow null
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Exclude from UPDATE statements
    pub fn immutable(mut self) -> Self {
        self.updatable = false;
        self
    }

    /// Set the cascade style
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Changes to this property do not increment the owner's version
    pub fn excluded_from_optimistic_lock(mut self) -> Self {
        self.optimistic_lock = false;
        self
    }

    /// Make the property part of the entity's natural id
    pub fn natural_id(mut self) -> Self {
        self.natural_id = true;
        self
    }

    /// Property name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Property kind
    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    /// Whether null is allowed
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Whether the property is written by updates
    pub fn is_updatable(&self) -> bool {
        self.updatable
    }

    /// Cascade style of the association
    pub fn cascade_style(&self) -> CascadeStyle {
        self.cascade
    }

    /// Whether changes bump the owner's version
    pub fn is_optimistic_locked(&self) -> bool {
        self.optimistic_lock
    }

    /// Whether the property is part of the natural id
    pub fn is_natural_id(&self) -> bool {
        self.natural_id
    }
}

/// Mapping of one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMapping {
    name: String,
    id_generation: IdGeneration,
    versioned: bool,
    mutable: bool,
    properties: Vec<PropertyMapping>,
    cache_region: Option<String>,
    mutable_natural_id: bool,
}

impl EntityMapping {
    /// Entity with sequence-generated identifiers and no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_generation: IdGeneration::Sequence,
            versioned: false,
            mutable: true,
            properties: Vec::new(),
            cache_region: None,
            mutable_natural_id: false,
        }
    }

    /// Add a property
    pub fn property(mut self, property: PropertyMapping) -> Self {
        self.properties.push(property);
        self
    }

    /// Identifiers are assigned by the application
    pub fn assigned_ids(mut self) -> Self {
        self.id_generation = IdGeneration::Assigned;
        self
    }

    /// Enable optimistic locking through a version column
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    /// Instances are never updated
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Cache instances (and their collections) in the named region
    pub fn cacheable(mut self, region: impl Into<String>) -> Self {
        self.cache_region = Some(region.into());
        self
    }

    /// Natural id values may change after the insert
    pub fn mutable_natural_id(mut self) -> Self {
        self.mutable_natural_id = true;
        self
    }

    /// Entity name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier generation strategy
    pub fn id_generation(&self) -> IdGeneration {
        self.id_generation
    }

    /// Whether the entity carries a version
    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    /// Whether instances may be updated
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Second-level cache region, if cacheable
    pub fn cache_region(&self) -> Option<&str> {
        self.cache_region.as_deref()
    }

    /// Region caching natural-id resolutions: `"<region>##NaturalId"` for a
    /// cacheable entity with a natural id
    pub fn natural_id_cache_region(&self) -> Option<String> {
        match &self.cache_region {
            Some(region) if self.has_natural_id() => Some(format!("{}##NaturalId", region)),
            _ => None,
        }
    }

    /// Indexes of the natural-id properties, in property order
    pub fn natural_id_properties(&self) -> Vec<usize> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.natural_id)
            .map(|(index, _)| index)
            .collect()
    }

    /// Whether any property is part of a natural id
    pub fn has_natural_id(&self) -> bool {
        self.properties.iter().any(|p| p.natural_id)
    }

    /// Whether natural id values may change after the insert
    pub fn is_natural_id_mutable(&self) -> bool {
        self.mutable_natural_id
    }

    /// All properties in state-array order
    pub fn properties(&self) -> &[PropertyMapping] {
        &self.properties
    }

    /// Number of properties
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Index of the named property
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Index of the named property, or [`Error::UnknownProperty`]
    pub fn require_property(&self, name: &str) -> Result<usize> {
        self.property_index(name)
            .ok_or_else(|| Error::UnknownProperty {
                entity: self.name.clone(),
                property: name.to_string(),
            })
    }

    /// Collection role for the property at `index`, `"<Entity>.<property>"`
    pub fn collection_role(&self, index: usize) -> String {
        format!("{}.{}", self.name, self.properties[index].name)
    }

    /// Association properties with their indexes
    pub fn associations(&self) -> impl Iterator<Item = (usize, &PropertyMapping)> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.kind.is_basic())
    }
}

/// Resolved mapping of every entity
#[derive(Debug, Clone, Default)]
pub struct MappingModel {
    entities: BTreeMap<String, Arc<EntityMapping>>,
}

impl MappingModel {
    /// Start building a model
    pub fn builder() -> MappingModelBuilder {
        MappingModelBuilder::default()
    }

    /// Mapping of `name`, or [`Error::UnknownEntity`]
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityMapping>> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Mapping of `name`, if known
    pub fn get(&self, name: &str) -> Option<&Arc<EntityMapping>> {
        self.entities.get(name)
    }

    /// All entity mappings ordered by name
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMapping>> {
        self.entities.values()
    }

    /// Number of mapped entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity is mapped
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Builder validating a [`MappingModel`]
#[derive(Debug, Default)]
pub struct MappingModelBuilder {
    entities: Vec<EntityMapping>,
}

impl MappingModelBuilder {
    /// Add an entity
    pub fn entity(mut self, mapping: EntityMapping) -> Self {
        self.entities.push(mapping);
        self
    }

    /// Validate and build the model
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mapping`] for duplicate entity or property names,
    /// associations to unknown entities, inverse collections whose
    /// `mapped_by` property is not a many-to-one back to the owner, and
    /// collections marked as natural id.
    pub fn build(self) -> Result<MappingModel> {
        let mut entities = BTreeMap::new();
        for mapping in self.entities {
            if mapping.name.is_empty() {
                return Err(Error::Mapping("entity name must not be empty".into()));
            }
            let mut seen = HashSet::new();
            for property in &mapping.properties {
                if !seen.insert(property.name.as_str()) {
                    return Err(Error::Mapping(format!(
                        "duplicate property {}.{}",
                        mapping.name, property.name
                    )));
                }
                if property.natural_id && property.kind.is_collection() {
                    return Err(Error::Mapping(format!(
                        "collection {}.{} can't be part of a natural id",
                        mapping.name, property.name
                    )));
                }
            }
            let name = mapping.name.clone();
            if entities.insert(name.clone(), Arc::new(mapping)).is_some() {
                return Err(Error::Mapping(format!("duplicate entity {}", name)));
            }
        }

        for mapping in entities.values() {
            for (_, property) in mapping.associations() {
                let target_name = property.kind.target().unwrap_or_default();
                let target = entities.get(target_name).ok_or_else(|| {
                    Error::Mapping(format!(
                        "{}.{} references unknown entity {}",
                        mapping.name, property.name, target_name
                    ))
                })?;
                if let Some(owner_property) = property.kind.mapped_by() {
                    let back = target
                        .property_index(owner_property)
                        .map(|i| &target.properties[i].kind);
                    match back {
                        Some(PropertyKind::ManyToOne { target }) if *target == mapping.name => {}
                        _ => {
                            return Err(Error::Mapping(format!(
                                "{}.{} is mapped by {}.{}, which is not a many-to-one to {}",
                                mapping.name,
                                property.name,
                                target_name,
                                owner_property,
                                mapping.name
                            )))
                        }
                    }
                }
            }
        }

        Ok(MappingModel { entities })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_child() -> MappingModelBuilder {
        MappingModel::builder()
            .entity(
                EntityMapping::new("Parent")
                    .property(PropertyMapping::basic("name"))
                    .property(PropertyMapping::one_to_many("children", "Child").mapped_by("parent")),
            )
            .entity(
                EntityMapping::new("Child").property(PropertyMapping::many_to_one("parent", "Parent")),
            )
    }

    #[test]
    fn test_build_valid_model() {
        let model = parent_child().build().unwrap();
        assert_eq!(model.len(), 2);
        let parent = model.entity("Parent").unwrap();
        assert_eq!(parent.property_index("children"), Some(1));
        assert_eq!(parent.collection_role(1), "Parent.children");
        assert_eq!(parent.associations().count(), 1);
    }

    #[test]
    fn test_unknown_entity() {
        let model = parent_child().build().unwrap();
        assert!(matches!(model.entity("Nope"), Err(Error::UnknownEntity(_))));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let result = MappingModel::builder()
            .entity(EntityMapping::new("A").property(PropertyMapping::many_to_one("b", "B")))
            .build();
        assert!(matches!(result, Err(Error::Mapping(_))));
    }

    #[test]
    fn test_duplicate_property_rejected() {
        let result = MappingModel::builder()
            .entity(
                EntityMapping::new("A")
                    .property(PropertyMapping::basic("x"))
                    .property(PropertyMapping::basic("x")),
            )
            .build();
        assert!(matches!(result, Err(Error::Mapping(_))));
    }

    #[test]
    fn test_bad_mapped_by_rejected() {
        let result = MappingModel::builder()
            .entity(
                EntityMapping::new("Parent")
                    .property(PropertyMapping::one_to_many("children", "Child").mapped_by("name")),
            )
            .entity(EntityMapping::new("Child").property(PropertyMapping::basic("name")))
            .build();
        assert!(matches!(result, Err(Error::Mapping(_))));
    }

    #[test]
    fn test_natural_id_properties() {
        let model = MappingModel::builder()
            .entity(
                EntityMapping::new("Book")
                    .cacheable("books")
                    .property(PropertyMapping::basic("title"))
                    .property(PropertyMapping::basic("isbn").natural_id())
                    .property(PropertyMapping::many_to_one("publisher", "Publisher").natural_id()),
            )
            .entity(EntityMapping::new("Publisher").property(PropertyMapping::basic("name")))
            .build()
            .unwrap();
        let book = model.entity("Book").unwrap();
        assert!(book.has_natural_id());
        assert!(!book.is_natural_id_mutable());
        assert_eq!(book.natural_id_properties(), vec![1, 2]);
        assert_eq!(book.natural_id_cache_region().as_deref(), Some("books##NaturalId"));

        let publisher = model.entity("Publisher").unwrap();
        assert!(!publisher.has_natural_id());
        assert_eq!(publisher.natural_id_cache_region(), None);
    }

    #[test]
    fn test_collection_natural_id_rejected() {
        let result = MappingModel::builder()
            .entity(EntityMapping::new("A").property(PropertyMapping::one_to_many("bs", "B").natural_id()))
            .entity(EntityMapping::new("B"))
            .build();
        assert!(matches!(result, Err(Error::Mapping(_))));
    }

    #[test]
    fn test_require_property() {
        let model = parent_child().build().unwrap();
        let child = model.entity("Child").unwrap();
        assert_eq!(child.require_property("parent").unwrap(), 0);
        assert!(matches!(
            child.require_property("missing"),
            Err(Error::UnknownProperty { .. })
        ));
    }
}
