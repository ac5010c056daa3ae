//! Cascade engine support
//!
//! A cascade propagates one session operation along the associations whose
//! [`CascadeStyle`](dormant_core::CascadeStyle) includes the action. Each
//! operation owns a [`CascadeContext`]: the set of instances already
//! visited, so a cyclic graph is walked once, and for merges the map from
//! merged instance to managed copy.
//!
//! Associations are cascaded at fixed points relative to the entity's own
//! action:
//!
//! | point | associations |
//! |---|---|
//! | before insert / after delete | to-one |
//! | after insert / before delete | collections |

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use dormant_core::{CascadeAction, EntityMapping};

use crate::instance::{EntityInstance, InstanceId, PropertyValue};

/// Where in an entity action associations are cascaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// To-one associations, before the owner is inserted or after it is deleted
    ToOne,
    /// Collections, after the owner is inserted or before it is deleted
    Collections,
    /// Every association
    All,
}

impl CascadePoint {
    fn includes(self, mapping: &EntityMapping, property: usize) -> bool {
        let kind = mapping.properties()[property].kind();
        match self {
            CascadePoint::ToOne => kind.is_to_one(),
            CascadePoint::Collections => kind.is_collection(),
            CascadePoint::All => !kind.is_basic(),
        }
    }
}

/// State of one cascading operation
#[derive(Debug)]
pub struct CascadeContext {
    action: CascadeAction,
    visited: FxHashSet<InstanceId>,
    merged: FxHashMap<InstanceId, InstanceId>,
    on_flush: bool,
}

impl CascadeContext {
    /// Context for a user-initiated operation
    pub fn new(action: CascadeAction) -> Self {
        Self {
            action,
            visited: FxHashSet::default(),
            merged: FxHashMap::default(),
            on_flush: false,
        }
    }

    /// Context for the persist cascade run at flush time
    pub fn for_flush() -> Self {
        Self {
            on_flush: true,
            ..Self::new(CascadeAction::Persist)
        }
    }

    /// Action being cascaded
    pub fn action(&self) -> CascadeAction {
        self.action
    }

    /// Whether this cascade runs as part of a flush
    pub fn is_on_flush(&self) -> bool {
        self.on_flush
    }

    /// Mark `instance` visited. Returns `false` if it already was.
    pub fn visit(&mut self, instance: InstanceId) -> bool {
        self.visited.insert(instance)
    }

    /// Whether `instance` was visited
    pub fn is_visited(&self, instance: InstanceId) -> bool {
        self.visited.contains(&instance)
    }

    /// Number of visited instances
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    /// Managed copy already produced for a merged instance
    pub fn merged(&self, instance: InstanceId) -> Option<InstanceId> {
        self.merged.get(&instance).copied()
    }

    /// Record the managed copy of a merged instance
    pub fn record_merge(&mut self, instance: InstanceId, copy: InstanceId) {
        self.merged.insert(instance, copy);
    }
}

/// Associations of `instance` to cascade `action` to at `point`, as
/// `(property index, target)` pairs
pub fn cascade_targets(
    instance: &EntityInstance,
    action: CascadeAction,
    point: CascadePoint,
) -> SmallVec<[(usize, InstanceId); 8]> {
    let mapping = instance.mapping();
    let mut targets = SmallVec::new();
    for (index, property) in mapping.associations() {
        if !point.includes(mapping, index) || !property.cascade_style().does_cascade(action) {
            continue;
        }
        match instance.value(index) {
            PropertyValue::Entity(Some(target)) => targets.push((index, *target)),
            PropertyValue::Collection(elements) => {
                targets.extend(elements.iter().map(|element| (index, *element)));
            }
            _ => {}
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instances;
    use dormant_core::{CascadeStyle, PropertyMapping};
    use std::sync::Arc;

    fn order_mapping() -> Arc<EntityMapping> {
        Arc::new(
            EntityMapping::new("Order")
                .property(PropertyMapping::many_to_one("customer", "Customer").cascade(CascadeStyle::of(&[CascadeAction::Persist])))
                .property(PropertyMapping::many_to_one("coupon", "Coupon"))
                .property(PropertyMapping::one_to_many("lines", "Line").cascade(CascadeStyle::ALL)),
        )
    }

    #[test]
    fn test_targets_follow_style_and_point() {
        let mut arena = Instances::new();
        let other = Arc::new(EntityMapping::new("Other"));
        let customer = arena.insert(EntityInstance::new(Arc::clone(&other)));
        let coupon = arena.insert(EntityInstance::new(Arc::clone(&other)));
        let line = arena.insert(EntityInstance::new(Arc::clone(&other)));

        let mut order = EntityInstance::new(order_mapping());
        order.assign(0, PropertyValue::Entity(Some(customer))).unwrap();
        order.assign(1, PropertyValue::Entity(Some(coupon))).unwrap();
        order.assign(2, PropertyValue::Collection(vec![line])).unwrap();

        let persist_to_one = cascade_targets(&order, CascadeAction::Persist, CascadePoint::ToOne);
        assert_eq!(persist_to_one.as_slice(), &[(0, customer)]);

        let remove_all = cascade_targets(&order, CascadeAction::Remove, CascadePoint::All);
        assert_eq!(remove_all.as_slice(), &[(2, line)]);

        let persist_collections = cascade_targets(&order, CascadeAction::Persist, CascadePoint::Collections);
        assert_eq!(persist_collections.as_slice(), &[(2, line)]);
    }

    #[test]
    fn test_visit_once() {
        let mut arena = Instances::new();
        let id = arena.insert(EntityInstance::new(order_mapping()));
        let mut context = CascadeContext::new(CascadeAction::Remove);
        assert!(context.visit(id));
        assert!(!context.visit(id));
        assert_eq!(context.visited_count(), 1);
        assert!(!context.is_on_flush());
        assert!(CascadeContext::for_flush().is_on_flush());
    }
}
