//! Collection entries
//!
//! Every collection property of a managed instance has a [`CollectionEntry`]
//! recording the elements last synchronised with the store. At flush the
//! entry is marked reached when its owner is still managed, and the
//! difference between the snapshot and the current elements decides the
//! collection action.

use dormant_core::CollectionKey;

use crate::instance::InstanceId;

/// Collection property of a specific owner instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionRef {
    /// Owning instance
    pub owner: InstanceId,
    /// Property index on the owner
    pub property: usize,
}

impl CollectionRef {
    /// Collection `property` of `owner`
    pub fn new(owner: InstanceId, property: usize) -> Self {
        Self { owner, property }
    }
}

/// Statement needed to bring the collection rows in line with the elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionAction {
    /// Write the rows of a collection that has none yet
    Recreate,
    /// Replace the rows of a changed collection
    Update,
    /// Delete every row of a dereferenced collection
    Remove,
}

/// Persistence context entry of one collection
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    role: String,
    key: CollectionKey,
    inverse: bool,
    snapshot: Option<Vec<InstanceId>>,
    reached: bool,
    action: Option<CollectionAction>,
}

impl CollectionEntry {
    /// Entry of a collection that has never been written
    pub fn new_collection(role: String, key: CollectionKey, inverse: bool) -> Self {
        Self {
            role,
            key,
            inverse,
            snapshot: None,
            reached: false,
            action: None,
        }
    }

    /// Entry of a collection loaded with `elements`
    pub fn loaded(role: String, key: CollectionKey, inverse: bool, elements: Vec<InstanceId>) -> Self {
        Self {
            snapshot: Some(elements),
            ..Self::new_collection(role, key, inverse)
        }
    }

    /// Collection role, `"<Owner>.<property>"`
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Key of the collection rows
    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    /// Whether the elements own the relationship, so the collection has no
    /// rows of its own
    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    /// Elements at the last synchronisation, `None` if never written
    pub fn snapshot(&self) -> Option<&[InstanceId]> {
        self.snapshot.as_deref()
    }

    pub(crate) fn set_snapshot(&mut self, elements: Vec<InstanceId>) {
        self.snapshot = Some(elements);
    }

    /// Whether the collection differs from its snapshot
    pub fn is_dirty(&self, current: &[InstanceId]) -> bool {
        match &self.snapshot {
            Some(snapshot) => snapshot.as_slice() != current,
            None => true,
        }
    }

    /// Snapshot elements no longer present in `current`
    pub fn orphans(&self, current: &[InstanceId]) -> Vec<InstanceId> {
        self.snapshot
            .iter()
            .flatten()
            .filter(|element| !current.contains(element))
            .copied()
            .collect()
    }

    /// Whether the owner was reached during the current flush
    pub fn is_reached(&self) -> bool {
        self.reached
    }

    pub(crate) fn mark_reached(&mut self) {
        self.reached = true;
    }

    /// Action decided for the current flush
    pub fn action(&self) -> Option<CollectionAction> {
        self.action
    }

    pub(crate) fn set_action(&mut self, action: Option<CollectionAction>) {
        self.action = action;
    }

    /// Forget the previous flush's decisions
    pub(crate) fn unmark(&mut self) {
        self.reached = false;
        self.action = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{EntityInstance, Instances};
    use dormant_core::{EntityMapping, Identifier};
    use std::sync::Arc;

    fn ids(n: usize) -> Vec<InstanceId> {
        let mut arena = Instances::new();
        let mapping = Arc::new(EntityMapping::new("Line"));
        (0..n)
            .map(|_| arena.insert(EntityInstance::new(Arc::clone(&mapping))))
            .collect()
    }

    fn key() -> CollectionKey {
        CollectionKey::new("Order.lines", Identifier::Int(1))
    }

    #[test]
    fn test_new_collection_is_dirty() {
        let entry = CollectionEntry::new_collection("Order.lines".into(), key(), false);
        assert!(entry.is_dirty(&[]));
        assert!(entry.orphans(&[]).is_empty());
    }

    #[test]
    fn test_orphans_are_removed_elements() {
        let lines = ids(3);
        let entry = CollectionEntry::loaded("Order.lines".into(), key(), false, lines.clone());
        assert!(!entry.is_dirty(&lines));
        let current = vec![lines[0], lines[2]];
        assert!(entry.is_dirty(&current));
        assert_eq!(entry.orphans(&current), vec![lines[1]]);
    }
}
