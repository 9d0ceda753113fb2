//! Identity map and change tracking for one session scope.

use quarry_store::{Entity, EntityKey, Row};
use std::collections::BTreeMap;

struct Tracked {
    original: Entity,
    current: Entity,
}

/// Entities registered by the `Tracked` strategy, keyed by type and
/// identifier.
///
/// Each entry keeps the snapshot it was loaded with, so pending changes are a
/// field-level diff rather than a full rewrite.
#[derive(Default)]
pub struct ChangeTracker {
    entries: BTreeMap<EntityKey, Tracked>,
}

impl ChangeTracker {
    /// Register a freshly loaded entity.
    ///
    /// If the same identity is already tracked, the tracked (possibly
    /// modified) state wins and is returned instead of `entity`.
    pub fn track(&mut self, entity: Entity) -> Entity {
        self.entries
            .entry(entity.key().clone())
            .or_insert_with(|| Tracked { original: entity.clone(), current: entity })
            .current
            .clone()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Entity> {
        self.entries.get(key).map(|t| &t.current)
    }

    pub(crate) fn get_mut(&mut self, key: &EntityKey) -> Option<&mut Entity> {
        self.entries.get_mut(key).map(|t| &mut t.current)
    }

    pub fn is_tracked(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_modified(&self, key: &EntityKey) -> bool {
        self.entries.get(key).is_some_and(|t| !t.current.changes_since(&t.original).is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changed fields of every modified entity, in key order.
    pub fn pending(&self) -> Vec<(EntityKey, Row)> {
        self.entries
            .iter()
            .filter_map(|(key, t)| {
                let changes = t.current.changes_since(&t.original);
                (!changes.is_empty()).then(|| (key.clone(), changes))
            })
            .collect()
    }

    /// The current state has been written; make it the new original.
    pub(crate) fn accept(&mut self, key: &EntityKey) {
        if let Some(t) = self.entries.get_mut(key) {
            t.original = t.current.clone();
        }
    }

    pub(crate) fn forget(&mut self, key: &EntityKey) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
