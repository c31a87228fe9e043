//! Parent/child index over object paths.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::model::object_path::ObjectPath;

/// Tracks which registered objects are nested in which other objects.
///
/// Outers of a tracked object are linked even if they are not tracked themselves, so a walk
/// from an actor reaches components registered without their owning actor.
#[derive(Debug, Default, Clone)]
pub struct ObjectHierarchy {
    tracked: HashSet<ObjectPath>,
    children: HashMap<ObjectPath, BTreeSet<ObjectPath>>,
}

impl ObjectHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, object: &ObjectPath) -> bool {
        self.tracked.contains(object)
    }

    pub fn add_object(&mut self, object: &ObjectPath) {
        if !self.tracked.insert(object.clone()) {
            return;
        }
        let mut child = object.clone();
        while let Some(outer) = child.outer() {
            let siblings = self.children.entry(outer.clone()).or_default();
            let newly_linked = siblings.insert(child);
            if !newly_linked {
                break;
            }
            child = outer;
        }
    }

    pub fn remove_object(&mut self, object: &ObjectPath) {
        if !self.tracked.remove(object) {
            return;
        }
        self.unlink_if_unused(object.clone());
    }

    fn unlink_if_unused(&mut self, mut object: ObjectPath) {
        loop {
            let has_children = self
                .children
                .get(&object)
                .is_some_and(|children| !children.is_empty());
            if has_children || self.tracked.contains(&object) {
                return;
            }
            self.children.remove(&object);
            let Some(outer) = object.outer() else {
                return;
            };
            if let Some(siblings) = self.children.get_mut(&outer) {
                siblings.remove(&object);
            }
            object = outer;
        }
    }

    /// Direct children of an object, tracked or implicit.
    pub fn direct_children(&self, object: &ObjectPath) -> impl Iterator<Item = &ObjectPath> {
        self.children.get(object).into_iter().flatten()
    }

    /// Calls `callback` with every tracked descendant of `object`, depth first.
    pub fn for_each_tracked_descendant(
        &self,
        object: &ObjectPath,
        callback: &mut dyn FnMut(&ObjectPath),
    ) {
        for child in self.direct_children(object) {
            if self.tracked.contains(child) {
                callback(child);
            }
            self.for_each_tracked_descendant(child, callback);
        }
    }

    pub fn has_tracked_descendants(&self, object: &ObjectPath) -> bool {
        let mut found = false;
        self.for_each_tracked_descendant(object, &mut |_| found = true);
        found
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}
