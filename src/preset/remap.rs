//! Translation between world object paths and label-based preset paths.

use std::collections::{BTreeSet, HashMap};

use crate::model::ObjectPath;
use crate::preset::format::LabelObjectPath;

/// Read access to the world a preset is exported from or applied to.
pub trait SceneResolver: Send + Sync {
    /// The user-facing label of an actor.
    fn actor_label(&self, actor: &ObjectPath) -> Option<String>;

    /// The actor carrying `label` in the current world.
    fn find_actor_by_label(&self, label: &str) -> Option<ObjectPath>;

    fn object_exists(&self, object: &ObjectPath) -> bool;
}

/// Converts a world path into its label form. `None` if the actor has no label.
pub fn to_label_path(resolver: &dyn SceneResolver, object: &ObjectPath) -> Option<LabelObjectPath> {
    let label = resolver.actor_label(&object.actor())?;
    let subobjects = object
        .subobject_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    Some(LabelObjectPath::new(label, subobjects))
}

/// Finds the object a label path refers to in the current world.
pub fn remap_to_world(resolver: &dyn SceneResolver, path: &LabelObjectPath) -> Option<ObjectPath> {
    let actor = resolver.find_actor_by_label(&path.actor_label)?;
    let object = actor.join_subobjects(path.subobjects.iter().map(String::as_str));
    resolver.object_exists(&object).then_some(object)
}

/// A fixed scene, built up front.
#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    labels: HashMap<ObjectPath, String>,
    actors_by_label: HashMap<String, ObjectPath>,
    objects: BTreeSet<ObjectPath>,
}

impl StaticScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, label: impl Into<String>, actor: ObjectPath) -> Self {
        let label = label.into();
        self.objects.insert(actor.clone());
        self.labels.insert(actor.clone(), label.clone());
        self.actors_by_label.insert(label, actor);
        self
    }

    /// Adds a sub-object. Its actor must be added with [`Self::with_actor`].
    pub fn with_object(mut self, object: ObjectPath) -> Self {
        self.objects.insert(object);
        self
    }
}

impl SceneResolver for StaticScene {
    fn actor_label(&self, actor: &ObjectPath) -> Option<String> {
        self.labels.get(actor).cloned()
    }

    fn find_actor_by_label(&self, label: &str) -> Option<ObjectPath> {
        self.actors_by_label.get(label).cloned()
    }

    fn object_exists(&self, object: &ObjectPath) -> bool {
        self.objects.contains(object)
    }
}
