//! Object paths.
//!
//! Replicated objects are addressed by their path in the edited world, in the form
//! `<World>:<Actor>.<SubObject>.<SubObject>`. The part before `:` names the world, the first
//! segment after it is the actor and any further segments are nested sub-objects
//! (components and their children).

use std::fmt;

use serde::{Deserialize, Serialize};

const WORLD_SEPARATOR: char = ':';
const SUBOBJECT_SEPARATOR: char = '.';

/// Path of a replicated object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        ObjectPath(path.into())
    }

    /// Builds the path of an actor inside a world.
    pub fn actor_in_world(world: &str, actor: &str) -> Self {
        ObjectPath(format!("{world}{WORLD_SEPARATOR}{actor}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The world part of the path. Empty if the path carries no world.
    pub fn world(&self) -> &str {
        self.0
            .split_once(WORLD_SEPARATOR)
            .map(|(world, _)| world)
            .unwrap_or("")
    }

    fn object_part(&self) -> &str {
        self.0
            .split_once(WORLD_SEPARATOR)
            .map(|(_, rest)| rest)
            .unwrap_or(&self.0)
    }

    /// The last segment of the path.
    pub fn object_name(&self) -> &str {
        let object = self.object_part();
        object
            .rsplit_once(SUBOBJECT_SEPARATOR)
            .map(|(_, name)| name)
            .unwrap_or(object)
    }

    /// The object that directly owns this one, or `None` for an actor.
    pub fn outer(&self) -> Option<ObjectPath> {
        let (outer, _) = self.0.rsplit_once(SUBOBJECT_SEPARATOR)?;
        // A separator that belongs to the world name does not make an outer.
        if outer.len() < self.0.len() - self.object_part().len() {
            return None;
        }
        Some(ObjectPath(outer.to_string()))
    }

    /// Iterates every outer object, nearest first.
    pub fn outer_chain(&self) -> impl Iterator<Item = ObjectPath> {
        std::iter::successors(self.outer(), |path| path.outer())
    }

    /// The top-level actor this object belongs to.
    pub fn actor(&self) -> ObjectPath {
        let object = self.object_part();
        let actor_name = object
            .split_once(SUBOBJECT_SEPARATOR)
            .map(|(actor, _)| actor)
            .unwrap_or(object);
        let prefix_len = self.0.len() - object.len();
        ObjectPath(format!("{}{}", &self.0[..prefix_len], actor_name))
    }

    pub fn is_actor(&self) -> bool {
        !self.object_part().contains(SUBOBJECT_SEPARATOR)
    }

    /// Names of the sub-objects between the actor and this object, outermost first.
    pub fn subobject_names(&self) -> Vec<&str> {
        self.object_part().split(SUBOBJECT_SEPARATOR).skip(1).collect()
    }

    /// Appends sub-object names to this path.
    pub fn join_subobjects<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> ObjectPath {
        let mut path = self.0.clone();
        for name in names {
            path.push(SUBOBJECT_SEPARATOR);
            path.push_str(name);
        }
        ObjectPath(path)
    }

    /// Returns true if `self` is nested (at any depth) inside `other`.
    pub fn is_child_of(&self, other: &ObjectPath) -> bool {
        self.0.len() > other.0.len()
            && self.0.starts_with(other.as_str())
            && self.0[other.0.len()..].starts_with(SUBOBJECT_SEPARATOR)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(value: &str) -> Self {
        ObjectPath::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_components() {
        let path = ObjectPath::new("/Game/Map.Map:Floor.StaticMeshComponent0");
        assert_eq!(path.world(), "/Game/Map.Map");
        assert_eq!(path.object_name(), "StaticMeshComponent0");
        assert_eq!(path.actor(), ObjectPath::new("/Game/Map.Map:Floor"));
        assert_eq!(path.subobject_names(), vec!["StaticMeshComponent0"]);
        assert!(!path.is_actor());
        assert!(path.actor().is_actor());
    }

    #[test]
    fn test_outer_stops_at_actor() {
        let actor = ObjectPath::new("/Game/Map.Map:Floor");
        assert_eq!(actor.outer(), None);

        let nested = ObjectPath::new("/Game/Map.Map:Floor.Root.Mesh");
        let outers: Vec<ObjectPath> = nested.outer_chain().collect();
        assert_eq!(
            outers,
            vec![
                ObjectPath::new("/Game/Map.Map:Floor.Root"),
                ObjectPath::new("/Game/Map.Map:Floor"),
            ]
        );
    }

    #[test]
    fn test_child_relation() {
        let actor = ObjectPath::new("World:Cube");
        let component = ObjectPath::new("World:Cube.Mesh");
        let other = ObjectPath::new("World:CubeTwo");

        assert!(component.is_child_of(&actor));
        assert!(!actor.is_child_of(&component));
        assert!(!other.is_child_of(&actor));
        assert!(!actor.is_child_of(&actor));
    }

    #[test]
    fn test_join_subobjects() {
        let actor = ObjectPath::actor_in_world("World", "Cube");
        let joined = actor.join_subobjects(["Root", "Mesh"]);
        assert_eq!(joined.as_str(), "World:Cube.Root.Mesh");
    }
}
