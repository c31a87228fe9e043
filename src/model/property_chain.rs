//! Property paths on replicated objects.
//!
//! A [`PropertyChain`] identifies a (possibly nested) property, for example
//! `RelativeLocation.X`. Chains are compared structurally and form a tree: `Transform` is the
//! parent of `Transform.Location`, which is the parent of `Transform.Location.X`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator used by the textual form of a chain.
pub const PROPERTY_SEPARATOR: char = '.';

/// Returned when a textual property chain cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid property chain '{0}'")]
pub struct InvalidPropertyChain(pub String);

/// An ordered sequence of field names identifying a property path on an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PropertyChain {
    segments: Vec<String>,
}

impl PropertyChain {
    /// Builds a chain from its segments. Returns `None` for an empty path or an empty segment.
    pub fn from_segments<I, S>(segments: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(PropertyChain { segments })
    }

    /// Parses a dotted path, panicking on malformed input. Intended for literals.
    pub fn from_path(path: &str) -> Self {
        match path.parse() {
            Ok(chain) => chain,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Chains always contain at least one segment.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The top-level property this chain starts with.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// The chain one level up, or `None` for a root property.
    pub fn parent(&self) -> Option<PropertyChain> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(PropertyChain {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Iterates every strict ancestor, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = PropertyChain> + '_ {
        (1..self.segments.len()).rev().map(|len| PropertyChain {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// Returns true if `self` is a strict ancestor of `other`.
    pub fn is_parent_of(&self, other: &PropertyChain) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Returns true if `self` is a strict descendant of `other`.
    pub fn is_child_of(&self, other: &PropertyChain) -> bool {
        other.is_parent_of(self)
    }

    /// Two chains overlap if they are equal or one contains the other.
    ///
    /// Authority conflicts are detected with this relation.
    pub fn overlaps(&self, other: &PropertyChain) -> bool {
        self == other || self.is_parent_of(other) || other.is_parent_of(self)
    }
}

impl fmt::Display for PropertyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                write!(f, "{PROPERTY_SEPARATOR}")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl FromStr for PropertyChain {
    type Err = InvalidPropertyChain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropertyChain::from_segments(s.split(PROPERTY_SEPARATOR))
            .ok_or_else(|| InvalidPropertyChain(s.to_string()))
    }
}

impl TryFrom<String> for PropertyChain {
    type Error = InvalidPropertyChain;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PropertyChain> for String {
    fn from(chain: PropertyChain) -> Self {
        chain.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let chain: PropertyChain = "Transform.Location.X".parse().unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.root(), "Transform");
        assert_eq!(chain.to_string(), "Transform.Location.X");
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!("".parse::<PropertyChain>().is_err());
        assert!("Transform..X".parse::<PropertyChain>().is_err());
        assert!(".X".parse::<PropertyChain>().is_err());
    }

    #[test]
    fn test_hierarchy_relations() {
        let transform = PropertyChain::from_path("Transform");
        let location_x = PropertyChain::from_path("Transform.Location.X");
        let scale = PropertyChain::from_path("Scale");

        assert!(transform.is_parent_of(&location_x));
        assert!(location_x.is_child_of(&transform));
        assert!(!transform.is_parent_of(&transform));
        assert!(transform.overlaps(&location_x));
        assert!(location_x.overlaps(&transform));
        assert!(!scale.overlaps(&transform));
    }

    #[test]
    fn test_prefix_match_is_per_segment() {
        // "Location" must not be treated as a parent of "LocationOffset"
        let location = PropertyChain::from_path("Location");
        let offset = PropertyChain::from_path("LocationOffset");
        assert!(!location.overlaps(&offset));
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let chain = PropertyChain::from_path("A.B.C");
        let ancestors: Vec<String> = chain.ancestors().map(|c| c.to_string()).collect();
        assert_eq!(ancestors, vec!["A.B", "A"]);
        assert_eq!(chain.parent(), Some(PropertyChain::from_path("A.B")));
        assert_eq!(PropertyChain::from_path("A").parent(), None);
    }

    #[test]
    fn test_serializes_as_dotted_string() {
        let chain = PropertyChain::from_path("RelativeLocation.X");
        let json = serde_json::to_string(&chain).unwrap();
        assert_eq!(json, "\"RelativeLocation.X\"");
        let back: PropertyChain = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chain);
    }
}
