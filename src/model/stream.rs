//! Stream content types.
//!
//! A stream is the server-tracked collection of `(object, property-set)` registrations of one
//! client. Its content is an [`ObjectReplicationMap`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::object_path::ObjectPath;
use crate::model::property_chain::PropertyChain;

/// Identifies a stream of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    pub fn new_v4() -> Self {
        StreamId(Uuid::new_v4())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The one stream id every Multi-User client registers its content under.
///
/// Clients may own other streams; those are ignored by this crate.
pub const MULTI_USER_STREAM_ID: StreamId =
    StreamId(Uuid::from_u128(0x5d8a_c1e0_6b73_4f2a_9c4e_07a1_d3b2_e915));

/// Set of stream ids, used by authority requests.
pub type StreamIdSet = BTreeSet<StreamId>;

/// Which properties of one object are replicated within one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedObjectInfo {
    /// Class of the object, kept so a receiver can validate the selection
    #[serde(default)]
    pub class_path: String,
    /// The replicated properties
    pub property_selection: BTreeSet<PropertyChain>,
}

impl ReplicatedObjectInfo {
    pub fn new(class_path: impl Into<String>) -> Self {
        ReplicatedObjectInfo {
            class_path: class_path.into(),
            property_selection: BTreeSet::new(),
        }
    }

    /// Builds an info from a list of dotted property paths.
    pub fn with_properties<'a>(
        class_path: impl Into<String>,
        properties: impl IntoIterator<Item = &'a PropertyChain>,
    ) -> Self {
        ReplicatedObjectInfo {
            class_path: class_path.into(),
            property_selection: properties.into_iter().cloned().collect(),
        }
    }

    /// An object without properties is not actually replicated.
    pub fn is_replicated(&self) -> bool {
        !self.property_selection.is_empty()
    }

    /// Returns true if every property of `self` is also selected by `other`.
    pub fn is_subset_of(&self, other: &ReplicatedObjectInfo) -> bool {
        self.property_selection.is_subset(&other.property_selection)
    }
}

/// The full content of one stream: which objects are replicated and with which properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectReplicationMap {
    pub objects: BTreeMap<ObjectPath, ReplicatedObjectInfo>,
}

static EMPTY_REPLICATION_MAP: ObjectReplicationMap = ObjectReplicationMap {
    objects: BTreeMap::new(),
};

impl ObjectReplicationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared empty map, for lookups on clients without a stream.
    pub fn empty() -> &'static ObjectReplicationMap {
        &EMPTY_REPLICATION_MAP
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn contains_object(&self, object: &ObjectPath) -> bool {
        self.objects.contains_key(object)
    }

    pub fn get(&self, object: &ObjectPath) -> Option<&ReplicatedObjectInfo> {
        self.objects.get(object)
    }

    pub fn properties(&self, object: &ObjectPath) -> Option<&BTreeSet<PropertyChain>> {
        self.objects.get(object).map(|info| &info.property_selection)
    }

    pub fn has_property(&self, object: &ObjectPath, property: &PropertyChain) -> bool {
        self.properties(object)
            .is_some_and(|properties| properties.contains(property))
    }

    /// Adds properties to an object, creating the entry if needed.
    pub fn add_properties<'a>(
        &mut self,
        object: &ObjectPath,
        class_path: &str,
        properties: impl IntoIterator<Item = &'a PropertyChain>,
    ) {
        let info = self
            .objects
            .entry(object.clone())
            .or_insert_with(|| ReplicatedObjectInfo::new(class_path));
        info.property_selection.extend(properties.into_iter().cloned());
    }

    /// Removes properties from an object. The entry is dropped once it is empty.
    pub fn remove_properties<'a>(
        &mut self,
        object: &ObjectPath,
        properties: impl IntoIterator<Item = &'a PropertyChain>,
    ) {
        if let Some(info) = self.objects.get_mut(object) {
            for property in properties {
                info.property_selection.remove(property);
            }
            if !info.is_replicated() {
                self.objects.remove(object);
            }
        }
    }

    pub fn remove_object(&mut self, object: &ObjectPath) -> Option<ReplicatedObjectInfo> {
        self.objects.remove(object)
    }

    /// Drops every entry whose property selection is empty.
    pub fn remove_unreplicated(&mut self) {
        self.objects.retain(|_, info| info.is_replicated());
    }
}

/// How often replicated objects send updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Send an update every tick
    #[default]
    Realtime,
    /// Send at a fixed rate
    SpecifiedRate,
}

/// A frequency for one object or a stream default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFrequency {
    pub mode: ReplicationMode,
    pub rate_hz: u8,
}

impl Default for ObjectFrequency {
    fn default() -> Self {
        ObjectFrequency {
            mode: ReplicationMode::Realtime,
            rate_hz: 30,
        }
    }
}

/// Frequency settings of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencySettings {
    pub defaults: ObjectFrequency,
    #[serde(default)]
    pub overrides: BTreeMap<ObjectPath, ObjectFrequency>,
}

impl FrequencySettings {
    pub fn frequency_for(&self, object: &ObjectPath) -> ObjectFrequency {
        self.overrides.get(object).copied().unwrap_or(self.defaults)
    }
}

/// One stream of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub stream_id: StreamId,
    pub replication_map: ObjectReplicationMap,
    #[serde(default)]
    pub frequency_settings: FrequencySettings,
}

impl StreamDescription {
    pub fn new(stream_id: StreamId) -> Self {
        StreamDescription {
            stream_id,
            replication_map: ObjectReplicationMap::new(),
            frequency_settings: FrequencySettings::default(),
        }
    }

    /// An empty Multi-User stream.
    pub fn multi_user() -> Self {
        Self::new(MULTI_USER_STREAM_ID)
    }

    pub fn is_multi_user(&self) -> bool {
        self.stream_id == MULTI_USER_STREAM_ID
    }
}

/// Returns the Multi-User stream of a list of streams, if it exists.
pub fn find_multi_user_stream(streams: &[StreamDescription]) -> Option<&StreamDescription> {
    streams.iter().find(|stream| stream.is_multi_user())
}
