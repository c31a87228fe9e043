//! The serializable preset format.
//!
//! A preset stores objects by actor label instead of by path so it can be applied to another
//! world (or a reloaded one) where the same actors have different paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PresetError;
use crate::model::{ClientIdentity, FrequencySettings, ObjectFrequency, PropertyChain};
use crate::protocol::MuteSetting;

/// An object addressed by the label of its actor plus the sub-object names below the actor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelObjectPath {
    pub actor_label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subobjects: Vec<String>,
}

impl LabelObjectPath {
    pub fn new(actor_label: impl Into<String>, subobjects: Vec<String>) -> Self {
        LabelObjectPath {
            actor_label: actor_label.into(),
            subobjects,
        }
    }

    pub fn actor(actor_label: impl Into<String>) -> Self {
        Self::new(actor_label, Vec::new())
    }
}

impl fmt::Display for LabelObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.actor_label)?;
        for name in &self.subobjects {
            write!(f, ".{name}")?;
        }
        Ok(())
    }
}

/// One object in a client's preset stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetObject {
    pub path: LabelObjectPath,
    #[serde(default)]
    pub class_path: String,
    pub properties: BTreeSet<PropertyChain>,
    /// Whether the client had authority over the object when the preset was exported
    #[serde(default)]
    pub has_authority: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_override: Option<ObjectFrequency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetClient {
    pub identity: ClientIdentity,
    pub objects: Vec<PresetObject>,
    #[serde(default)]
    pub default_frequency: ObjectFrequency,
}

impl PresetClient {
    /// Frequency settings without per-object overrides. Overrides are added when remapping.
    pub fn base_frequency_settings(&self) -> FrequencySettings {
        FrequencySettings {
            defaults: self.default_frequency,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetMuteEntry {
    pub path: LabelObjectPath,
    #[serde(default)]
    pub setting: MuteSetting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiUserSessionPreset {
    pub clients: Vec<PresetClient>,
    #[serde(default)]
    pub muted_objects: Vec<PresetMuteEntry>,
    #[serde(default)]
    pub unmuted_objects: Vec<PresetMuteEntry>,
}

impl MultiUserSessionPreset {
    pub fn to_json(&self) -> Result<String, PresetError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PresetError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Content for `identity`: the exact match, or else a client with the same display name.
    pub fn get_client_content(&self, identity: &ClientIdentity) -> Option<&PresetClient> {
        self.get_exact_client_content(identity).or_else(|| {
            self.clients
                .iter()
                .find(|client| client.identity.display_name == identity.display_name)
        })
    }

    /// Content for `identity`, only if both display and device name match.
    pub fn get_exact_client_content(&self, identity: &ClientIdentity) -> Option<&PresetClient> {
        self.clients
            .iter()
            .find(|client| client.identity.is_same_client(identity))
    }
}
