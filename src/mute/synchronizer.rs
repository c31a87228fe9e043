//! Local copy of the session's mute state.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::ObjectPath;
use crate::protocol::{ChangeMuteStateRequest, MuteSetting, QueryMuteStateResponse};

/// Resolves whether `object` is muted given explicit mute and unmute entries.
///
/// The nearest explicit entry wins. An entry on an outer object only applies if its setting
/// affects sub-objects. Returns `None` if no entry applies.
pub fn resolve_mute_state(
    object: &ObjectPath,
    explicitly_muted: &BTreeMap<ObjectPath, MuteSetting>,
    explicitly_unmuted: &BTreeMap<ObjectPath, MuteSetting>,
) -> Option<bool> {
    if explicitly_unmuted.contains_key(object) {
        return Some(false);
    }
    if explicitly_muted.contains_key(object) {
        return Some(true);
    }
    for outer in object.outer_chain() {
        if explicitly_unmuted
            .get(&outer)
            .is_some_and(MuteSetting::affects_subobjects)
        {
            return Some(false);
        }
        if explicitly_muted
            .get(&outer)
            .is_some_and(MuteSetting::affects_subobjects)
        {
            return Some(true);
        }
    }
    None
}

/// Server-confirmed mute state plus read-your-writes updates.
#[derive(Debug, Clone, Default)]
pub struct MuteStateSynchronizer {
    explicitly_muted: BTreeMap<ObjectPath, MuteSetting>,
    explicitly_unmuted: BTreeMap<ObjectPath, MuteSetting>,
    /// Implicit mutes as last reported by the server
    implicitly_muted: BTreeSet<ObjectPath>,
    /// Union of explicit and implicit mutes
    muted_objects: BTreeSet<ObjectPath>,
}

impl MuteStateSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn explicitly_muted(&self) -> &BTreeMap<ObjectPath, MuteSetting> {
        &self.explicitly_muted
    }

    pub fn explicitly_unmuted(&self) -> &BTreeMap<ObjectPath, MuteSetting> {
        &self.explicitly_unmuted
    }

    pub fn muted_objects(&self) -> &BTreeSet<ObjectPath> {
        &self.muted_objects
    }

    pub fn is_explicitly_muted(&self, object: &ObjectPath) -> bool {
        self.explicitly_muted.contains_key(object)
    }

    pub fn is_explicitly_unmuted(&self, object: &ObjectPath) -> bool {
        self.explicitly_unmuted.contains_key(object)
    }

    /// Whether the object is muted, directly or through an outer object.
    pub fn is_muted(&self, object: &ObjectPath) -> bool {
        match resolve_mute_state(object, &self.explicitly_muted, &self.explicitly_unmuted) {
            Some(muted) => muted,
            None => self.implicitly_muted.contains(object),
        }
    }

    /// Replaces the local state with the server's. Returns true if anything changed.
    pub fn apply_query_response(&mut self, response: &QueryMuteStateResponse) -> bool {
        let changed = self.explicitly_muted != response.explicitly_muted
            || self.explicitly_unmuted != response.explicitly_unmuted
            || self.implicitly_muted != response.implicitly_muted;
        self.explicitly_muted = response.explicitly_muted.clone();
        self.explicitly_unmuted = response.explicitly_unmuted.clone();
        self.implicitly_muted = response.implicitly_muted.clone();
        self.rebuild_muted_objects();
        changed
    }

    /// Applies a request the server accepted.
    pub fn apply_request(&mut self, request: &ChangeMuteStateRequest) {
        if request.flags.clear_mute_state {
            self.explicitly_muted.clear();
            self.explicitly_unmuted.clear();
            self.implicitly_muted.clear();
        }
        for (object, setting) in &request.objects_to_mute {
            self.explicitly_unmuted.remove(object);
            self.explicitly_muted.insert(object.clone(), *setting);
        }
        for (object, setting) in &request.objects_to_unmute {
            if self.explicitly_muted.remove(object).is_none() {
                self.explicitly_unmuted.insert(object.clone(), *setting);
            }
            self.implicitly_muted.remove(object);
        }
        self.rebuild_muted_objects();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn rebuild_muted_objects(&mut self) {
        self.muted_objects = self
            .explicitly_muted
            .keys()
            .chain(self.implicitly_muted.iter())
            .cloned()
            .collect();
    }
}
