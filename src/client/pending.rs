//! Local edits of a client that were not submitted yet.

use std::collections::BTreeSet;

use crate::model::{FrequencySettings, ObjectPath, ObjectReplicationMap};

/// The uncommitted edit model of one client.
///
/// Stream edits are kept as a full copy of the post-submission Multi-User stream content,
/// created lazily from the confirmed state on the first edit.
#[derive(Debug, Clone, Default)]
pub struct PendingChanges {
    pub(crate) stream_edits: Option<ObjectReplicationMap>,
    pub(crate) frequency_edits: Option<FrequencySettings>,
    pub(crate) take_authority: BTreeSet<ObjectPath>,
    pub(crate) release_authority: BTreeSet<ObjectPath>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.stream_edits.is_none()
            && self.frequency_edits.is_none()
            && self.take_authority.is_empty()
            && self.release_authority.is_empty()
    }

    /// Mutable access to the post-submission map, seeded from `confirmed` on first use.
    pub(crate) fn stream_edits_mut(
        &mut self,
        confirmed: Option<&ObjectReplicationMap>,
    ) -> &mut ObjectReplicationMap {
        self.stream_edits
            .get_or_insert_with(|| confirmed.cloned().unwrap_or_default())
    }

    pub fn wants_authority(&self, object: &ObjectPath) -> bool {
        self.take_authority.contains(object)
    }

    pub fn releases_authority(&self, object: &ObjectPath) -> bool {
        self.release_authority.contains(object)
    }

    pub(crate) fn queue_take(&mut self, object: &ObjectPath) {
        self.release_authority.remove(object);
        self.take_authority.insert(object.clone());
    }

    pub(crate) fn queue_release(&mut self, object: &ObjectPath) {
        self.take_authority.remove(object);
        self.release_authority.insert(object.clone());
    }
}
