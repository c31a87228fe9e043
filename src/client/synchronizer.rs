//! Read-only views of what the server confirmed for one client.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{
    MULTI_USER_STREAM_ID, ObjectPath, ObjectReplicationMap, StreamDescription, StreamId,
    StreamIdSet, find_multi_user_stream,
};
use crate::protocol::{
    ChangeAuthorityRequest, ChangeAuthorityResponse, ChangeStreamRequest, ObjectInStreamId,
};

/// Server-confirmed streams of a client.
#[derive(Debug, Clone, Default)]
pub struct StreamSynchronizer {
    streams: Vec<StreamDescription>,
}

impl StreamSynchronizer {
    pub fn streams(&self) -> &[StreamDescription] {
        &self.streams
    }

    pub fn multi_user_stream(&self) -> Option<&StreamDescription> {
        find_multi_user_stream(&self.streams)
    }

    /// Content of the Multi-User stream, if the client has one.
    pub fn server_state(&self) -> Option<&ObjectReplicationMap> {
        self.multi_user_stream().map(|stream| &stream.replication_map)
    }

    pub fn is_registered(&self, object: &ObjectPath) -> bool {
        self.server_state()
            .is_some_and(|map| map.contains_object(object))
    }

    /// Replaces the confirmed streams. Returns true if anything changed.
    pub fn set_streams(&mut self, streams: Vec<StreamDescription>) -> bool {
        if self.streams == streams {
            return false;
        }
        self.streams = streams;
        true
    }

    /// Applies a stream change the server accepted.
    pub fn apply_change(&mut self, request: &ChangeStreamRequest) -> bool {
        request.apply_to(&mut self.streams)
    }
}

/// Server-confirmed authority of a client.
#[derive(Debug, Clone, Default)]
pub struct AuthoritySynchronizer {
    authority: BTreeMap<ObjectPath, StreamIdSet>,
    sync_control: BTreeSet<ObjectInStreamId>,
}

impl AuthoritySynchronizer {
    /// Whether the client owns the object in the Multi-User stream.
    pub fn has_authority_over(&self, object: &ObjectPath) -> bool {
        self.has_authority(object, MULTI_USER_STREAM_ID)
    }

    pub fn has_authority(&self, object: &ObjectPath, stream_id: StreamId) -> bool {
        self.authority
            .get(object)
            .is_some_and(|streams| streams.contains(&stream_id))
    }

    pub fn authority(&self) -> &BTreeMap<ObjectPath, StreamIdSet> {
        &self.authority
    }

    /// Objects owned in the Multi-User stream.
    pub fn owned_objects(&self) -> impl Iterator<Item = &ObjectPath> {
        self.authority
            .iter()
            .filter(|(_, streams)| streams.contains(&MULTI_USER_STREAM_ID))
            .map(|(object, _)| object)
    }

    pub fn sync_control(&self) -> &BTreeSet<ObjectInStreamId> {
        &self.sync_control
    }

    pub fn set_state(
        &mut self,
        authority: BTreeMap<ObjectPath, StreamIdSet>,
        sync_control: BTreeSet<ObjectInStreamId>,
    ) -> bool {
        let changed = self.authority != authority || self.sync_control != sync_control;
        self.authority = authority;
        self.sync_control = sync_control;
        changed
    }

    /// Applies the server's answer to an authority request.
    pub fn apply_response(
        &mut self,
        request: &ChangeAuthorityRequest,
        response: &ChangeAuthorityResponse,
    ) -> bool {
        let before = self.authority.clone();
        for (object, streams) in &request.take_authority {
            let rejected = response.rejected_objects.get(object);
            for stream_id in streams {
                if rejected.is_some_and(|r| r.contains(stream_id)) {
                    continue;
                }
                self.authority.entry(object.clone()).or_default().insert(*stream_id);
            }
        }
        for (object, streams) in &request.release_authority {
            if let Some(owned) = self.authority.get_mut(object) {
                owned.retain(|id| !streams.contains(id));
                if owned.is_empty() {
                    self.authority.remove(object);
                }
            }
        }
        let sync_changed = self.sync_control != response.sync_control;
        self.sync_control = response.sync_control.clone();
        sync_changed || before != self.authority
    }

    /// Drops authority over objects that are not registered in the owning stream.
    pub fn retain_registered(&mut self, streams: &StreamSynchronizer) -> bool {
        let before = self.authority.len();
        let mut changed = false;
        self.authority.retain(|object, stream_ids| {
            let count = stream_ids.len();
            stream_ids.retain(|stream_id| {
                streams.streams().iter().any(|s| {
                    s.stream_id == *stream_id && s.replication_map.contains_object(object)
                })
            });
            changed |= count != stream_ids.len();
            !stream_ids.is_empty()
        });
        let authority = &self.authority;
        self.sync_control
            .retain(|id| authority.get(&id.object).is_some_and(|s| s.contains(&id.stream_id)));
        changed || before != self.authority.len()
    }
}
