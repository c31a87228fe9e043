//! Request and response shapes exchanged with the replication server.
//!
//! Only the fields the client core reads or writes are modelled. Every request type knows
//! whether it is empty so vacuous requests can be answered locally instead of being sent.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{
    EndpointId, FrequencySettings, ObjectPath, ReplicatedObjectInfo, StreamDescription, StreamId,
    StreamIdSet,
};

/// Addresses one object inside one stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectInStreamId {
    pub stream_id: StreamId,
    pub object: ObjectPath,
}

impl ObjectInStreamId {
    pub fn new(stream_id: StreamId, object: ObjectPath) -> Self {
        ObjectInStreamId { stream_id, object }
    }
}

/// Sent when a client joins the replication session.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    /// Streams the client starts with
    pub streams: Vec<StreamDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResponse {
    Success,
    /// The server refused the join, e.g. because the client already joined
    Rejected { reason: String },
    FeatureDisabled,
}

/// Changes the stream content of the sending client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeStreamRequest {
    /// Objects whose info is replaced (or created)
    pub objects_to_put: BTreeMap<ObjectInStreamId, ReplicatedObjectInfo>,
    pub objects_to_remove: BTreeSet<ObjectInStreamId>,
    pub streams_to_add: Vec<StreamDescription>,
    pub streams_to_remove: BTreeSet<StreamId>,
    pub frequency_changes: BTreeMap<StreamId, FrequencySettings>,
}

impl ChangeStreamRequest {
    pub fn is_empty(&self) -> bool {
        self.objects_to_put.is_empty()
            && self.objects_to_remove.is_empty()
            && self.streams_to_add.is_empty()
            && self.streams_to_remove.is_empty()
            && self.frequency_changes.is_empty()
    }

    /// Applies the request to a client's stream list. Returns true if anything changed.
    pub fn apply_to(&self, streams: &mut Vec<StreamDescription>) -> bool {
        let before = streams.clone();

        streams.retain(|stream| !self.streams_to_remove.contains(&stream.stream_id));
        for added in &self.streams_to_add {
            match streams.iter_mut().find(|s| s.stream_id == added.stream_id) {
                Some(existing) => *existing = added.clone(),
                None => streams.push(added.clone()),
            }
        }
        for (object_id, info) in &self.objects_to_put {
            if let Some(stream) = streams.iter_mut().find(|s| s.stream_id == object_id.stream_id) {
                stream
                    .replication_map
                    .objects
                    .insert(object_id.object.clone(), info.clone());
            }
        }
        for object_id in &self.objects_to_remove {
            if let Some(stream) = streams.iter_mut().find(|s| s.stream_id == object_id.stream_id) {
                stream.replication_map.remove_object(&object_id.object);
                stream.frequency_settings.overrides.remove(&object_id.object);
            }
        }
        for (stream_id, settings) in &self.frequency_changes {
            if let Some(stream) = streams.iter_mut().find(|s| s.stream_id == *stream_id) {
                stream.frequency_settings = settings.clone();
            }
        }

        *streams != before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStreamErrorCode {
    Success,
    /// The request was rejected as a whole; see the per-object maps
    Rejected,
    Timeout,
    FeatureDisabled,
}

/// Why the server refused one object of a stream change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSemanticError {
    /// The object would have been put with an empty property selection
    EmptyPropertySelection,
    /// The referenced stream does not exist
    UnknownStream,
    /// The object is not in the stream it was removed from
    UnknownObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeStreamResponse {
    pub error_code: ChangeStreamErrorCode,
    /// Objects that would have conflicted with another client's authority, and that client
    pub authority_conflicts: BTreeMap<ObjectInStreamId, EndpointId>,
    pub semantic_errors: BTreeMap<ObjectInStreamId, StreamSemanticError>,
}

impl ChangeStreamResponse {
    pub fn success() -> Self {
        ChangeStreamResponse {
            error_code: ChangeStreamErrorCode::Success,
            authority_conflicts: BTreeMap::new(),
            semantic_errors: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == ChangeStreamErrorCode::Success
    }
}

/// Takes or releases authority over objects for the sending client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeAuthorityRequest {
    pub take_authority: BTreeMap<ObjectPath, StreamIdSet>,
    pub release_authority: BTreeMap<ObjectPath, StreamIdSet>,
}

impl ChangeAuthorityRequest {
    pub fn is_empty(&self) -> bool {
        self.take_authority.values().all(BTreeSet::is_empty)
            && self.release_authority.values().all(BTreeSet::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAuthorityErrorCode {
    /// The server processed the request; individual objects may still be rejected
    Handled,
    Timeout,
    AuthorityManagementDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeAuthorityResponse {
    pub error_code: ChangeAuthorityErrorCode,
    pub rejected_objects: BTreeMap<ObjectPath, StreamIdSet>,
    /// Objects the client is now allowed to actively replicate
    pub sync_control: BTreeSet<ObjectInStreamId>,
}

impl ChangeAuthorityResponse {
    /// The response given to a request that never needed to be sent.
    pub fn handled_locally() -> Self {
        ChangeAuthorityResponse {
            error_code: ChangeAuthorityErrorCode::Handled,
            rejected_objects: BTreeMap::new(),
            sync_control: BTreeSet::new(),
        }
    }
}

/// How a mute applies to the hierarchy below an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteOption {
    /// The object and every sub-object are affected
    #[default]
    ObjectAndSubobjects,
    /// Only the object itself is affected
    OnlyObject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MuteSetting {
    pub option: MuteOption,
}

impl MuteSetting {
    pub fn affects_subobjects(&self) -> bool {
        self.option == MuteOption::ObjectAndSubobjects
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeMuteStateFlags {
    /// Wipe the whole session's mute state before applying the request
    pub clear_mute_state: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeMuteStateRequest {
    pub objects_to_mute: BTreeMap<ObjectPath, MuteSetting>,
    pub objects_to_unmute: BTreeMap<ObjectPath, MuteSetting>,
    pub flags: ChangeMuteStateFlags,
}

impl ChangeMuteStateRequest {
    pub fn is_empty(&self) -> bool {
        self.objects_to_mute.is_empty()
            && self.objects_to_unmute.is_empty()
            && !self.flags.clear_mute_state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMuteStateErrorCode {
    Accepted,
    Rejected,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMuteStateResponse {
    pub error_code: ChangeMuteStateErrorCode,
    pub rejected_objects: BTreeSet<ObjectPath>,
}

impl ChangeMuteStateResponse {
    pub fn is_success(&self) -> bool {
        self.error_code == ChangeMuteStateErrorCode::Accepted
    }
}

/// The server's full view of the session's mute state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMuteStateResponse {
    pub explicitly_muted: BTreeMap<ObjectPath, MuteSetting>,
    pub explicitly_unmuted: BTreeMap<ObjectPath, MuteSetting>,
    /// Objects muted because an outer object is muted with sub-objects
    pub implicitly_muted: BTreeSet<ObjectPath>,
}

/// Replaces the content of many clients at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutStateRequest {
    /// Full new stream list of each listed client
    pub new_streams: BTreeMap<EndpointId, Vec<StreamDescription>>,
    /// Full new authority of each listed client
    pub new_authority_state: BTreeMap<EndpointId, BTreeSet<ObjectInStreamId>>,
    pub mute_change: ChangeMuteStateRequest,
}

impl PutStateRequest {
    pub fn is_empty(&self) -> bool {
        self.new_streams.is_empty()
            && self.new_authority_state.is_empty()
            && self.mute_change.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStateResponseCode {
    Success,
    Timeout,
    FeatureDisabled,
    ClientUnknown,
    StreamError,
    AuthorityConflict,
    MuteError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutStateResponse {
    pub response_code: PutStateResponseCode,
    pub unknown_endpoints: BTreeSet<EndpointId>,
    pub authority_conflicts: BTreeMap<EndpointId, BTreeSet<ObjectInStreamId>>,
}

impl PutStateResponse {
    pub fn with_code(response_code: PutStateResponseCode) -> Self {
        PutStateResponse {
            response_code,
            unknown_endpoints: BTreeSet::new(),
            authority_conflicts: BTreeMap::new(),
        }
    }
}

/// Asks for the server-confirmed state of some clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryClientStateRequest {
    pub endpoints: Vec<EndpointId>,
}

/// Server-confirmed state of one client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStateSnapshot {
    pub streams: Vec<StreamDescription>,
    pub authority: BTreeMap<ObjectPath, StreamIdSet>,
    pub sync_control: BTreeSet<ObjectInStreamId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryClientStateResponse {
    pub clients: BTreeMap<EndpointId, ClientStateSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MULTI_USER_STREAM_ID;

    #[test]
    fn test_authority_request_with_empty_sets_is_empty() {
        let mut request = ChangeAuthorityRequest::default();
        assert!(request.is_empty());

        request
            .take_authority
            .insert(ObjectPath::new("World:Cube"), StreamIdSet::new());
        assert!(request.is_empty());

        request
            .take_authority
            .get_mut(&ObjectPath::new("World:Cube"))
            .unwrap()
            .insert(MULTI_USER_STREAM_ID);
        assert!(!request.is_empty());
    }

    #[test]
    fn test_clear_flag_makes_mute_request_non_empty() {
        let mut request = ChangeMuteStateRequest::default();
        assert!(request.is_empty());
        request.flags.clear_mute_state = true;
        assert!(!request.is_empty());
    }
}
