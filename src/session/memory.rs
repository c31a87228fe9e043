//! An in-process replication server.
//!
//! [`InMemoryServer`] arbitrates stream, authority and mute changes with the same conflict
//! rules the client uses, and keeps the session's activity log. Every connected client gets
//! an [`InMemorySession`] implementing [`ReplicationSession`] and [`ActivityLog`]. It backs the
//! demo binary and the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::authority::conflict::{ReplicationGroundTruth, collect_authority_conflicts};
use crate::error::TransportError;
use crate::model::{
    ClientIdentity, EndpointId, ObjectPath, StreamDescription, StreamId, StreamIdSet,
};
use crate::mute::synchronizer::resolve_mute_state;
use crate::protocol::{
    Activity, ActivityBatch, ActivityId, ActivityPayload, ChangeAuthorityErrorCode,
    ChangeAuthorityRequest, ChangeAuthorityResponse, ChangeMuteStateErrorCode,
    ChangeMuteStateRequest, ChangeMuteStateResponse, ChangeStreamErrorCode, ChangeStreamRequest,
    ChangeStreamResponse, ClientStateSnapshot, JoinRequest, JoinResponse,
    LeaveReplicationSnapshot, MuteSetting, ObjectInStreamId, PutStateRequest, PutStateResponse,
    PutStateResponseCode, QueryClientStateRequest, QueryClientStateResponse,
    QueryMuteStateResponse, StreamSemanticError,
};
use crate::session::{ActivityLog, ReplicationSession, ResponseFuture, SessionEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What the server knows about one client's replication content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ClientRecord {
    streams: Vec<StreamDescription>,
    authority: BTreeMap<ObjectPath, StreamIdSet>,
}

impl ClientRecord {
    fn snapshot(&self) -> ClientStateSnapshot {
        ClientStateSnapshot {
            streams: self.streams.clone(),
            authority: self.authority.clone(),
            sync_control: self.owned_objects(),
        }
    }

    fn owned_objects(&self) -> BTreeSet<ObjectInStreamId> {
        self.authority
            .iter()
            .flat_map(|(object, streams)| {
                streams
                    .iter()
                    .map(move |stream_id| ObjectInStreamId::new(*stream_id, object.clone()))
            })
            .collect()
    }

    fn is_registered(&self, object: &ObjectPath, stream_id: StreamId) -> bool {
        self.streams
            .iter()
            .any(|s| s.stream_id == stream_id && s.replication_map.contains_object(object))
    }

    /// Drops authority over objects that are no longer in the owning stream.
    fn drop_unregistered_authority(&mut self) {
        let streams = &self.streams;
        self.authority.retain(|object, stream_ids| {
            stream_ids.retain(|stream_id| {
                streams.iter().any(|s| {
                    s.stream_id == *stream_id && s.replication_map.contains_object(object)
                })
            });
            !stream_ids.is_empty()
        });
    }
}

/// Read-only ground truth over a set of client records.
struct RecordView<'a> {
    records: Vec<(EndpointId, &'a ClientRecord)>,
}

impl ReplicationGroundTruth for RecordView<'_> {
    fn for_each_client(&self, callback: &mut dyn FnMut(EndpointId) -> ControlFlow<()>) {
        for (endpoint_id, _) in &self.records {
            if callback(*endpoint_id).is_break() {
                return;
            }
        }
    }

    fn for_each_stream(
        &self,
        client: EndpointId,
        callback: &mut dyn FnMut(&StreamDescription) -> ControlFlow<()>,
    ) {
        let Some((_, record)) = self.records.iter().find(|(id, _)| *id == client) else {
            return;
        };
        for stream in &record.streams {
            if callback(stream).is_break() {
                return;
            }
        }
    }

    fn has_authority(&self, client: EndpointId, object: &ObjectPath, stream: StreamId) -> bool {
        self.records
            .iter()
            .find(|(id, _)| *id == client)
            .and_then(|(_, record)| record.authority.get(object))
            .is_some_and(|streams| streams.contains(&stream))
    }
}

struct ServerClient {
    identity: ClientIdentity,
    joined: bool,
    record: ClientRecord,
}

#[derive(Default)]
struct ServerState {
    clients: IndexMap<EndpointId, ServerClient>,
    /// Every identity ever seen, including disconnected endpoints
    identities: HashMap<EndpointId, ClientIdentity>,
    activities: Vec<Activity>,
    explicitly_muted: BTreeMap<ObjectPath, MuteSetting>,
    explicitly_unmuted: BTreeMap<ObjectPath, MuteSetting>,
    replication_disabled: bool,
    pending_timeouts: usize,
}

impl ServerState {
    fn view(&self) -> RecordView<'_> {
        RecordView {
            records: self
                .clients
                .iter()
                .filter(|(_, client)| client.joined)
                .map(|(id, client)| (*id, &client.record))
                .collect(),
        }
    }

    fn record_activity(&mut self, endpoint_id: EndpointId, payload: ActivityPayload) -> Activity {
        let activity = Activity {
            id: self.activities.len() as ActivityId + 1,
            endpoint_id,
            event_time: Utc::now(),
            payload,
        };
        self.activities.push(activity.clone());
        activity
    }

    fn take_timeout(&mut self) -> bool {
        if self.pending_timeouts > 0 {
            self.pending_timeouts -= 1;
            return true;
        }
        false
    }

    fn apply_mute_change(&mut self, request: &ChangeMuteStateRequest) {
        if request.flags.clear_mute_state {
            self.explicitly_muted.clear();
            self.explicitly_unmuted.clear();
        }
        for (object, setting) in &request.objects_to_mute {
            self.explicitly_unmuted.remove(object);
            self.explicitly_muted.insert(object.clone(), *setting);
        }
        for (object, setting) in &request.objects_to_unmute {
            if self.explicitly_muted.remove(object).is_none() {
                self.explicitly_unmuted.insert(object.clone(), *setting);
            }
        }
    }
}

fn contradicting_mute_objects(request: &ChangeMuteStateRequest) -> BTreeSet<ObjectPath> {
    request
        .objects_to_mute
        .keys()
        .filter(|object| request.objects_to_unmute.contains_key(*object))
        .cloned()
        .collect()
}

/// The in-process server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct InMemoryServer {
    state: Arc<Mutex<ServerState>>,
    events: broadcast::Sender<SessionEvent>,
    request_count: Arc<AtomicUsize>,
}

impl Default for InMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        InMemoryServer {
            state: Arc::new(Mutex::new(ServerState::default())),
            events,
            request_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Receives connect/disconnect and activity notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event published with no subscribers");
        }
    }

    /// Connects a new client and returns its session.
    pub fn connect(&self, identity: ClientIdentity) -> InMemorySession {
        let endpoint_id = EndpointId::new_v4();
        {
            let mut state = self.state.lock();
            state.identities.insert(endpoint_id, identity.clone());
            state.clients.insert(
                endpoint_id,
                ServerClient {
                    identity: identity.clone(),
                    joined: false,
                    record: ClientRecord::default(),
                },
            );
        }
        info!(%endpoint_id, client = %identity, "Client connected");
        self.publish(SessionEvent::ClientConnected {
            endpoint_id,
            identity,
        });
        InMemorySession {
            server: self.clone(),
            endpoint_id,
        }
    }

    /// Disconnects a client. A client still replicating leaves replication first.
    pub fn disconnect(&self, endpoint_id: EndpointId) {
        let (removed, leave_activity) = {
            let mut state = self.state.lock();
            let leave_activity = Self::leave_locked(&mut state, endpoint_id);
            (
                state.clients.shift_remove(&endpoint_id),
                leave_activity,
            )
        };
        let Some(client) = removed else {
            warn!(%endpoint_id, "Disconnect of unknown client ignored");
            return;
        };
        info!(%endpoint_id, client = %client.identity, "Client disconnected");
        self.publish(SessionEvent::ClientDisconnected { endpoint_id });
        if let Some(activity) = leave_activity {
            self.publish(SessionEvent::ActivityAdded {
                activity,
                identity: client.identity,
            });
        }
    }

    fn leave_locked(state: &mut ServerState, endpoint_id: EndpointId) -> Option<Activity> {
        let client = state.clients.get_mut(&endpoint_id)?;
        if !client.joined {
            return None;
        }
        client.joined = false;
        let record = std::mem::take(&mut client.record);
        let snapshot = LeaveReplicationSnapshot {
            streams: record.streams,
            owned_objects: record.authority,
        };
        Some(state.record_activity(endpoint_id, ActivityPayload::LeaveReplication(snapshot)))
    }

    /// Appends an arbitrary activity, for example a transaction.
    pub fn append_activity(&self, endpoint_id: EndpointId, payload: ActivityPayload) -> Activity {
        let (activity, identity) = {
            let mut state = self.state.lock();
            let identity = state.identities.get(&endpoint_id).cloned();
            (state.record_activity(endpoint_id, payload), identity)
        };
        if let Some(identity) = identity {
            self.publish(SessionEvent::ActivityAdded {
                activity: activity.clone(),
                identity,
            });
        }
        activity
    }

    /// Turns stream/authority/mute handling on or off.
    pub fn set_replication_enabled(&self, enabled: bool) {
        self.state.lock().replication_disabled = !enabled;
    }

    /// Makes the next `count` requests fail with a transport timeout.
    pub fn fail_next_requests_with_timeout(&self, count: usize) {
        self.state.lock().pending_timeouts += count;
    }

    /// Number of requests any session has sent so far.
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn connected_endpoints(&self) -> Vec<EndpointId> {
        self.state.lock().clients.keys().copied().collect()
    }

    /// Server-confirmed state of a joined client.
    pub fn client_state(&self, endpoint_id: EndpointId) -> Option<ClientStateSnapshot> {
        let state = self.state.lock();
        state
            .clients
            .get(&endpoint_id)
            .filter(|client| client.joined)
            .map(|client| client.record.snapshot())
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.state.lock().activities.clone()
    }

    pub fn is_explicitly_muted(&self, object: &ObjectPath) -> bool {
        self.state.lock().explicitly_muted.contains_key(object)
    }

    fn count_request(&self) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_join(
        &self,
        endpoint_id: EndpointId,
        request: JoinRequest,
    ) -> Result<JoinResponse, TransportError> {
        let (activity, identity) = {
            let mut state = self.state.lock();
            if state.take_timeout() {
                return Err(TransportError::Timeout);
            }
            if state.replication_disabled {
                return Ok(JoinResponse::FeatureDisabled);
            }
            let Some(client) = state.clients.get_mut(&endpoint_id) else {
                return Err(TransportError::Disconnected);
            };
            if client.joined {
                return Ok(JoinResponse::Rejected {
                    reason: "client already joined replication".to_string(),
                });
            }
            client.joined = true;
            client.record.streams = request.streams;
            for stream in &mut client.record.streams {
                stream.replication_map.remove_unreplicated();
            }
            let identity = client.identity.clone();
            (
                state.record_activity(endpoint_id, ActivityPayload::JoinReplication),
                identity,
            )
        };
        self.publish(SessionEvent::ActivityAdded { activity, identity });
        Ok(JoinResponse::Success)
    }

    fn handle_leave(&self, endpoint_id: EndpointId) {
        let (activity, identity) = {
            let mut state = self.state.lock();
            let identity = state.identities.get(&endpoint_id).cloned();
            (Self::leave_locked(&mut state, endpoint_id), identity)
        };
        if let (Some(activity), Some(identity)) = (activity, identity) {
            self.publish(SessionEvent::ActivityAdded { activity, identity });
        }
    }

    fn handle_change_stream(
        &self,
        endpoint_id: EndpointId,
        request: ChangeStreamRequest,
    ) -> Result<ChangeStreamResponse, TransportError> {
        let mut state = self.state.lock();
        if state.take_timeout() {
            return Err(TransportError::Timeout);
        }
        let mut response = ChangeStreamResponse::success();
        if state.replication_disabled {
            response.error_code = ChangeStreamErrorCode::FeatureDisabled;
            return Ok(response);
        }
        let Some(client) = state.clients.get(&endpoint_id).filter(|c| c.joined) else {
            response.error_code = ChangeStreamErrorCode::Rejected;
            return Ok(response);
        };

        let mut stream_ids: BTreeSet<StreamId> = client
            .record
            .streams
            .iter()
            .map(|s| s.stream_id)
            .filter(|id| !request.streams_to_remove.contains(id))
            .collect();
        stream_ids.extend(request.streams_to_add.iter().map(|s| s.stream_id));

        let view = state.view();
        for (object_id, info) in &request.objects_to_put {
            if !stream_ids.contains(&object_id.stream_id) {
                response
                    .semantic_errors
                    .insert(object_id.clone(), StreamSemanticError::UnknownStream);
                continue;
            }
            if !info.is_replicated() {
                response
                    .semantic_errors
                    .insert(object_id.clone(), StreamSemanticError::EmptyPropertySelection);
                continue;
            }
            if view.has_authority(endpoint_id, &object_id.object, object_id.stream_id) {
                let conflicts = collect_authority_conflicts(
                    &view,
                    endpoint_id,
                    &object_id.object,
                    &info.property_selection,
                );
                if let Some((other, _)) = conflicts.first() {
                    response.authority_conflicts.insert(object_id.clone(), *other);
                }
            }
        }
        for added in &request.streams_to_add {
            let has_empty = added
                .replication_map
                .objects
                .values()
                .any(|info| !info.is_replicated());
            if has_empty {
                for (object, _) in added
                    .replication_map
                    .objects
                    .iter()
                    .filter(|(_, info)| !info.is_replicated())
                {
                    response.semantic_errors.insert(
                        ObjectInStreamId::new(added.stream_id, object.clone()),
                        StreamSemanticError::EmptyPropertySelection,
                    );
                }
            }
        }
        drop(view);

        if !response.semantic_errors.is_empty() || !response.authority_conflicts.is_empty() {
            debug!(%endpoint_id, "Stream change rejected");
            response.error_code = ChangeStreamErrorCode::Rejected;
            return Ok(response);
        }

        if let Some(client) = state.clients.get_mut(&endpoint_id) {
            request.apply_to(&mut client.record.streams);
            client.record.drop_unregistered_authority();
        }
        Ok(response)
    }

    fn handle_change_authority(
        &self,
        endpoint_id: EndpointId,
        request: ChangeAuthorityRequest,
    ) -> Result<ChangeAuthorityResponse, TransportError> {
        let mut state = self.state.lock();
        if state.take_timeout() {
            return Err(TransportError::Timeout);
        }
        let mut response = ChangeAuthorityResponse::handled_locally();
        if state.replication_disabled {
            response.error_code = ChangeAuthorityErrorCode::AuthorityManagementDisabled;
            return Ok(response);
        }
        let joined = state.clients.get(&endpoint_id).is_some_and(|c| c.joined);
        if !joined {
            response.rejected_objects = request.take_authority;
            return Ok(response);
        }

        let mut granted: Vec<(ObjectPath, StreamId)> = Vec::new();
        {
            let view = state.view();
            let record = &state.clients[&endpoint_id].record;
            for (object, stream_ids) in &request.take_authority {
                for stream_id in stream_ids {
                    let properties = record
                        .streams
                        .iter()
                        .find(|s| s.stream_id == *stream_id)
                        .and_then(|s| s.replication_map.properties(object));
                    let accepted = match properties {
                        Some(properties) => {
                            collect_authority_conflicts(&view, endpoint_id, object, properties)
                                .is_empty()
                        }
                        None => false,
                    };
                    if accepted {
                        granted.push((object.clone(), *stream_id));
                    } else {
                        response
                            .rejected_objects
                            .entry(object.clone())
                            .or_default()
                            .insert(*stream_id);
                    }
                }
            }
        }

        if let Some(client) = state.clients.get_mut(&endpoint_id) {
            for (object, stream_id) in granted {
                client.record.authority.entry(object).or_default().insert(stream_id);
            }
            for (object, stream_ids) in &request.release_authority {
                if let Some(owned) = client.record.authority.get_mut(object) {
                    owned.retain(|id| !stream_ids.contains(id));
                    if owned.is_empty() {
                        client.record.authority.remove(object);
                    }
                }
            }
            response.sync_control = client.record.owned_objects();
        }
        Ok(response)
    }

    fn handle_change_mute_state(
        &self,
        endpoint_id: EndpointId,
        request: ChangeMuteStateRequest,
    ) -> Result<ChangeMuteStateResponse, TransportError> {
        let (activity, identity) = {
            let mut state = self.state.lock();
            if state.take_timeout() {
                return Err(TransportError::Timeout);
            }
            if state.replication_disabled {
                return Ok(ChangeMuteStateResponse {
                    error_code: ChangeMuteStateErrorCode::Rejected,
                    rejected_objects: BTreeSet::new(),
                });
            }
            let contradicting = contradicting_mute_objects(&request);
            if !contradicting.is_empty() {
                return Ok(ChangeMuteStateResponse {
                    error_code: ChangeMuteStateErrorCode::Rejected,
                    rejected_objects: contradicting,
                });
            }
            state.apply_mute_change(&request);
            let identity = state.identities.get(&endpoint_id).cloned();
            (
                state.record_activity(endpoint_id, ActivityPayload::ChangeMuteState),
                identity,
            )
        };
        if let Some(identity) = identity {
            self.publish(SessionEvent::ActivityAdded { activity, identity });
        }
        Ok(ChangeMuteStateResponse {
            error_code: ChangeMuteStateErrorCode::Accepted,
            rejected_objects: BTreeSet::new(),
        })
    }

    fn handle_query_mute_state(&self) -> Result<QueryMuteStateResponse, TransportError> {
        let mut state = self.state.lock();
        if state.take_timeout() {
            return Err(TransportError::Timeout);
        }
        let mut implicitly_muted = BTreeSet::new();
        for client in state.clients.values().filter(|c| c.joined) {
            for stream in &client.record.streams {
                for object in stream.replication_map.objects.keys() {
                    if state.explicitly_muted.contains_key(object) {
                        continue;
                    }
                    let muted = resolve_mute_state(
                        object,
                        &state.explicitly_muted,
                        &state.explicitly_unmuted,
                    );
                    if muted == Some(true) {
                        implicitly_muted.insert(object.clone());
                    }
                }
            }
        }
        Ok(QueryMuteStateResponse {
            explicitly_muted: state.explicitly_muted.clone(),
            explicitly_unmuted: state.explicitly_unmuted.clone(),
            implicitly_muted,
        })
    }

    fn handle_put_state(&self, request: PutStateRequest) -> Result<PutStateResponse, TransportError> {
        let mut state = self.state.lock();
        if state.take_timeout() {
            return Err(TransportError::Timeout);
        }
        if state.replication_disabled {
            return Ok(PutStateResponse::with_code(PutStateResponseCode::FeatureDisabled));
        }

        let unknown_endpoints: BTreeSet<EndpointId> = request
            .new_streams
            .keys()
            .chain(request.new_authority_state.keys())
            .filter(|id| !state.clients.get(*id).is_some_and(|c| c.joined))
            .copied()
            .collect();
        if !unknown_endpoints.is_empty() {
            let mut response = PutStateResponse::with_code(PutStateResponseCode::ClientUnknown);
            response.unknown_endpoints = unknown_endpoints;
            return Ok(response);
        }

        let mut prospective: BTreeMap<EndpointId, ClientRecord> = state
            .clients
            .iter()
            .filter(|(_, client)| client.joined)
            .map(|(id, client)| (*id, client.record.clone()))
            .collect();
        for (endpoint_id, streams) in &request.new_streams {
            if let Some(record) = prospective.get_mut(endpoint_id) {
                record.streams = streams.clone();
            }
        }
        for (endpoint_id, owned) in &request.new_authority_state {
            if let Some(record) = prospective.get_mut(endpoint_id) {
                record.authority.clear();
                for object_id in owned {
                    record
                        .authority
                        .entry(object_id.object.clone())
                        .or_default()
                        .insert(object_id.stream_id);
                }
            }
        }

        for record in prospective.values() {
            let has_empty = record.streams.iter().any(|s| {
                s.replication_map
                    .objects
                    .values()
                    .any(|info| !info.is_replicated())
            });
            let owns_unregistered = record.authority.iter().any(|(object, stream_ids)| {
                stream_ids
                    .iter()
                    .any(|stream_id| !record.is_registered(object, *stream_id))
            });
            if has_empty || owns_unregistered {
                return Ok(PutStateResponse::with_code(PutStateResponseCode::StreamError));
            }
        }

        let mut authority_conflicts: BTreeMap<EndpointId, BTreeSet<ObjectInStreamId>> =
            BTreeMap::new();
        {
            let view = RecordView {
                records: prospective.iter().map(|(id, r)| (*id, r)).collect(),
            };
            for (endpoint_id, record) in &prospective {
                for (object, stream_ids) in &record.authority {
                    for stream_id in stream_ids {
                        let Some(properties) = record
                            .streams
                            .iter()
                            .find(|s| s.stream_id == *stream_id)
                            .and_then(|s| s.replication_map.properties(object))
                        else {
                            continue;
                        };
                        let conflicts =
                            collect_authority_conflicts(&view, *endpoint_id, object, properties);
                        if !conflicts.is_empty() {
                            authority_conflicts
                                .entry(*endpoint_id)
                                .or_default()
                                .insert(ObjectInStreamId::new(*stream_id, object.clone()));
                        }
                    }
                }
            }
        }
        if !authority_conflicts.is_empty() {
            let mut response =
                PutStateResponse::with_code(PutStateResponseCode::AuthorityConflict);
            response.authority_conflicts = authority_conflicts;
            return Ok(response);
        }

        if !contradicting_mute_objects(&request.mute_change).is_empty() {
            return Ok(PutStateResponse::with_code(PutStateResponseCode::MuteError));
        }

        for (endpoint_id, record) in prospective {
            if let Some(client) = state.clients.get_mut(&endpoint_id) {
                client.record = record;
            }
        }
        if !request.mute_change.is_empty() {
            state.apply_mute_change(&request.mute_change);
        }
        Ok(PutStateResponse::with_code(PutStateResponseCode::Success))
    }

    fn handle_query_client_state(
        &self,
        request: QueryClientStateRequest,
    ) -> Result<QueryClientStateResponse, TransportError> {
        let mut state = self.state.lock();
        if state.take_timeout() {
            return Err(TransportError::Timeout);
        }
        let clients = request
            .endpoints
            .iter()
            .filter_map(|endpoint_id| {
                state
                    .clients
                    .get(endpoint_id)
                    .map(|client| (*endpoint_id, client.record.snapshot()))
            })
            .collect();
        Ok(QueryClientStateResponse { clients })
    }
}

impl ActivityLog for InMemoryServer {
    fn last_activity_id(&self) -> ActivityId {
        self.state.lock().activities.len() as ActivityId
    }

    fn get_activities(&self, first_id: ActivityId, max_count: usize) -> ActivityBatch {
        let state = self.state.lock();
        let mut batch = ActivityBatch::default();
        let first_index = first_id.max(1) as usize - 1;
        for activity in state.activities.iter().skip(first_index).take(max_count) {
            if let Some(identity) = state.identities.get(&activity.endpoint_id) {
                batch
                    .client_infos
                    .insert(activity.endpoint_id, identity.clone());
            }
            batch.activities.push(activity.clone());
        }
        batch
    }
}

/// One client's connection to an [`InMemoryServer`].
#[derive(Clone)]
pub struct InMemorySession {
    server: InMemoryServer,
    endpoint_id: EndpointId,
}

impl InMemorySession {
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn server(&self) -> &InMemoryServer {
        &self.server
    }
}

impl ReplicationSession for InMemorySession {
    fn local_endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    fn local_client_info(&self) -> ClientIdentity {
        self.server
            .state
            .lock()
            .identities
            .get(&self.endpoint_id)
            .cloned()
            .unwrap_or_else(|| ClientIdentity::new("", ""))
    }

    fn session_client_endpoint_ids(&self) -> Vec<EndpointId> {
        self.server
            .connected_endpoints()
            .into_iter()
            .filter(|id| *id != self.endpoint_id)
            .collect()
    }

    fn client_info(&self, endpoint_id: EndpointId) -> Option<ClientIdentity> {
        self.server.state.lock().identities.get(&endpoint_id).cloned()
    }

    fn join(&self, request: JoinRequest) -> ResponseFuture<JoinResponse> {
        self.server.count_request();
        let server = self.server.clone();
        let endpoint_id = self.endpoint_id;
        async move { server.handle_join(endpoint_id, request) }.boxed()
    }

    fn leave(&self) {
        self.server.handle_leave(self.endpoint_id);
    }

    fn change_stream(&self, request: ChangeStreamRequest) -> ResponseFuture<ChangeStreamResponse> {
        self.server.count_request();
        let server = self.server.clone();
        let endpoint_id = self.endpoint_id;
        async move { server.handle_change_stream(endpoint_id, request) }.boxed()
    }

    fn change_authority(
        &self,
        request: ChangeAuthorityRequest,
    ) -> ResponseFuture<ChangeAuthorityResponse> {
        self.server.count_request();
        let server = self.server.clone();
        let endpoint_id = self.endpoint_id;
        async move { server.handle_change_authority(endpoint_id, request) }.boxed()
    }

    fn change_mute_state(
        &self,
        request: ChangeMuteStateRequest,
    ) -> ResponseFuture<ChangeMuteStateResponse> {
        self.server.count_request();
        let server = self.server.clone();
        let endpoint_id = self.endpoint_id;
        async move { server.handle_change_mute_state(endpoint_id, request) }.boxed()
    }

    fn query_mute_state(&self) -> ResponseFuture<QueryMuteStateResponse> {
        self.server.count_request();
        let server = self.server.clone();
        async move { server.handle_query_mute_state() }.boxed()
    }

    fn put_state(&self, request: PutStateRequest) -> ResponseFuture<PutStateResponse> {
        self.server.count_request();
        let server = self.server.clone();
        async move { server.handle_put_state(request) }.boxed()
    }

    fn query_client_state(
        &self,
        request: QueryClientStateRequest,
    ) -> ResponseFuture<QueryClientStateResponse> {
        self.server.count_request();
        let server = self.server.clone();
        async move { server.handle_query_client_state(request) }.boxed()
    }
}

impl ActivityLog for InMemorySession {
    fn last_activity_id(&self) -> ActivityId {
        self.server.last_activity_id()
    }

    fn get_activities(&self, first_id: ActivityId, max_count: usize) -> ActivityBatch {
        self.server.get_activities(first_id, max_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MULTI_USER_STREAM_ID, PropertyChain, ReplicatedObjectInfo};

    fn put_request(object: &ObjectPath, properties: &[&str]) -> ChangeStreamRequest {
        let chains: Vec<PropertyChain> =
            properties.iter().map(|p| PropertyChain::from_path(p)).collect();
        let mut request = ChangeStreamRequest::default();
        request.objects_to_put.insert(
            ObjectInStreamId::new(MULTI_USER_STREAM_ID, object.clone()),
            ReplicatedObjectInfo::with_properties("", chains.iter()),
        );
        request
    }

    fn take_request(object: &ObjectPath) -> ChangeAuthorityRequest {
        let mut request = ChangeAuthorityRequest::default();
        request
            .take_authority
            .insert(object.clone(), StreamIdSet::from([MULTI_USER_STREAM_ID]));
        request
    }

    async fn joined(server: &InMemoryServer, name: &str) -> InMemorySession {
        let session = server.connect(ClientIdentity::new(name, "Device"));
        let join = JoinRequest {
            streams: vec![StreamDescription::multi_user()],
        };
        assert_eq!(session.join(join).await.unwrap(), JoinResponse::Success);
        session
    }

    #[tokio::test]
    async fn test_first_authority_request_wins() {
        let server = InMemoryServer::new();
        let alice = joined(&server, "Alice").await;
        let bob = joined(&server, "Bob").await;
        let floor = ObjectPath::new("World:Floor");

        for session in [&alice, &bob] {
            let response = session
                .change_stream(put_request(&floor, &["RelativeLocation"]))
                .await
                .unwrap();
            assert!(response.is_success());
        }

        let alice_response = alice.change_authority(take_request(&floor)).await.unwrap();
        assert!(alice_response.rejected_objects.is_empty());
        let bob_response = bob.change_authority(take_request(&floor)).await.unwrap();
        assert!(bob_response.rejected_objects.contains_key(&floor));
    }

    #[tokio::test]
    async fn test_stream_change_conflicting_with_owner_is_rejected() {
        let server = InMemoryServer::new();
        let alice = joined(&server, "Alice").await;
        let bob = joined(&server, "Bob").await;
        let floor = ObjectPath::new("World:Floor");

        alice
            .change_stream(put_request(&floor, &["RelativeLocation"]))
            .await
            .unwrap();
        alice.change_authority(take_request(&floor)).await.unwrap();
        bob.change_stream(put_request(&floor, &["Scale"]))
            .await
            .unwrap();
        bob.change_authority(take_request(&floor)).await.unwrap();

        let response = bob
            .change_stream(put_request(&floor, &["RelativeLocation.X"]))
            .await
            .unwrap();
        assert_eq!(response.error_code, ChangeStreamErrorCode::Rejected);
        assert_eq!(response.authority_conflicts.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_selection_is_rejected() {
        let server = InMemoryServer::new();
        let alice = joined(&server, "Alice").await;
        let response = alice
            .change_stream(put_request(&ObjectPath::new("World:Cube"), &[]))
            .await
            .unwrap();
        assert_eq!(response.error_code, ChangeStreamErrorCode::Rejected);
        assert_eq!(response.semantic_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_records_leave_snapshot() {
        let server = InMemoryServer::new();
        let alice = joined(&server, "Alice").await;
        let cube = ObjectPath::new("World:Cube");
        alice
            .change_stream(put_request(&cube, &["Scale"]))
            .await
            .unwrap();
        alice.change_authority(take_request(&cube)).await.unwrap();

        server.disconnect(alice.endpoint_id());
        let activities = server.activities();
        let snapshot = activities.last().and_then(Activity::leave_snapshot).unwrap();
        assert!(snapshot.owned_objects.contains_key(&cube));
        assert!(snapshot.streams[0].replication_map.contains_object(&cube));
    }

    #[tokio::test]
    async fn test_injected_timeout() {
        let server = InMemoryServer::new();
        let alice = joined(&server, "Alice").await;
        server.fail_next_requests_with_timeout(1);
        assert_eq!(
            alice.query_mute_state().await.unwrap_err(),
            TransportError::Timeout
        );
        assert!(alice.query_mute_state().await.is_ok());
    }

    #[test]
    fn test_activity_batches_are_one_based() {
        let server = InMemoryServer::new();
        let session = server.connect(ClientIdentity::new("Alice", "Device"));
        for index in 0..3 {
            server.append_activity(
                session.endpoint_id(),
                ActivityPayload::Other {
                    summary: format!("transaction {index}"),
                },
            );
        }
        assert_eq!(server.last_activity_id(), 3);
        let batch = server.get_activities(2, 10);
        let ids: Vec<ActivityId> = batch.activities.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(batch.client_infos.contains_key(&session.endpoint_id()));
    }
}
