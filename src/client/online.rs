//! Per-connected-client state.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use indexmap::IndexMap;
use tracing::warn;

use crate::authority::conflict::ReplicationGroundTruth;
use crate::client::pending::PendingChanges;
use crate::client::synchronizer::{AuthoritySynchronizer, StreamSynchronizer};
use crate::error::ReplicationError;
use crate::model::{
    ClientIdentity, EndpointId, FrequencySettings, MULTI_USER_STREAM_ID, ObjectPath,
    ObjectReplicationMap, PropertyChain, StreamDescription, StreamId, StreamIdSet,
};
use crate::protocol::{
    ChangeAuthorityRequest, ChangeStreamRequest, ClientStateSnapshot, ObjectInStreamId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineClientKind {
    /// The client this process runs as
    Local,
    /// Any other connected client
    Remote,
}

/// A client that is connected to the session right now.
#[derive(Debug, Clone)]
pub struct OnlineClient {
    endpoint_id: EndpointId,
    identity: ClientIdentity,
    kind: OnlineClientKind,
    stream: StreamSynchronizer,
    authority: AuthoritySynchronizer,
    pending: PendingChanges,
}

impl OnlineClient {
    pub fn new(endpoint_id: EndpointId, identity: ClientIdentity, kind: OnlineClientKind) -> Self {
        OnlineClient {
            endpoint_id,
            identity,
            kind,
            stream: StreamSynchronizer::default(),
            authority: AuthoritySynchronizer::default(),
            pending: PendingChanges::default(),
        }
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn kind(&self) -> OnlineClientKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.kind == OnlineClientKind::Local
    }

    pub fn stream(&self) -> &StreamSynchronizer {
        &self.stream
    }

    pub fn authority(&self) -> &AuthoritySynchronizer {
        &self.authority
    }

    pub fn pending(&self) -> &PendingChanges {
        &self.pending
    }

    /// Confirmed Multi-User stream content, empty if the client has no such stream.
    pub fn confirmed_map(&self) -> &ObjectReplicationMap {
        self.stream
            .server_state()
            .unwrap_or_else(|| ObjectReplicationMap::empty())
    }

    /// Multi-User stream content once the pending edits are applied.
    pub fn post_submission_map(&self) -> &ObjectReplicationMap {
        self.pending
            .stream_edits
            .as_ref()
            .unwrap_or_else(|| self.confirmed_map())
    }

    pub fn post_submission_properties(&self, object: &ObjectPath) -> BTreeSet<PropertyChain> {
        self.post_submission_map()
            .properties(object)
            .cloned()
            .unwrap_or_default()
    }

    fn confirmed_frequency(&self) -> FrequencySettings {
        self.stream
            .multi_user_stream()
            .map(|stream| stream.frequency_settings.clone())
            .unwrap_or_default()
    }

    /// Whether the client will own the object once its pending changes are applied.
    pub fn will_have_authority(&self, object: &ObjectPath) -> bool {
        if self.pending.releases_authority(object) {
            return false;
        }
        let owns = self.authority.has_authority_over(object) || self.pending.wants_authority(object);
        owns && self.post_submission_map().contains_object(object)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn discard_pending_changes(&mut self) {
        self.pending = PendingChanges::default();
    }

    pub fn add_properties(
        &mut self,
        object: &ObjectPath,
        class_path: &str,
        properties: &BTreeSet<PropertyChain>,
    ) {
        let confirmed = self.stream.server_state();
        self.pending
            .stream_edits_mut(confirmed)
            .add_properties(object, class_path, properties);
    }

    pub fn remove_properties(&mut self, object: &ObjectPath, properties: &BTreeSet<PropertyChain>) {
        let confirmed = self.stream.server_state();
        let map = self.pending.stream_edits_mut(confirmed);
        map.remove_properties(object, properties);
        if !map.contains_object(object) {
            self.pending.take_authority.remove(object);
        }
    }

    pub fn remove_object(&mut self, object: &ObjectPath) {
        let confirmed = self.stream.server_state();
        self.pending.stream_edits_mut(confirmed).remove_object(object);
        self.pending.take_authority.remove(object);
    }

    pub fn set_frequency_settings(&mut self, settings: FrequencySettings) {
        self.pending.frequency_edits = Some(settings);
    }

    /// Queues taking authority. Fails if the object has no registered properties, even after
    /// the pending edits are applied.
    pub fn take_authority(&mut self, object: &ObjectPath) -> Result<(), ReplicationError> {
        if !self.post_submission_map().contains_object(object) {
            warn!(client = %self.identity, %object, "Cannot take authority over an unregistered object");
            return Err(ReplicationError::InvalidRequest(format!(
                "{object} is not registered in the stream of {}",
                self.identity
            )));
        }
        self.pending.queue_take(object);
        Ok(())
    }

    pub fn release_authority(&mut self, object: &ObjectPath) {
        if self.authority.has_authority_over(object) {
            self.pending.queue_release(object);
        } else {
            self.pending.take_authority.remove(object);
        }
    }

    /// Diffs the post-submission stream against the confirmed one.
    pub fn build_stream_request(&self) -> ChangeStreamRequest {
        let mut request = ChangeStreamRequest::default();
        let post = self.post_submission_map();
        let frequency = self.pending.frequency_edits.clone();

        if self.stream.multi_user_stream().is_none() {
            if !post.is_empty() || frequency.is_some() {
                let mut stream = StreamDescription::multi_user();
                stream.replication_map = post.clone();
                stream.replication_map.remove_unreplicated();
                stream.frequency_settings = frequency.unwrap_or_default();
                request.streams_to_add.push(stream);
            }
            return request;
        }

        let confirmed = self.confirmed_map();
        for (object, info) in &post.objects {
            if confirmed.get(object) != Some(info) && info.is_replicated() {
                request.objects_to_put.insert(
                    ObjectInStreamId::new(MULTI_USER_STREAM_ID, object.clone()),
                    info.clone(),
                );
            }
        }
        for object in confirmed.objects.keys() {
            let removed = post.get(object).is_none_or(|info| !info.is_replicated());
            if removed {
                request
                    .objects_to_remove
                    .insert(ObjectInStreamId::new(MULTI_USER_STREAM_ID, object.clone()));
            }
        }
        if let Some(frequency) = frequency {
            if frequency != self.confirmed_frequency() {
                request.frequency_changes.insert(MULTI_USER_STREAM_ID, frequency);
            }
        }
        request
    }

    /// Builds the authority request for the pending take/release sets.
    pub fn build_authority_request(&self) -> ChangeAuthorityRequest {
        let mut request = ChangeAuthorityRequest::default();
        let post = self.post_submission_map();
        for object in &self.pending.take_authority {
            if self.authority.has_authority_over(object) {
                continue;
            }
            if !post.contains_object(object) {
                warn!(client = %self.identity, %object, "Dropping authority request for an object without properties");
                continue;
            }
            request
                .take_authority
                .insert(object.clone(), StreamIdSet::from([MULTI_USER_STREAM_ID]));
        }
        for object in &self.pending.release_authority {
            if self.authority.has_authority_over(object) {
                request
                    .release_authority
                    .insert(object.clone(), StreamIdSet::from([MULTI_USER_STREAM_ID]));
            }
        }
        request
    }

    /// Full stream list once the pending edits are applied.
    pub fn post_submission_streams(&self) -> Vec<StreamDescription> {
        let mut streams = self.stream.streams().to_vec();
        let post = self.post_submission_map().clone();
        let frequency = self
            .pending
            .frequency_edits
            .clone()
            .unwrap_or_else(|| self.confirmed_frequency());
        match streams.iter_mut().find(|s| s.is_multi_user()) {
            Some(stream) => {
                stream.replication_map = post;
                stream.frequency_settings = frequency;
            }
            None if !post.is_empty() => {
                let mut stream = StreamDescription::multi_user();
                stream.replication_map = post;
                stream.frequency_settings = frequency;
                streams.push(stream);
            }
            None => {}
        }
        streams
    }

    /// Full authority state once the pending edits are applied.
    pub fn post_submission_authority(&self) -> BTreeSet<ObjectInStreamId> {
        let post = self.post_submission_map();
        let mut owned: BTreeSet<ObjectInStreamId> = self
            .authority
            .authority()
            .iter()
            .flat_map(|(object, streams)| {
                streams
                    .iter()
                    .map(move |stream_id| ObjectInStreamId::new(*stream_id, object.clone()))
            })
            .filter(|id| id.stream_id != MULTI_USER_STREAM_ID || post.contains_object(&id.object))
            .collect();
        for object in &self.pending.take_authority {
            if post.contains_object(object) {
                owned.insert(ObjectInStreamId::new(MULTI_USER_STREAM_ID, object.clone()));
            }
        }
        for object in &self.pending.release_authority {
            owned.remove(&ObjectInStreamId::new(MULTI_USER_STREAM_ID, object.clone()));
        }
        owned
    }

    /// Applies a stream change the server accepted. Returns true if the stream changed.
    pub(crate) fn apply_stream_change(&mut self, request: &ChangeStreamRequest) -> bool {
        self.stream.apply_change(request)
    }

    pub(crate) fn authority_mut(&mut self) -> &mut AuthoritySynchronizer {
        &mut self.authority
    }

    /// Drops authority over objects no longer registered. Returns true if authority changed.
    pub(crate) fn prune_authority(&mut self) -> bool {
        self.authority.retain_registered(&self.stream)
    }

    /// Replaces the confirmed state. Returns `(stream_changed, authority_changed)`.
    pub fn apply_snapshot(&mut self, snapshot: &ClientStateSnapshot) -> (bool, bool) {
        let stream_changed = self.stream.set_streams(snapshot.streams.clone());
        let authority_changed = self
            .authority
            .set_state(snapshot.authority.clone(), snapshot.sync_control.clone());
        (stream_changed, authority_changed)
    }
}

/// The local client plus every remote client, in registration order.
#[derive(Debug, Clone)]
pub struct OnlineClients {
    local: OnlineClient,
    remotes: IndexMap<EndpointId, OnlineClient>,
}

impl OnlineClients {
    pub fn new(local: OnlineClient) -> Self {
        OnlineClients {
            local,
            remotes: IndexMap::new(),
        }
    }

    pub fn local(&self) -> &OnlineClient {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut OnlineClient {
        &mut self.local
    }

    pub fn remotes(&self) -> impl Iterator<Item = &OnlineClient> {
        self.remotes.values()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// Looks the client up, local first.
    pub fn find(&self, endpoint_id: EndpointId) -> Option<&OnlineClient> {
        if self.local.endpoint_id == endpoint_id {
            return Some(&self.local);
        }
        self.remotes.get(&endpoint_id)
    }

    pub fn find_mut(&mut self, endpoint_id: EndpointId) -> Option<&mut OnlineClient> {
        if self.local.endpoint_id == endpoint_id {
            return Some(&mut self.local);
        }
        self.remotes.get_mut(&endpoint_id)
    }

    /// Finds an online client by identity.
    pub fn find_by_identity(&self, identity: &ClientIdentity) -> Option<&OnlineClient> {
        self.iter().find(|client| client.identity.is_same_client(identity))
    }

    /// Local client first, then remotes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &OnlineClient> {
        std::iter::once(&self.local).chain(self.remotes.values())
    }

    pub fn for_each_client(&self, callback: &mut dyn FnMut(&OnlineClient) -> ControlFlow<()>) {
        for client in self.iter() {
            if callback(client).is_break() {
                return;
            }
        }
    }

    pub(crate) fn insert_remote(&mut self, client: OnlineClient) -> bool {
        if self.local.endpoint_id == client.endpoint_id
            || self.remotes.contains_key(&client.endpoint_id)
        {
            return false;
        }
        self.remotes.insert(client.endpoint_id, client);
        true
    }

    pub(crate) fn remove_remote(&mut self, endpoint_id: EndpointId) -> Option<OnlineClient> {
        self.remotes.shift_remove(&endpoint_id)
    }

    pub fn contains(&self, endpoint_id: EndpointId) -> bool {
        self.find(endpoint_id).is_some()
    }
}

impl ReplicationGroundTruth for OnlineClients {
    fn for_each_client(&self, callback: &mut dyn FnMut(EndpointId) -> ControlFlow<()>) {
        for client in self.iter() {
            if callback(client.endpoint_id).is_break() {
                return;
            }
        }
    }

    fn for_each_stream(
        &self,
        client: EndpointId,
        callback: &mut dyn FnMut(&StreamDescription) -> ControlFlow<()>,
    ) {
        let Some(client) = self.find(client) else {
            return;
        };
        for stream in client.stream.streams() {
            if callback(stream).is_break() {
                return;
            }
        }
    }

    fn has_authority(&self, client: EndpointId, object: &ObjectPath, stream: StreamId) -> bool {
        self.find(client)
            .is_some_and(|c| c.authority.has_authority(object, stream))
    }
}
