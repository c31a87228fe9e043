//! Lifecycle of the online clients of one joined session.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, info};

use crate::authority::{GlobalAuthorityCache, TakeAuthorityVerdict};
use crate::client::online::{OnlineClient, OnlineClientKind, OnlineClients};
use crate::client::reassignment::ReassignmentLogic;
use crate::events::{EventBus, ReplicationEvent};
use crate::model::{ClientIdentity, EndpointId, ObjectPath, PropertyChain};
use crate::notify::{DuplicateIdentityTracker, Notifier};
use crate::protocol::{
    ChangeAuthorityRequest, ChangeAuthorityResponse, ChangeStreamRequest, ClientStateSnapshot,
};

/// Owns the local client and every remote client while a session is joined.
pub struct OnlineClientManager {
    clients: OnlineClients,
    authority_cache: GlobalAuthorityCache,
    reassignment: ReassignmentLogic,
    duplicates: DuplicateIdentityTracker,
    events: EventBus,
    notifier: Arc<dyn Notifier>,
}

impl OnlineClientManager {
    /// Creates the manager with the local client and the remotes already in the session.
    pub fn new(
        local_endpoint: EndpointId,
        local_identity: ClientIdentity,
        remotes: impl IntoIterator<Item = (EndpointId, ClientIdentity)>,
        events: EventBus,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let local = OnlineClient::new(local_endpoint, local_identity, OnlineClientKind::Local);
        let mut clients = OnlineClients::new(local);
        for (endpoint_id, identity) in remotes {
            clients.insert_remote(OnlineClient::new(
                endpoint_id,
                identity,
                OnlineClientKind::Remote,
            ));
        }

        let mut manager = OnlineClientManager {
            clients,
            authority_cache: GlobalAuthorityCache::new(),
            reassignment: ReassignmentLogic,
            duplicates: DuplicateIdentityTracker::default(),
            events,
            notifier,
        };
        for client in manager.clients.iter() {
            manager.authority_cache.on_client_changed(client);
        }
        manager.check_duplicate_identities();
        manager
    }

    pub fn clients(&self) -> &OnlineClients {
        &self.clients
    }

    pub fn local_client(&self) -> &OnlineClient {
        self.clients.local()
    }

    /// Finds a client by endpoint, local client first.
    pub fn find_client(&self, endpoint_id: EndpointId) -> Option<&OnlineClient> {
        self.clients.find(endpoint_id)
    }

    /// Visits the local client, then remotes in registration order.
    pub fn for_each_client(&self, callback: &mut dyn FnMut(&OnlineClient) -> ControlFlow<()>) {
        self.clients.for_each_client(callback);
    }

    pub fn authority_cache(&self) -> &GlobalAuthorityCache {
        &self.authority_cache
    }

    pub fn reassignment_logic(&self) -> &ReassignmentLogic {
        &self.reassignment
    }

    pub fn handle_client_connected(&mut self, endpoint_id: EndpointId, identity: ClientIdentity) {
        let client = OnlineClient::new(endpoint_id, identity, OnlineClientKind::Remote);
        if !self.clients.insert_remote(client) {
            debug!(%endpoint_id, "Ignoring connect of an already registered client");
            return;
        }
        info!(%endpoint_id, "Remote client added");
        if let Some(client) = self.clients.find(endpoint_id) {
            self.authority_cache.on_client_changed(client);
        }
        self.events
            .publish(ReplicationEvent::PostRemoteClientAdded(endpoint_id));
        self.events.publish(ReplicationEvent::RemoteClientsChanged);
        self.check_duplicate_identities();
    }

    /// Removes a remote client. Returns it so callers can inspect its last state.
    pub fn handle_client_disconnected(&mut self, endpoint_id: EndpointId) -> Option<OnlineClient> {
        if !self.clients.remotes().any(|c| c.endpoint_id() == endpoint_id) {
            return None;
        }
        self.events
            .publish(ReplicationEvent::PreRemoteClientRemoved(endpoint_id));
        self.authority_cache.on_client_removed(endpoint_id);
        let removed = self.clients.remove_remote(endpoint_id);
        self.events
            .publish(ReplicationEvent::AuthorityCacheChanged(endpoint_id));
        self.events.publish(ReplicationEvent::RemoteClientsChanged);
        info!(%endpoint_id, "Remote client removed");
        removed
    }

    /// Runs `edit` on a client's pending change model.
    pub fn edit_client<R>(
        &mut self,
        endpoint_id: EndpointId,
        edit: impl FnOnce(&mut OnlineClient) -> R,
    ) -> Option<R> {
        self.clients.find_mut(endpoint_id).map(edit)
    }

    /// Replaces a client's confirmed state with what the server reported.
    pub fn apply_client_snapshot(
        &mut self,
        endpoint_id: EndpointId,
        snapshot: &ClientStateSnapshot,
    ) -> bool {
        let Some(client) = self.clients.find_mut(endpoint_id) else {
            return false;
        };
        let (stream_changed, authority_changed) = client.apply_snapshot(snapshot);
        self.on_confirmed_state_changed(endpoint_id, stream_changed, authority_changed);
        stream_changed || authority_changed
    }

    /// Applies an accepted stream change to a client's confirmed state.
    pub(crate) fn apply_stream_change(
        &mut self,
        endpoint_id: EndpointId,
        request: &ChangeStreamRequest,
    ) {
        let Some(client) = self.clients.find_mut(endpoint_id) else {
            return;
        };
        let stream_changed = client.apply_stream_change(request);
        let authority_changed = stream_changed && client.prune_authority();
        self.on_confirmed_state_changed(endpoint_id, stream_changed, authority_changed);
    }

    /// Applies the server's answer to an authority request.
    pub(crate) fn apply_authority_response(
        &mut self,
        endpoint_id: EndpointId,
        request: &ChangeAuthorityRequest,
        response: &ChangeAuthorityResponse,
    ) {
        let Some(client) = self.clients.find_mut(endpoint_id) else {
            return;
        };
        let authority_changed = client.authority_mut().apply_response(request, response);
        self.on_confirmed_state_changed(endpoint_id, false, authority_changed);
    }

    fn on_confirmed_state_changed(
        &mut self,
        endpoint_id: EndpointId,
        stream_changed: bool,
        authority_changed: bool,
    ) {
        if !stream_changed && !authority_changed {
            return;
        }
        if stream_changed {
            self.events.publish(ReplicationEvent::StreamChanged(endpoint_id));
        }
        if authority_changed {
            self.events
                .publish(ReplicationEvent::AuthorityChanged(endpoint_id));
        }
        if let Some(client) = self.clients.find(endpoint_id) {
            self.authority_cache.on_client_changed(client);
        }
        self.events
            .publish(ReplicationEvent::AuthorityCacheChanged(endpoint_id));
    }

    fn check_duplicate_identities(&mut self) {
        let identities: Vec<&ClientIdentity> =
            self.clients.iter().map(OnlineClient::identity).collect();
        self.duplicates
            .check(identities, self.notifier.as_ref());
    }

    pub fn can_client_take_authority_after_submission(
        &self,
        object: &ObjectPath,
        client: EndpointId,
        on_conflict: Option<&mut dyn FnMut(EndpointId, &PropertyChain) -> ControlFlow<()>>,
    ) -> TakeAuthorityVerdict {
        self.authority_cache.can_client_take_authority_after_submission(
            &self.clients,
            object,
            client,
            on_conflict,
        )
    }

    pub fn can_client_add_property(
        &self,
        object: &ObjectPath,
        client: EndpointId,
        property: &PropertyChain,
    ) -> bool {
        self.authority_cache
            .can_client_add_property(&self.clients, object, client, property)
    }

    pub fn get_client_with_authority_over_property(
        &self,
        object: &ObjectPath,
        property: &PropertyChain,
    ) -> Option<EndpointId> {
        self.authority_cache
            .get_client_with_authority_over_property(&self.clients, object, property)
    }

    /// Endpoints of every remote client.
    pub fn remote_endpoints(&self) -> Vec<EndpointId> {
        self.clients.remotes().map(OnlineClient::endpoint_id).collect()
    }

    /// Identities of every online client.
    pub fn online_identities(&self) -> BTreeSet<ClientIdentity> {
        self.clients.iter().map(|c| c.identity().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MULTI_USER_STREAM_ID, StreamDescription, StreamIdSet};
    use crate::notify::RecordingNotifier;
    use std::collections::BTreeMap;

    fn manager_with_bus() -> (OnlineClientManager, EventBus, Arc<RecordingNotifier>) {
        let bus = EventBus::new(64);
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = OnlineClientManager::new(
            EndpointId::from_u128(1),
            ClientIdentity::new("Local", "Device"),
            std::iter::empty(),
            bus.clone(),
            notifier.clone(),
        );
        (manager, bus, notifier)
    }

    fn drain(receiver: &mut tokio::sync::broadcast::Receiver<ReplicationEvent>) -> Vec<ReplicationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_connect_and_disconnect_event_order() {
        let (mut manager, bus, _) = manager_with_bus();
        let mut receiver = bus.subscribe();
        let remote = EndpointId::from_u128(2);

        manager.handle_client_connected(remote, ClientIdentity::new("Bob", "Device"));
        assert!(manager.find_client(remote).is_some());
        manager.handle_client_disconnected(remote);
        assert!(manager.find_client(remote).is_none());

        assert_eq!(
            drain(&mut receiver),
            vec![
                ReplicationEvent::PostRemoteClientAdded(remote),
                ReplicationEvent::RemoteClientsChanged,
                ReplicationEvent::PreRemoteClientRemoved(remote),
                ReplicationEvent::AuthorityCacheChanged(remote),
                ReplicationEvent::RemoteClientsChanged,
            ]
        );
    }

    #[test]
    fn test_disconnect_clears_cache_contributions() {
        let (mut manager, _, _) = manager_with_bus();
        let remote = EndpointId::from_u128(2);
        let cube = ObjectPath::new("World:Cube");
        manager.handle_client_connected(remote, ClientIdentity::new("Bob", "Device"));

        let mut stream = StreamDescription::multi_user();
        stream
            .replication_map
            .add_properties(&cube, "", [&PropertyChain::from_path("Scale")]);
        manager.apply_client_snapshot(
            remote,
            &ClientStateSnapshot {
                streams: vec![stream],
                authority: BTreeMap::from([(cube.clone(), StreamIdSet::from([MULTI_USER_STREAM_ID]))]),
                sync_control: BTreeSet::new(),
            },
        );
        assert!(manager.authority_cache().has_authority_over_object(&cube, remote));

        manager.handle_client_disconnected(remote);
        assert!(!manager.authority_cache().has_authority_over_object(&cube, remote));
        assert!(manager.authority_cache().only_references(manager.clients()));
    }

    #[test]
    fn test_duplicate_identity_warns_once() {
        let (mut manager, _, notifier) = manager_with_bus();
        manager.handle_client_connected(EndpointId::from_u128(2), ClientIdentity::new("Bob", "PC"));
        manager.handle_client_connected(EndpointId::from_u128(3), ClientIdentity::new("Bob", "PC"));
        manager.handle_client_connected(EndpointId::from_u128(4), ClientIdentity::new("Bob", "PC"));
        assert_eq!(notifier.warnings().len(), 1);
    }

    #[test]
    fn test_unknown_disconnect_is_ignored() {
        let (mut manager, bus, _) = manager_with_bus();
        let mut receiver = bus.subscribe();
        assert!(manager.handle_client_disconnected(EndpointId::from_u128(99)).is_none());
        assert!(drain(&mut receiver).is_empty());
    }
}
