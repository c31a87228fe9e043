//! Tracks clients that took part in the session before but are not connected right now.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::events::{EventBus, ReplicationEvent};
use crate::model::{ClientIdentity, EndpointId, ObjectPath, ObjectReplicationMap};
use crate::offline::endpoint_cache::EndpointCache;
use crate::offline::predictor::RejoinStreamAndAuthorityPredictor;
use crate::protocol::Activity;
use crate::session::ActivityLog;

/// A client that is known from the activity log but currently not connected.
#[derive(Debug, Clone)]
pub struct OfflineClient {
    identity: ClientIdentity,
    last_associated_endpoint: Option<EndpointId>,
    predictor: RejoinStreamAndAuthorityPredictor,
}

impl OfflineClient {
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// The endpoint the client used most recently.
    pub fn last_associated_endpoint(&self) -> Option<EndpointId> {
        self.last_associated_endpoint
    }

    /// Multi-User stream content the client is predicted to get back when it rejoins.
    pub fn predicted_stream(&self) -> &ObjectReplicationMap {
        self.predictor.predicted_map()
    }

    pub fn predicted_authority(&self) -> &BTreeSet<ObjectPath> {
        self.predictor.predicted_authority()
    }

    pub fn predictor(&self) -> &RejoinStreamAndAuthorityPredictor {
        &self.predictor
    }
}

#[derive(Debug)]
pub struct OfflineClientManager {
    endpoint_cache: EndpointCache,
    /// Keyed by identity, in the order the clients went offline
    clients: IndexMap<ClientIdentity, OfflineClient>,
    batch_size: usize,
    events: EventBus,
}

impl OfflineClientManager {
    pub fn new(batch_size: usize, events: EventBus) -> Self {
        OfflineClientManager {
            endpoint_cache: EndpointCache::new(batch_size),
            clients: IndexMap::new(),
            batch_size,
            events,
        }
    }

    pub fn endpoint_cache(&self) -> &EndpointCache {
        &self.endpoint_cache
    }

    pub fn clients(&self) -> impl Iterator<Item = &OfflineClient> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn find_by_identity(&self, identity: &ClientIdentity) -> Option<&OfflineClient> {
        self.clients.get(identity)
    }

    /// Finds the offline client that ever used `endpoint_id`.
    pub fn find_by_endpoint(&self, endpoint_id: EndpointId) -> Option<&OfflineClient> {
        let identity = self.endpoint_cache.identity_of(endpoint_id)?;
        self.clients.get(identity)
    }

    /// Brings the endpoint cache up to date and recomputes which known clients are offline.
    ///
    /// Removed clients are announced with `PreOfflineClientRemoved` before they are dropped,
    /// added clients with `PostOfflineClientAdded` after they are inserted. A single
    /// `OfflineClientsChanged` follows if anything changed.
    pub fn refresh_offline_clients(
        &mut self,
        online: &BTreeSet<ClientIdentity>,
        log: &dyn ActivityLog,
    ) -> bool {
        self.endpoint_cache.update_endpoints(log);

        let is_online = |identity: &ClientIdentity| {
            online
                .iter()
                .any(|online_identity| online_identity.is_same_client(identity))
        };

        let went_online: Vec<ClientIdentity> = self
            .clients
            .keys()
            .filter(|identity| {
                is_online(identity) || self.endpoint_cache.find_client(identity).is_none()
            })
            .cloned()
            .collect();
        for identity in &went_online {
            self.events
                .publish(ReplicationEvent::PreOfflineClientRemoved(identity.clone()));
            self.clients.shift_remove(identity);
            debug!(client = %identity, "Client is no longer offline");
        }

        let mut added = Vec::new();
        for known in self.endpoint_cache.known_clients() {
            if is_online(&known.identity) || self.clients.contains_key(&known.identity) {
                continue;
            }
            let mut predictor =
                RejoinStreamAndAuthorityPredictor::new(known.identity.clone(), self.batch_size);
            predictor.recompute(log);
            self.clients.insert(
                known.identity.clone(),
                OfflineClient {
                    identity: known.identity.clone(),
                    last_associated_endpoint: known.last_endpoint(),
                    predictor,
                },
            );
            added.push(known.identity.clone());
        }
        for identity in &added {
            info!(client = %identity, "Client is offline");
            self.events
                .publish(ReplicationEvent::PostOfflineClientAdded(identity.clone()));
        }

        let changed = !went_online.is_empty() || !added.is_empty();
        if changed {
            self.events.publish(ReplicationEvent::OfflineClientsChanged);
        }
        changed
    }

    /// Feeds a freshly added activity to the endpoint cache and every predictor.
    pub fn on_activity_added(&mut self, activity: &Activity, identity: &ClientIdentity) {
        self.endpoint_cache.on_activity_added(activity, identity);

        if let Some(client) = self.clients.get_mut(identity)
            && client.predictor.on_activity_added(activity, identity)
        {
            client.last_associated_endpoint = Some(activity.endpoint_id);
            self.events
                .publish(ReplicationEvent::OfflineClientContentChanged(identity.clone()));
        }
    }

    /// Forgets every offline client, e.g. when the session is left.
    pub fn clear(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        for identity in self.clients.keys() {
            self.events
                .publish(ReplicationEvent::PreOfflineClientRemoved(identity.clone()));
        }
        self.clients.clear();
        self.events.publish(ReplicationEvent::OfflineClientsChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MULTI_USER_STREAM_ID, PropertyChain, StreamDescription, StreamIdSet};
    use crate::protocol::{ActivityPayload, LeaveReplicationSnapshot};
    use crate::session::memory::InMemoryServer;
    use std::collections::BTreeMap;

    fn leave_with(object: &ObjectPath) -> ActivityPayload {
        let mut stream = StreamDescription::multi_user();
        stream
            .replication_map
            .add_properties(object, "", [&PropertyChain::from_path("Scale")]);
        ActivityPayload::LeaveReplication(LeaveReplicationSnapshot {
            streams: vec![stream],
            owned_objects: BTreeMap::from([(
                object.clone(),
                StreamIdSet::from([MULTI_USER_STREAM_ID]),
            )]),
        })
    }

    fn drain(receiver: &mut tokio::sync::broadcast::Receiver<ReplicationEvent>) -> Vec<ReplicationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_offline_clients_follow_connection_state() {
        let server = InMemoryServer::new();
        let alice = ClientIdentity::new("Alice", "Laptop");
        let bob = ClientIdentity::new("Bob", "Laptop");
        let alice_session = server.connect(alice.clone());
        server.append_activity(alice_session.endpoint_id(), leave_with(&ObjectPath::new("World:Cube")));
        server.connect(bob.clone());

        let events = EventBus::default();
        let mut receiver = events.subscribe();
        let mut manager = OfflineClientManager::new(100, events);

        let online = BTreeSet::from([bob.clone()]);
        assert!(manager.refresh_offline_clients(&online, &server));
        let offline = manager.find_by_identity(&alice).map(OfflineClient::predicted_stream);
        assert!(offline.is_some_and(|map| map.contains_object(&ObjectPath::new("World:Cube"))));
        assert_eq!(manager.len(), 1);
        assert_eq!(
            drain(&mut receiver),
            vec![
                ReplicationEvent::PostOfflineClientAdded(alice.clone()),
                ReplicationEvent::OfflineClientsChanged,
            ]
        );

        let online = BTreeSet::from([alice.clone(), bob]);
        assert!(manager.refresh_offline_clients(&online, &server));
        assert!(manager.is_empty());
        assert_eq!(
            drain(&mut receiver),
            vec![
                ReplicationEvent::PreOfflineClientRemoved(alice),
                ReplicationEvent::OfflineClientsChanged,
            ]
        );
    }

    #[test]
    fn test_refresh_without_changes_is_silent() {
        let server = InMemoryServer::new();
        server.connect(ClientIdentity::new("Alice", "Laptop"));
        let events = EventBus::default();
        let mut receiver = events.subscribe();
        let mut manager = OfflineClientManager::new(100, events);

        manager.refresh_offline_clients(&BTreeSet::new(), &server);
        drain(&mut receiver);
        assert!(!manager.refresh_offline_clients(&BTreeSet::new(), &server));
        assert!(drain(&mut receiver).is_empty());
    }

    #[test]
    fn test_late_leave_activity_updates_offline_client() {
        let server = InMemoryServer::new();
        let alice = ClientIdentity::new("Alice", "Laptop");
        let session = server.connect(alice.clone());
        server.append_activity(session.endpoint_id(), ActivityPayload::JoinReplication);

        let events = EventBus::default();
        let mut manager = OfflineClientManager::new(100, events.clone());
        manager.refresh_offline_clients(&BTreeSet::new(), &server);
        assert!(manager.find_by_identity(&alice).is_some_and(|c| c.predicted_stream().is_empty()));

        let mut receiver = events.subscribe();
        let activity =
            server.append_activity(session.endpoint_id(), leave_with(&ObjectPath::new("World:Cube")));
        manager.on_activity_added(&activity, &alice);

        let client = manager.find_by_endpoint(session.endpoint_id());
        assert!(client.is_some_and(|c| c.predicted_authority().contains(&ObjectPath::new("World:Cube"))));
        assert_eq!(
            drain(&mut receiver),
            vec![ReplicationEvent::OfflineClientContentChanged(alice)]
        );
    }
}
