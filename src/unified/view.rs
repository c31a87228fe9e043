//! One query surface over online and offline clients.

use serde::Serialize;

use crate::client::{OnlineClientKind, OnlineClientManager};
use crate::model::{ClientIdentity, EndpointId, ObjectReplicationMap};
use crate::offline::OfflineClientManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Local,
    Remote,
    Offline,
}

impl From<OnlineClientKind> for ClientType {
    fn from(kind: OnlineClientKind) -> Self {
        match kind {
            OnlineClientKind::Local => ClientType::Local,
            OnlineClientKind::Remote => ClientType::Remote,
        }
    }
}

/// Summary of one client, online or offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    pub client_type: ClientType,
    /// Current endpoint for online clients, the last used one for offline clients
    pub endpoint_id: Option<EndpointId>,
    pub identity: ClientIdentity,
    pub object_count: usize,
    pub authority_count: usize,
}

#[derive(Clone, Copy)]
pub struct UnifiedClientView<'a> {
    online: &'a OnlineClientManager,
    offline: &'a OfflineClientManager,
}

impl<'a> UnifiedClientView<'a> {
    pub fn new(online: &'a OnlineClientManager, offline: &'a OfflineClientManager) -> Self {
        UnifiedClientView { online, offline }
    }

    /// Local first, then remote, then offline.
    pub fn get_client_type(&self, endpoint_id: EndpointId) -> Option<ClientType> {
        if let Some(client) = self.online.find_client(endpoint_id) {
            return Some(client.kind().into());
        }
        self.offline
            .find_by_endpoint(endpoint_id)
            .map(|_| ClientType::Offline)
    }

    pub fn identity_of(&self, endpoint_id: EndpointId) -> Option<&'a ClientIdentity> {
        match self.online.find_client(endpoint_id) {
            Some(client) => Some(client.identity()),
            None => self
                .offline
                .find_by_endpoint(endpoint_id)
                .map(|client| client.identity()),
        }
    }

    /// Confirmed stream of an online client or predicted stream of an offline client.
    pub fn stream_of(&self, endpoint_id: EndpointId) -> Option<&'a ObjectReplicationMap> {
        match self.online.find_client(endpoint_id) {
            Some(client) => Some(client.confirmed_map()),
            None => self
                .offline
                .find_by_endpoint(endpoint_id)
                .map(|client| client.predicted_stream()),
        }
    }

    pub fn summaries(&self) -> Vec<ClientSummary> {
        let online = self.online.clients().iter().map(|client| ClientSummary {
            client_type: client.kind().into(),
            endpoint_id: Some(client.endpoint_id()),
            identity: client.identity().clone(),
            object_count: client.confirmed_map().len(),
            authority_count: client.authority().owned_objects().count(),
        });
        let offline = self.offline.clients().map(|client| ClientSummary {
            client_type: ClientType::Offline,
            endpoint_id: client.last_associated_endpoint(),
            identity: client.identity().clone(),
            object_count: client.predicted_stream().len(),
            authority_count: client.predicted_authority().len(),
        });
        online.chain(offline).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::notify::TracingNotifier;
    use crate::protocol::ActivityPayload;
    use crate::session::memory::InMemoryServer;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn test_client_type_priority() {
        let server = InMemoryServer::new();
        let local = server.connect(ClientIdentity::new("Local", "Laptop"));
        let remote = server.connect(ClientIdentity::new("Remote", "Laptop"));
        let gone = server.connect(ClientIdentity::new("Gone", "Laptop"));
        server.append_activity(gone.endpoint_id(), ActivityPayload::JoinReplication);

        let events = EventBus::default();
        let online = OnlineClientManager::new(
            local.endpoint_id(),
            ClientIdentity::new("Local", "Laptop"),
            [(remote.endpoint_id(), ClientIdentity::new("Remote", "Laptop"))],
            events.clone(),
            Arc::new(TracingNotifier),
        );
        let mut offline = OfflineClientManager::new(10, events);
        offline.refresh_offline_clients(&online.online_identities(), &server);

        let view = UnifiedClientView::new(&online, &offline);
        assert_eq!(view.get_client_type(local.endpoint_id()), Some(ClientType::Local));
        assert_eq!(view.get_client_type(remote.endpoint_id()), Some(ClientType::Remote));
        assert_eq!(view.get_client_type(gone.endpoint_id()), Some(ClientType::Offline));
        assert_eq!(view.get_client_type(EndpointId::new_v4()), None);
        assert!(view.stream_of(gone.endpoint_id()).is_some_and(|map| map.is_empty()));
        assert!(view.stream_of(EndpointId::new_v4()).is_none());

        let types: BTreeSet<_> = view
            .summaries()
            .into_iter()
            .map(|summary| summary.identity.display_name)
            .collect();
        assert_eq!(types.len(), 3);
    }
}
