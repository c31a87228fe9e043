//! Enumerates who replicates an object, across online and offline clients.
//!
//! Online clients are read live from the [`OnlineClients`]. Offline clients are read from a
//! copy of their predicted streams that is refreshed whenever the offline clients change.

use std::ops::ControlFlow;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::client::OnlineClients;
use crate::model::{
    ClientIdentity, EndpointId, ObjectPath, ObjectReplicationMap, PropertyChain,
    ReplicatedObjectInfo,
};
use crate::offline::OfflineClientManager;

/// Which offline clients an enumeration yields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineSkipMode {
    /// Yield every offline client with the object
    All,
    /// Yield no offline clients
    SkipOfflineClients,
    /// Skip offline clients whose registration is fully covered by an online client
    #[default]
    SkipOfflineClientsThatFullyOverlapWithOnlineClients,
}

/// A client yielded by an enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedClientRef<'a> {
    Online(EndpointId),
    Offline(&'a ClientIdentity),
}

#[derive(Debug, Default)]
pub struct UnifiedStreamCache {
    offline_streams: IndexMap<ClientIdentity, ObjectReplicationMap>,
}

impl UnifiedStreamCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the predicted streams of every offline client.
    pub fn refresh_offline(&mut self, offline: &OfflineClientManager) {
        self.offline_streams = offline
            .clients()
            .map(|client| (client.identity().clone(), client.predicted_stream().clone()))
            .collect();
        trace!(count = self.offline_streams.len(), "Refreshed offline streams");
    }

    pub fn clear(&mut self) {
        self.offline_streams.clear();
    }

    pub fn offline_stream(&self, identity: &ClientIdentity) -> Option<&ObjectReplicationMap> {
        self.offline_streams.get(identity)
    }

    /// Visits every client that has `object` registered.
    ///
    /// Online clients are visited first and always. Offline clients depend on `mode`.
    pub fn enumerate_clients_with_object<'a>(
        &'a self,
        online: &OnlineClients,
        object: &ObjectPath,
        mode: OfflineSkipMode,
        callback: &mut dyn FnMut(UnifiedClientRef<'a>, &ReplicatedObjectInfo) -> ControlFlow<()>,
    ) {
        let mut online_infos = Vec::new();
        for client in online.iter() {
            let Some(info) = client.confirmed_map().get(object) else {
                continue;
            };
            if callback(UnifiedClientRef::Online(client.endpoint_id()), info).is_break() {
                return;
            }
            online_infos.push(info.clone());
        }

        if mode == OfflineSkipMode::SkipOfflineClients {
            return;
        }
        for (identity, stream) in &self.offline_streams {
            let Some(info) = stream.get(object) else {
                continue;
            };
            let superseded = mode
                == OfflineSkipMode::SkipOfflineClientsThatFullyOverlapWithOnlineClients
                && online_infos
                    .iter()
                    .any(|online_info| info.is_subset_of(online_info));
            if superseded {
                continue;
            }
            if callback(UnifiedClientRef::Offline(identity), info).is_break() {
                return;
            }
        }
    }

    /// Visits every client that has `property` of `object` registered.
    ///
    /// With the overlap mode, offline clients are skipped entirely as soon as one online
    /// client has the property.
    pub fn enumerate_clients_with_object_and_property<'a>(
        &'a self,
        online: &OnlineClients,
        object: &ObjectPath,
        property: &PropertyChain,
        mode: OfflineSkipMode,
        callback: &mut dyn FnMut(UnifiedClientRef<'a>) -> ControlFlow<()>,
    ) {
        let mut any_online = false;
        for client in online.iter() {
            if !client.confirmed_map().has_property(object, property) {
                continue;
            }
            any_online = true;
            if callback(UnifiedClientRef::Online(client.endpoint_id())).is_break() {
                return;
            }
        }

        let skip_offline = match mode {
            OfflineSkipMode::All => false,
            OfflineSkipMode::SkipOfflineClients => true,
            OfflineSkipMode::SkipOfflineClientsThatFullyOverlapWithOnlineClients => any_online,
        };
        if skip_offline {
            return;
        }
        for (identity, stream) in &self.offline_streams {
            if stream.has_property(object, property)
                && callback(UnifiedClientRef::Offline(identity)).is_break()
            {
                return;
            }
        }
    }

    /// Collecting variant of [`Self::enumerate_clients_with_object`].
    pub fn clients_with_object<'a>(
        &'a self,
        online: &OnlineClients,
        object: &ObjectPath,
        mode: OfflineSkipMode,
    ) -> Vec<UnifiedClientRef<'a>> {
        let mut result = Vec::new();
        self.enumerate_clients_with_object(online, object, mode, &mut |client, _| {
            result.push(client);
            ControlFlow::Continue(())
        });
        result
    }
}
