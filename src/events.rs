//! Change notifications of the replication client.
//!
//! Every observable state change is published as a [`ReplicationEvent`] on the [`EventBus`].
//! Events are emitted in the order the changes happen, so a subscriber sees
//! `PreRemoteClientRemoved` before the client is gone and `RemoteClientsChanged` after.

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

use crate::model::{ClientIdentity, EndpointId};

/// The default capacity of the event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// The local client joined a replication session
    Joined,
    /// The local client left the replication session
    Left,
    PostRemoteClientAdded(EndpointId),
    PreRemoteClientRemoved(EndpointId),
    RemoteClientsChanged,
    /// The confirmed stream of a client changed
    StreamChanged(EndpointId),
    /// The confirmed authority of a client changed
    AuthorityChanged(EndpointId),
    /// The authority cache was rebuilt for a client
    AuthorityCacheChanged(EndpointId),
    PostOfflineClientAdded(ClientIdentity),
    PreOfflineClientRemoved(ClientIdentity),
    OfflineClientsChanged,
    /// The predicted content of an offline client changed
    OfflineClientContentChanged(ClientIdentity),
    MuteStateChanged,
    PresetApplied,
}

/// Broadcasts [`ReplicationEvent`]s to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<ReplicationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub fn subscribe(&self) -> Receiver<ReplicationEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ReplicationEvent) {
        if let Err(err) = self.sender.send(event) {
            debug!("No subscribers for replication event {:?}", err.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        let endpoint = EndpointId::from_u128(7);
        bus.publish(ReplicationEvent::PreRemoteClientRemoved(endpoint));
        bus.publish(ReplicationEvent::RemoteClientsChanged);

        assert_eq!(
            receiver.try_recv().unwrap(),
            ReplicationEvent::PreRemoteClientRemoved(endpoint)
        );
        assert_eq!(receiver.try_recv().unwrap(), ReplicationEvent::RemoteClientsChanged);
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.publish(ReplicationEvent::Joined);
    }
}
