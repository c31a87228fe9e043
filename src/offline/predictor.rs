//! Predicts what an offline client gets back when it rejoins.
//!
//! When a client leaves replication the server records a `LeaveReplication` activity with a
//! snapshot of its streams and owned objects. On rejoin the client restores that snapshot, so
//! the newest such activity of an identity is the best prediction of its future content.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::model::{
    ClientIdentity, MULTI_USER_STREAM_ID, ObjectPath, ObjectReplicationMap, StreamDescription,
    find_multi_user_stream,
};
use crate::protocol::{Activity, ActivityId, FIRST_ACTIVITY_ID, LeaveReplicationSnapshot};
use crate::session::ActivityLog;

#[derive(Debug, Clone)]
pub struct RejoinStreamAndAuthorityPredictor {
    identity: ClientIdentity,
    batch_size: usize,
    predicted_stream: Option<StreamDescription>,
    predicted_authority: BTreeSet<ObjectPath>,
    /// Id of the activity the prediction was taken from
    source_activity: Option<ActivityId>,
}

impl RejoinStreamAndAuthorityPredictor {
    pub fn new(identity: ClientIdentity, batch_size: usize) -> Self {
        RejoinStreamAndAuthorityPredictor {
            identity,
            batch_size: batch_size.max(1),
            predicted_stream: None,
            predicted_authority: BTreeSet::new(),
            source_activity: None,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn predicted_stream(&self) -> Option<&StreamDescription> {
        self.predicted_stream.as_ref()
    }

    /// Content of the predicted Multi-User stream, empty if there is none.
    pub fn predicted_map(&self) -> &ObjectReplicationMap {
        self.predicted_stream
            .as_ref()
            .map(|stream| &stream.replication_map)
            .unwrap_or_else(|| ObjectReplicationMap::empty())
    }

    pub fn predicted_authority(&self) -> &BTreeSet<ObjectPath> {
        &self.predicted_authority
    }

    pub fn source_activity(&self) -> Option<ActivityId> {
        self.source_activity
    }

    /// Walks the log backward for the newest leave of this identity.
    /// Returns true if the prediction changed.
    pub fn recompute(&mut self, log: &dyn ActivityLog) -> bool {
        let mut end = log.last_activity_id();
        while end >= FIRST_ACTIVITY_ID {
            let first = (end - self.batch_size as ActivityId + 1).max(FIRST_ACTIVITY_ID);
            let batch = log.get_activities(first, (end - first + 1) as usize);
            for activity in batch.activities.iter().rev() {
                let Some(snapshot) = activity.leave_snapshot() else {
                    continue;
                };
                let same_client = batch
                    .identity_of(activity)
                    .is_some_and(|identity| identity.is_same_client(&self.identity));
                if same_client {
                    trace!(client = %self.identity, activity = activity.id, "Found last leave");
                    return self.set_prediction(activity.id, snapshot);
                }
            }
            end = first - 1;
        }

        debug!(client = %self.identity, "No leave activity found");
        let changed = self.predicted_stream.is_some() || !self.predicted_authority.is_empty();
        self.predicted_stream = None;
        self.predicted_authority.clear();
        self.source_activity = None;
        changed
    }

    /// Updates the prediction if `activity` is a newer leave of this identity.
    pub fn on_activity_added(&mut self, activity: &Activity, identity: &ClientIdentity) -> bool {
        let Some(snapshot) = activity.leave_snapshot() else {
            return false;
        };
        if !identity.is_same_client(&self.identity) {
            return false;
        }
        if self.source_activity.is_some_and(|source| source >= activity.id) {
            return false;
        }
        self.set_prediction(activity.id, snapshot)
    }

    fn set_prediction(&mut self, activity_id: ActivityId, snapshot: &LeaveReplicationSnapshot) -> bool {
        let stream = find_multi_user_stream(&snapshot.streams).cloned();
        let authority: BTreeSet<ObjectPath> = snapshot
            .owned_objects
            .iter()
            .filter(|(object, streams)| {
                streams.contains(&MULTI_USER_STREAM_ID)
                    && stream
                        .as_ref()
                        .is_some_and(|s| s.replication_map.contains_object(object))
            })
            .map(|(object, _)| object.clone())
            .collect();

        self.source_activity = Some(activity_id);
        let changed = self.predicted_stream != stream || self.predicted_authority != authority;
        self.predicted_stream = stream;
        self.predicted_authority = authority;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointId, PropertyChain, StreamId, StreamIdSet};
    use crate::protocol::ActivityPayload;
    use crate::session::memory::InMemoryServer;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn leave_payload(object: &ObjectPath) -> ActivityPayload {
        let mut multi_user = StreamDescription::multi_user();
        multi_user
            .replication_map
            .add_properties(object, "", [&PropertyChain::from_path("Scale")]);
        let mut custom = StreamDescription::new(StreamId::new_v4());
        custom
            .replication_map
            .add_properties(&ObjectPath::new("World:Custom"), "", [&PropertyChain::from_path("X")]);
        ActivityPayload::LeaveReplication(LeaveReplicationSnapshot {
            streams: vec![custom, multi_user],
            owned_objects: BTreeMap::from([
                (object.clone(), StreamIdSet::from([MULTI_USER_STREAM_ID])),
                (ObjectPath::new("World:Unregistered"), StreamIdSet::from([MULTI_USER_STREAM_ID])),
            ]),
        })
    }

    #[test]
    fn test_newest_leave_wins_and_custom_streams_are_ignored() {
        let server = InMemoryServer::new();
        let alice = ClientIdentity::new("Alice", "Laptop");
        let session = server.connect(alice.clone());
        let endpoint = session.endpoint_id();
        server.append_activity(endpoint, leave_payload(&ObjectPath::new("World:Old")));
        for index in 0..5 {
            server.append_activity(
                endpoint,
                ActivityPayload::Other {
                    summary: format!("edit {index}"),
                },
            );
        }
        server.append_activity(endpoint, leave_payload(&ObjectPath::new("World:New")));

        let mut predictor = RejoinStreamAndAuthorityPredictor::new(alice, 2);
        assert!(predictor.recompute(&server));
        assert!(predictor.predicted_map().contains_object(&ObjectPath::new("World:New")));
        assert!(!predictor.predicted_map().contains_object(&ObjectPath::new("World:Custom")));
        assert_eq!(
            predictor.predicted_authority(),
            &BTreeSet::from([ObjectPath::new("World:New")])
        );
    }

    #[test]
    fn test_leave_of_other_client_is_ignored() {
        let server = InMemoryServer::new();
        let bob = server.connect(ClientIdentity::new("Bob", "Laptop"));
        server.append_activity(bob.endpoint_id(), leave_payload(&ObjectPath::new("World:Cube")));

        let mut predictor =
            RejoinStreamAndAuthorityPredictor::new(ClientIdentity::new("Alice", "Laptop"), 10);
        assert!(!predictor.recompute(&server));
        assert!(predictor.predicted_stream().is_none());
    }

    #[test]
    fn test_late_leave_activity_updates_prediction() {
        let alice = ClientIdentity::new("Alice", "Laptop");
        let mut predictor = RejoinStreamAndAuthorityPredictor::new(alice.clone(), 10);
        let activity = Activity {
            id: 4,
            endpoint_id: EndpointId::from_u128(1),
            event_time: Utc::now(),
            payload: leave_payload(&ObjectPath::new("World:Cube")),
        };
        assert!(predictor.on_activity_added(&activity, &alice));
        assert!(!predictor.on_activity_added(&activity, &alice));
        assert_eq!(predictor.source_activity(), Some(4));
    }
}
