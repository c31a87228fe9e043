//! Entries of the session's append-only activity log.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::model::{ClientIdentity, EndpointId, ObjectPath, StreamDescription, StreamIdSet};

/// Activity ids are assigned by the server, starting at 1.
pub type ActivityId = i64;

/// The first id the server ever hands out.
pub const FIRST_ACTIVITY_ID: ActivityId = 1;

/// What a client owned at the moment it left replication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveReplicationSnapshot {
    pub streams: Vec<StreamDescription>,
    pub owned_objects: BTreeMap<ObjectPath, StreamIdSet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityPayload {
    /// The client started taking part in replication
    JoinReplication,
    /// The client stopped taking part in replication
    LeaveReplication(LeaveReplicationSnapshot),
    /// The session's mute state was changed
    ChangeMuteState,
    /// Any other activity, such as a transaction or package save
    Other { summary: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub id: ActivityId,
    /// Connection that produced the activity
    pub endpoint_id: EndpointId,
    pub event_time: DateTime<Utc>,
    pub payload: ActivityPayload,
}

impl Activity {
    pub fn leave_snapshot(&self) -> Option<&LeaveReplicationSnapshot> {
        match &self.payload {
            ActivityPayload::LeaveReplication(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// A contiguous range of activities plus the identities of every endpoint that appears in it.
#[derive(Debug, Clone, Default)]
pub struct ActivityBatch {
    pub client_infos: HashMap<EndpointId, ClientIdentity>,
    pub activities: Vec<Activity>,
}

impl ActivityBatch {
    /// Identity of the endpoint that produced an activity.
    pub fn identity_of(&self, activity: &Activity) -> Option<&ClientIdentity> {
        self.client_infos.get(&activity.endpoint_id)
    }
}
