//! Message shapes of the replication protocol and the activity log.

pub mod activity;
pub mod messages;

pub use activity::{
    Activity, ActivityBatch, ActivityId, ActivityPayload, FIRST_ACTIVITY_ID,
    LeaveReplicationSnapshot,
};
pub use messages::*;
