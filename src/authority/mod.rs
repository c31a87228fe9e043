//! Authority tracking and conflict detection.

pub mod cache;
pub mod conflict;

pub use cache::{GlobalAuthorityCache, TakeAuthorityVerdict};
pub use conflict::{
    AuthorityConflict, ReplicationGroundTruth, collect_authority_conflicts,
    enumerate_authority_conflicts, has_authority_conflict,
};
