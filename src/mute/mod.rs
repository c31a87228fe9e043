//! Session-wide mute state.
//!
//! A muted object stops replicating for every client. Mutes can cover sub-objects
//! ([`crate::protocol::MuteOption::ObjectAndSubobjects`]), so whether an object is muted is
//! resolved by walking its outer chain.

pub mod manager;
pub mod synchronizer;

pub use manager::{ChangeTracker, MuteRequestOutcome, MuteStateManager};
pub use synchronizer::{MuteStateSynchronizer, resolve_mute_state};
