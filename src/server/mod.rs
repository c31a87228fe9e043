//! Read-only HTTP introspection of the replication state.
//!
//! Serves the client list, authority overviews and mute state of a
//! [`crate::manager::MultiUserReplicationManager`] as JSON.

pub mod routes;

pub use routes::*;
