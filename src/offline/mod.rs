//! Clients that are known from the session history but not connected.
//!
//! The [`EndpointCache`] turns the activity log into a list of logical clients, the
//! [`RejoinStreamAndAuthorityPredictor`] guesses what each of them gets back on rejoin and the
//! [`OfflineClientManager`] keeps the set of offline clients in sync with the online ones.

pub mod endpoint_cache;
pub mod manager;
pub mod predictor;

pub use endpoint_cache::{DEFAULT_ACTIVITY_BATCH_SIZE, EndpointCache, KnownClient};
pub use manager::{OfflineClient, OfflineClientManager};
pub use predictor::RejoinStreamAndAuthorityPredictor;
