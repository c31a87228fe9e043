//! Online clients: the local client and every connected remote client.
//!
//! Each [`OnlineClient`] keeps the server-confirmed stream and authority (its
//! synchronizers) apart from the local edits that were not submitted yet. The
//! [`OnlineClientManager`] owns all of them for the duration of a joined session and keeps
//! the [`crate::authority::GlobalAuthorityCache`] in sync.

pub mod manager;
pub mod online;
pub mod pending;
pub mod reassignment;
pub mod submission;
pub mod synchronizer;

pub use manager::OnlineClientManager;
pub use online::{OnlineClient, OnlineClientKind, OnlineClients};
pub use pending::PendingChanges;
pub use reassignment::ReassignmentLogic;
pub use submission::{
    LocalSubmissionPlan, RemoteSubmissionPlan, RequestOutcome, SubmissionReport,
    prepare_local_submission, prepare_remote_submission,
};
pub use synchronizer::{AuthoritySynchronizer, StreamSynchronizer};
