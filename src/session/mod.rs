//! Interfaces to the collaborators this crate consumes.
//!
//! The session transport and the activity log live outside the client core. They are
//! modelled by the [`ReplicationSession`] and [`ActivityLog`] traits; [`memory`] provides an
//! in-process implementation of both.

pub mod memory;

use futures_util::future::BoxFuture;

use crate::error::TransportError;
use crate::model::{ClientIdentity, EndpointId};
use crate::protocol::{
    Activity, ActivityBatch, ActivityId, ChangeAuthorityRequest, ChangeAuthorityResponse,
    ChangeMuteStateRequest, ChangeMuteStateResponse, ChangeStreamRequest, ChangeStreamResponse,
    JoinRequest, JoinResponse, PutStateRequest, PutStateResponse, QueryClientStateRequest,
    QueryClientStateResponse, QueryMuteStateResponse,
};

/// A response that arrives later, or a transport failure.
pub type ResponseFuture<T> = BoxFuture<'static, Result<T, TransportError>>;

/// The connection of the local client to a multi-user session.
pub trait ReplicationSession: Send + Sync {
    /// Endpoint of the local connection.
    fn local_endpoint_id(&self) -> EndpointId;

    fn local_client_info(&self) -> ClientIdentity;

    /// Endpoints of every other connected client.
    fn session_client_endpoint_ids(&self) -> Vec<EndpointId>;

    fn client_info(&self, endpoint_id: EndpointId) -> Option<ClientIdentity>;

    fn join(&self, request: JoinRequest) -> ResponseFuture<JoinResponse>;

    /// Tells the server the local client stops replicating. Fire and forget.
    fn leave(&self);

    fn change_stream(&self, request: ChangeStreamRequest) -> ResponseFuture<ChangeStreamResponse>;

    fn change_authority(
        &self,
        request: ChangeAuthorityRequest,
    ) -> ResponseFuture<ChangeAuthorityResponse>;

    fn change_mute_state(
        &self,
        request: ChangeMuteStateRequest,
    ) -> ResponseFuture<ChangeMuteStateResponse>;

    fn query_mute_state(&self) -> ResponseFuture<QueryMuteStateResponse>;

    fn put_state(&self, request: PutStateRequest) -> ResponseFuture<PutStateResponse>;

    fn query_client_state(
        &self,
        request: QueryClientStateRequest,
    ) -> ResponseFuture<QueryClientStateResponse>;
}

/// Read access to the session's append-only activity history.
pub trait ActivityLog: Send + Sync {
    /// Id of the newest activity, or `0` if there is none.
    fn last_activity_id(&self) -> ActivityId;

    /// Fetches up to `max_count` activities starting at `first_id` (inclusive).
    fn get_activities(&self, first_id: ActivityId, max_count: usize) -> ActivityBatch;
}

/// Notifications the session delivers to the client core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ClientConnected {
        endpoint_id: EndpointId,
        identity: ClientIdentity,
    },
    ClientDisconnected {
        endpoint_id: EndpointId,
    },
    /// A new activity was appended to (or updated in) the log
    ActivityAdded {
        activity: Activity,
        identity: ClientIdentity,
    },
}
