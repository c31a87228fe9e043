//! Route handlers of the introspection server.
//!
//! Every route is read-only and answers from the manager's in-memory state.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::manager::{AuthorityOverview, ConnectionState, MultiUserReplicationManager};
use crate::model::{EndpointId, ObjectPath, StreamIdSet};
use crate::unified::{ClientSummary, OfflineSkipMode};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connection: ConnectionState,
}

/// Shared application state
pub type AppState = Arc<MultiUserReplicationManager>;

#[derive(Deserialize, Debug)]
pub struct ObjectQuery {
    pub object: String,
}

#[derive(Serialize)]
pub struct ClientsResponse {
    pub local_endpoint: EndpointId,
    pub clients: Vec<ClientSummary>,
}

#[derive(Serialize)]
pub struct MuteResponse {
    pub object: ObjectPath,
    pub muted: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_joined() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "not in a replication session".to_string(),
        }),
    )
}

/// Basic health check endpoint
pub async fn health(State(manager): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connection: manager.connection_state(),
    })
}

/// Every online and offline client
pub async fn clients(State(manager): State<AppState>) -> Result<Json<ClientsResponse>, ApiError> {
    if !manager.is_joined() {
        return Err(not_joined());
    }
    Ok(Json(ClientsResponse {
        local_endpoint: manager.local_endpoint_id(),
        clients: manager.client_summaries(),
    }))
}

/// Confirmed authority of every online client
pub async fn authority_by_client(
    State(manager): State<AppState>,
) -> Result<Json<BTreeMap<EndpointId, BTreeMap<ObjectPath, StreamIdSet>>>, ApiError> {
    if !manager.is_joined() {
        return Err(not_joined());
    }
    Ok(Json(manager.authority_by_client()))
}

/// Which clients have an object registered and which of them own it
pub async fn authority(
    State(manager): State<AppState>,
    Query(query): Query<ObjectQuery>,
) -> Result<Json<AuthorityOverview>, ApiError> {
    debug!(object = %query.object, "Authority overview requested");
    manager
        .authority_overview(&ObjectPath::new(query.object))
        .map(Json)
        .ok_or_else(not_joined)
}

pub async fn mute(
    State(manager): State<AppState>,
    Query(query): Query<ObjectQuery>,
) -> Result<Json<MuteResponse>, ApiError> {
    if !manager.is_joined() {
        return Err(not_joined());
    }
    let object = ObjectPath::new(query.object);
    Ok(Json(MuteResponse {
        muted: manager.is_muted(&object),
        object,
    }))
}

/// Registered clients of an object, offline clients included unless fully overlapped
pub async fn object_clients(
    State(manager): State<AppState>,
    Query(query): Query<ObjectQuery>,
) -> Result<Json<Vec<crate::manager::UnifiedClientId>>, ApiError> {
    if !manager.is_joined() {
        return Err(not_joined());
    }
    Ok(Json(manager.clients_with_object(
        &ObjectPath::new(query.object),
        OfflineSkipMode::default(),
    )))
}

/// Creates and configures the main application router
pub fn create_router(manager: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clients", get(clients))
        .route("/authority", get(authority))
        .route("/authority/clients", get(authority_by_client))
        .route("/objects/clients", get(object_clients))
        .route("/mute", get(mute))
        .with_state(manager)
}
