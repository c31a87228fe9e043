//! Turning pending edits into requests.
//!
//! Local client edits become a `ChangeStream` request followed by a `ChangeAuthority`
//! request. Both are cleansed first so that only the subset the conflict rules allow is
//! sent. Edits of remote clients become one `PutState` request carrying the client's full
//! new state.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::authority::conflict::{
    cleanse_conflicts_from_authority_request, has_authority_conflict,
};
use crate::client::manager::OnlineClientManager;
use crate::error::ReplicationError;
use crate::model::{
    EndpointId, MULTI_USER_STREAM_ID, ObjectPath, StreamIdSet, find_multi_user_stream,
};
use crate::protocol::{
    ChangeAuthorityRequest, ChangeStreamRequest, ClientStateSnapshot, ObjectInStreamId,
    PutStateRequest,
};

/// What happened to one of the requests of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// There was nothing to send
    Skipped,
    Accepted,
    Rejected,
    /// Not sent because an earlier request of the submission failed
    NotSent,
}

/// Summary of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReport {
    pub stream: RequestOutcome,
    pub authority: RequestOutcome,
    /// Objects the server refused to hand over
    pub rejected_authority: BTreeMap<ObjectPath, StreamIdSet>,
    /// Properties dropped locally because they would have conflicted
    pub cleansed_properties: usize,
    /// Authority requests dropped locally because they would have conflicted
    pub cleansed_authority: Vec<ObjectPath>,
}

impl SubmissionReport {
    pub(crate) fn new(plan: &LocalSubmissionPlan) -> Self {
        SubmissionReport {
            stream: RequestOutcome::Skipped,
            authority: RequestOutcome::Skipped,
            rejected_authority: BTreeMap::new(),
            cleansed_properties: plan.cleansed_properties,
            cleansed_authority: plan.cleansed_authority.clone(),
        }
    }

    /// A report for a submission with nothing to send.
    pub fn nothing_to_submit() -> Self {
        SubmissionReport {
            stream: RequestOutcome::Skipped,
            authority: RequestOutcome::Skipped,
            rejected_authority: BTreeMap::new(),
            cleansed_properties: 0,
            cleansed_authority: Vec::new(),
        }
    }

    /// Whether every request that was sent got accepted in full.
    pub fn is_fully_accepted(&self) -> bool {
        !matches!(self.stream, RequestOutcome::Rejected | RequestOutcome::NotSent)
            && !matches!(
                self.authority,
                RequestOutcome::Rejected | RequestOutcome::NotSent
            )
            && self.rejected_authority.is_empty()
    }
}

/// The cleansed requests of a local submission.
#[derive(Debug)]
pub struct LocalSubmissionPlan {
    pub endpoint_id: EndpointId,
    pub stream_request: ChangeStreamRequest,
    pub authority_request: ChangeAuthorityRequest,
    pub cleansed_properties: usize,
    pub cleansed_authority: Vec<ObjectPath>,
}

impl LocalSubmissionPlan {
    pub fn is_empty(&self) -> bool {
        self.stream_request.is_empty() && self.authority_request.is_empty()
    }
}

/// Builds the local client's requests and clears its pending edits.
pub fn prepare_local_submission(manager: &mut OnlineClientManager) -> LocalSubmissionPlan {
    let clients = manager.clients();
    let local = clients.local();
    let endpoint_id = local.endpoint_id();

    let mut stream_request = local.build_stream_request();
    let cleansed_properties = manager.authority_cache().cleanse_conflicts_from_stream_request(
        clients,
        endpoint_id,
        &mut stream_request,
    );

    // Authority is checked against the stream the server will have after the cleansed
    // stream request, not against the raw edits.
    let mut prospective = local.stream().streams().to_vec();
    stream_request.apply_to(&mut prospective);
    let mut authority_request = local.build_authority_request();
    let cleansed_authority = cleanse_conflicts_from_authority_request(
        clients,
        endpoint_id,
        &mut authority_request,
        &|object| {
            find_multi_user_stream(&prospective)
                .and_then(|s| s.replication_map.properties(object))
                .cloned()
                .unwrap_or_default()
        },
    );
    authority_request.take_authority.retain(|object, _| {
        let registered = find_multi_user_stream(&prospective)
            .is_some_and(|s| s.replication_map.contains_object(object));
        if !registered {
            debug!(%object, "Dropping authority request for an object the stream will not have");
        }
        registered
    });

    if cleansed_properties > 0 || !cleansed_authority.is_empty() {
        warn!(
            cleansed_properties,
            cleansed_authority = cleansed_authority.len(),
            "Dropped conflicting edits before submission"
        );
    }

    // Edits leave the pending model once sent. A rejection reverts to the confirmed state.
    manager.edit_client(endpoint_id, |client| client.discard_pending_changes());
    LocalSubmissionPlan {
        endpoint_id,
        stream_request,
        authority_request,
        cleansed_properties,
        cleansed_authority,
    }
}

/// A put-state request for one remote client, plus the state it results in.
#[derive(Debug)]
pub struct RemoteSubmissionPlan {
    pub endpoint_id: EndpointId,
    pub request: PutStateRequest,
    /// The client's confirmed state once the server accepts the request
    pub expected_state: ClientStateSnapshot,
}

/// Builds the put-state request for a remote client's pending edits.
///
/// Returns `Ok(None)` if the client has nothing pending.
pub fn prepare_remote_submission(
    manager: &mut OnlineClientManager,
    endpoint_id: EndpointId,
) -> Result<Option<RemoteSubmissionPlan>, ReplicationError> {
    let clients = manager.clients();
    let client = clients
        .find(endpoint_id)
        .ok_or(ReplicationError::UnknownClient(endpoint_id))?;
    if !client.has_pending_changes() {
        return Ok(None);
    }

    let streams = client.post_submission_streams();
    let post_map = client.post_submission_map();
    let mut owned = client.post_submission_authority();
    owned.retain(|id| {
        if id.stream_id != MULTI_USER_STREAM_ID {
            return true;
        }
        let properties = post_map.properties(&id.object).cloned().unwrap_or_default();
        let conflicts = has_authority_conflict(clients, endpoint_id, &id.object, &properties);
        if conflicts {
            debug!(client = %endpoint_id, object = %id.object, "Dropping conflicting authority");
        }
        !conflicts
    });

    let mut request = PutStateRequest::default();
    request.new_streams.insert(endpoint_id, streams.clone());
    request.new_authority_state.insert(endpoint_id, owned.clone());
    let expected_state = ClientStateSnapshot {
        streams,
        authority: group_by_object(&owned),
        sync_control: owned,
    };

    manager.edit_client(endpoint_id, |client| client.discard_pending_changes());
    Ok(Some(RemoteSubmissionPlan {
        endpoint_id,
        request,
        expected_state,
    }))
}

pub(crate) fn group_by_object(
    owned: &BTreeSet<ObjectInStreamId>,
) -> BTreeMap<ObjectPath, StreamIdSet> {
    let mut authority: BTreeMap<ObjectPath, StreamIdSet> = BTreeMap::new();
    for id in owned {
        authority
            .entry(id.object.clone())
            .or_default()
            .insert(id.stream_id);
    }
    authority
}
