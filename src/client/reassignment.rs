//! Moving ownership of properties from one client to another.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::client::online::{OnlineClient, OnlineClients};
use crate::error::ReplicationError;
use crate::model::{
    EndpointId, MULTI_USER_STREAM_ID, ObjectPath, PropertyChain, StreamDescription, StreamIdSet,
};
use crate::protocol::{ObjectInStreamId, PutStateRequest};

/// Builds requests that hand properties of an object to a single client.
///
/// Every other client loses the overlapping properties (and its authority, if nothing is left
/// to own); the target gains the properties and authority. The result is a single
/// [`PutStateRequest`] so the server applies it atomically.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReassignmentLogic;

impl ReassignmentLogic {
    pub fn build_request(
        &self,
        clients: &OnlineClients,
        object: &ObjectPath,
        class_path: &str,
        properties: &BTreeSet<PropertyChain>,
        target: EndpointId,
    ) -> Result<PutStateRequest, ReplicationError> {
        if properties.is_empty() {
            return Err(ReplicationError::InvalidRequest(format!(
                "no properties to reassign for {object}"
            )));
        }
        let target_client = clients
            .find(target)
            .ok_or(ReplicationError::UnknownClient(target))?;

        let mut request = PutStateRequest::default();
        for client in clients.iter().filter(|c| c.endpoint_id() != target) {
            let Some(registered) = client.confirmed_map().properties(object) else {
                continue;
            };
            let remaining: BTreeSet<PropertyChain> = registered
                .iter()
                .filter(|p| !properties.iter().any(|moved| moved.overlaps(p)))
                .cloned()
                .collect();
            if remaining.len() == registered.len() {
                continue;
            }
            debug!(
                from = %client.endpoint_id(),
                to = %target,
                %object,
                "Reassigning properties"
            );
            let (streams, authority) = confirmed_state_with(client, object, remaining, false);
            request.new_streams.insert(client.endpoint_id(), streams);
            request
                .new_authority_state
                .insert(client.endpoint_id(), authority);
        }

        let mut combined = target_client
            .confirmed_map()
            .properties(object)
            .cloned()
            .unwrap_or_default();
        combined.extend(properties.iter().cloned());
        let (mut streams, authority) = confirmed_state_with(target_client, object, combined, true);
        if class_path_missing(&streams, object) {
            set_class_path(&mut streams, object, class_path);
        }
        request.new_streams.insert(target, streams);
        request.new_authority_state.insert(target, authority);
        Ok(request)
    }
}

/// The client's confirmed streams and authority with `object` replaced by `properties`.
fn confirmed_state_with(
    client: &OnlineClient,
    object: &ObjectPath,
    properties: BTreeSet<PropertyChain>,
    own_object: bool,
) -> (Vec<StreamDescription>, BTreeSet<ObjectInStreamId>) {
    let mut streams = client.stream().streams().to_vec();
    if !streams.iter().any(StreamDescription::is_multi_user) {
        streams.push(StreamDescription::multi_user());
    }
    if let Some(stream) = streams.iter_mut().find(|s| s.is_multi_user()) {
        if properties.is_empty() {
            stream.replication_map.remove_object(object);
        } else {
            let class_path = stream
                .replication_map
                .get(object)
                .map(|info| info.class_path.clone())
                .unwrap_or_default();
            stream.replication_map.remove_object(object);
            stream
                .replication_map
                .add_properties(object, &class_path, &properties);
        }
    }

    let target_id = ObjectInStreamId::new(MULTI_USER_STREAM_ID, object.clone());
    let mut authority: BTreeSet<ObjectInStreamId> = flatten(client.authority().authority());
    if own_object {
        authority.insert(target_id);
    } else if properties.is_empty() {
        authority.remove(&target_id);
    }
    (streams, authority)
}

fn flatten(authority: &BTreeMap<ObjectPath, StreamIdSet>) -> BTreeSet<ObjectInStreamId> {
    authority
        .iter()
        .flat_map(|(object, streams)| {
            streams
                .iter()
                .map(move |stream_id| ObjectInStreamId::new(*stream_id, object.clone()))
        })
        .collect()
}

fn class_path_missing(streams: &[StreamDescription], object: &ObjectPath) -> bool {
    streams
        .iter()
        .filter(|s| s.is_multi_user())
        .filter_map(|s| s.replication_map.get(object))
        .any(|info| info.class_path.is_empty())
}

fn set_class_path(streams: &mut [StreamDescription], object: &ObjectPath, class_path: &str) {
    for stream in streams.iter_mut().filter(|s| s.is_multi_user()) {
        if let Some(info) = stream.replication_map.objects.get_mut(object) {
            info.class_path = class_path.to_string();
        }
    }
}
