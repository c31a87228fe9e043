//! The global authority index.
//!
//! [`GlobalAuthorityCache`] answers "who has this object in their stream" and "who owns this
//! object" without walking every client. It is rebuilt per client: whenever a client's
//! confirmed stream or authority changes, that client's previous contributions are removed
//! and re-added from its current state, which costs O(objects of that client).
//!
//! The index only covers the Multi-User stream. Conflict checks always run the algorithm in
//! [`crate::authority::conflict`] against the [`OnlineClients`] ground truth, which sees
//! every stream of every client, so they agree with the server's verdict.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;

use tracing::trace;

use crate::authority::conflict::{
    AuthorityConflict, cleanse_conflicts_from_authority_request,
    cleanse_conflicts_from_stream_request, enumerate_authority_conflicts,
    has_authority_conflict,
};
use crate::client::online::{OnlineClient, OnlineClients};
use crate::model::{EndpointId, ObjectHierarchy, ObjectPath, PropertyChain};
use crate::protocol::{ChangeAuthorityRequest, ChangeStreamRequest};

/// Result of [`GlobalAuthorityCache::can_client_take_authority_after_submission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeAuthorityVerdict {
    /// The client has no properties registered for the object, so there is nothing to own
    NotApplicable,
    Allowed,
    Conflict,
}

/// What one client put into the index, so it can be taken out again.
#[derive(Debug, Default, Clone)]
struct ClientContribution {
    stream_objects: BTreeSet<ObjectPath>,
    authority_objects: BTreeSet<ObjectPath>,
}

#[derive(Debug, Default)]
pub struct GlobalAuthorityCache {
    stream_objects_to_clients: HashMap<ObjectPath, HashSet<EndpointId>>,
    authority_objects_to_clients: HashMap<ObjectPath, HashSet<EndpointId>>,
    contributions: HashMap<EndpointId, ClientContribution>,
    stream_hierarchy: ObjectHierarchy,
}

impl GlobalAuthorityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the contributions of one client from its confirmed state.
    pub fn on_client_changed(&mut self, client: &OnlineClient) {
        let endpoint_id = client.endpoint_id();
        self.on_client_removed(endpoint_id);

        let map = client.confirmed_map();
        let mut contribution = ClientContribution::default();
        for object in map.objects.keys() {
            self.stream_objects_to_clients
                .entry(object.clone())
                .or_default()
                .insert(endpoint_id);
            self.stream_hierarchy.add_object(object);
            contribution.stream_objects.insert(object.clone());
        }
        for object in client.authority().owned_objects() {
            // Authority without a registration is not indexed.
            if !map.contains_object(object) {
                continue;
            }
            self.authority_objects_to_clients
                .entry(object.clone())
                .or_default()
                .insert(endpoint_id);
            contribution.authority_objects.insert(object.clone());
        }
        trace!(
            %endpoint_id,
            stream_objects = contribution.stream_objects.len(),
            authority_objects = contribution.authority_objects.len(),
            "Rebuilt authority cache entries"
        );
        self.contributions.insert(endpoint_id, contribution);
    }

    /// Removes every contribution of a client.
    pub fn on_client_removed(&mut self, endpoint_id: EndpointId) {
        let Some(contribution) = self.contributions.remove(&endpoint_id) else {
            return;
        };
        for object in &contribution.stream_objects {
            let now_empty =
                remove_from_index(&mut self.stream_objects_to_clients, object, endpoint_id);
            if now_empty {
                self.stream_hierarchy.remove_object(object);
            }
        }
        for object in &contribution.authority_objects {
            remove_from_index(&mut self.authority_objects_to_clients, object, endpoint_id);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn for_each_client_with_object_in_stream(
        &self,
        object: &ObjectPath,
        callback: &mut dyn FnMut(EndpointId) -> ControlFlow<()>,
    ) {
        for client in self.stream_objects_to_clients.get(object).into_iter().flatten() {
            if callback(*client).is_break() {
                return;
            }
        }
    }

    pub fn for_each_client_with_authority_over_object(
        &self,
        object: &ObjectPath,
        callback: &mut dyn FnMut(EndpointId) -> ControlFlow<()>,
    ) {
        for client in self.authority_objects_to_clients.get(object).into_iter().flatten() {
            if callback(*client).is_break() {
                return;
            }
        }
    }

    pub fn has_authority_over_object(&self, object: &ObjectPath, client: EndpointId) -> bool {
        self.authority_objects_to_clients
            .get(object)
            .is_some_and(|clients| clients.contains(&client))
    }

    /// Clients with the object in their stream, sorted for stable output.
    pub fn clients_with_object_in_stream(&self, object: &ObjectPath) -> Vec<EndpointId> {
        sorted(self.stream_objects_to_clients.get(object))
    }

    pub fn clients_with_authority_over_object(&self, object: &ObjectPath) -> Vec<EndpointId> {
        sorted(self.authority_objects_to_clients.get(object))
    }

    /// Every object registered by at least one online client.
    pub fn objects_in_streams(&self) -> impl Iterator<Item = &ObjectPath> {
        self.stream_objects_to_clients.keys()
    }

    /// Parent/child index over every object registered by any online client.
    pub fn stream_object_hierarchy(&self) -> &ObjectHierarchy {
        &self.stream_hierarchy
    }

    /// Checks the index invariants: authority implies registration and no set is empty.
    pub fn is_consistent(&self) -> bool {
        let no_empty_sets = self
            .stream_objects_to_clients
            .values()
            .chain(self.authority_objects_to_clients.values())
            .all(|clients| !clients.is_empty());
        let authority_registered = self
            .authority_objects_to_clients
            .iter()
            .all(|(object, owners)| {
                self.stream_objects_to_clients
                    .get(object)
                    .is_some_and(|registered| owners.is_subset(registered))
            });
        no_empty_sets && authority_registered
    }

    /// Whether the index only references the given clients.
    pub fn only_references(&self, clients: &OnlineClients) -> bool {
        self.contributions.keys().all(|id| clients.contains(*id))
    }

    /// Previews whether `client` could own `object` once its pending edits are submitted.
    ///
    /// Uses the client's post-submission properties. `on_conflict` receives every conflicting
    /// `(client, property)` pair; returning `Break` stops the enumeration.
    pub fn can_client_take_authority_after_submission(
        &self,
        clients: &OnlineClients,
        object: &ObjectPath,
        client: EndpointId,
        on_conflict: Option<&mut dyn FnMut(EndpointId, &PropertyChain) -> ControlFlow<()>>,
    ) -> TakeAuthorityVerdict {
        let Some(online_client) = clients.find(client) else {
            return TakeAuthorityVerdict::NotApplicable;
        };
        let properties = online_client.post_submission_properties(object);
        if properties.is_empty() {
            return TakeAuthorityVerdict::NotApplicable;
        }

        let verdict = match on_conflict {
            Some(callback) => {
                enumerate_authority_conflicts(clients, client, object, &properties, callback)
            }
            None => {
                if has_authority_conflict(clients, client, object, &properties) {
                    AuthorityConflict::Conflict
                } else {
                    AuthorityConflict::Allowed
                }
            }
        };
        match verdict {
            AuthorityConflict::Allowed => TakeAuthorityVerdict::Allowed,
            AuthorityConflict::Conflict => TakeAuthorityVerdict::Conflict,
        }
    }

    /// Whether `client` may register `property` for `object` without conflicting.
    pub fn can_client_add_property(
        &self,
        clients: &OnlineClients,
        object: &ObjectPath,
        client: EndpointId,
        property: &PropertyChain,
    ) -> bool {
        let single = BTreeSet::from([property.clone()]);
        !has_authority_conflict(clients, client, object, &single)
    }

    /// The client that both registers `property` for `object` and owns `object`.
    ///
    /// Returns the first match. Until the server rejects a racing request, more than one
    /// client may transiently look like an owner.
    pub fn get_client_with_authority_over_property(
        &self,
        clients: &OnlineClients,
        object: &ObjectPath,
        property: &PropertyChain,
    ) -> Option<EndpointId> {
        self.clients_with_authority_over_object(object)
            .into_iter()
            .find(|owner| {
                clients
                    .find(*owner)
                    .is_some_and(|c| c.confirmed_map().has_property(object, property))
            })
    }

    /// Removes conflicting objects from an outgoing authority request of `client`.
    pub fn cleanse_conflicts_from_authority_request(
        &self,
        clients: &OnlineClients,
        client: EndpointId,
        request: &mut ChangeAuthorityRequest,
    ) -> Vec<ObjectPath> {
        let Some(online_client) = clients.find(client) else {
            return Vec::new();
        };
        cleanse_conflicts_from_authority_request(clients, client, request, &|object| {
            online_client.post_submission_properties(object)
        })
    }

    /// Removes conflicting properties from an outgoing stream request of `client`.
    pub fn cleanse_conflicts_from_stream_request(
        &self,
        clients: &OnlineClients,
        client: EndpointId,
        request: &mut ChangeStreamRequest,
    ) -> usize {
        let Some(online_client) = clients.find(client) else {
            return 0;
        };
        cleanse_conflicts_from_stream_request(clients, client, request, &|object, _| {
            online_client.will_have_authority(object)
        })
    }
}

/// Removes `client` from `index[object]`. Returns true if no client has the object anymore.
fn remove_from_index(
    index: &mut HashMap<ObjectPath, HashSet<EndpointId>>,
    object: &ObjectPath,
    client: EndpointId,
) -> bool {
    let Some(clients) = index.get_mut(object) else {
        return true;
    };
    clients.remove(&client);
    if clients.is_empty() {
        index.remove(object);
        return true;
    }
    false
}

fn sorted(clients: Option<&HashSet<EndpointId>>) -> Vec<EndpointId> {
    let mut clients: Vec<EndpointId> = clients.into_iter().flatten().copied().collect();
    clients.sort();
    clients
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::online::OnlineClientKind;
    use crate::model::{
        ClientIdentity, MULTI_USER_STREAM_ID, StreamDescription, StreamId, StreamIdSet,
    };
    use crate::protocol::ClientStateSnapshot;
    use std::collections::BTreeMap;

    fn props(paths: &[&str]) -> BTreeSet<PropertyChain> {
        paths.iter().map(|p| PropertyChain::from_path(p)).collect()
    }

    fn client_with(
        id: u128,
        kind: OnlineClientKind,
        objects: &[(&ObjectPath, &[&str], bool)],
    ) -> OnlineClient {
        let mut client = OnlineClient::new(
            EndpointId::from_u128(id),
            ClientIdentity::new(format!("Client{id}"), "Device"),
            kind,
        );
        let mut stream = StreamDescription::multi_user();
        let mut authority = BTreeMap::new();
        for (object, properties, owned) in objects {
            stream
                .replication_map
                .add_properties(object, "", &props(properties));
            if *owned {
                authority.insert((*object).clone(), StreamIdSet::from([MULTI_USER_STREAM_ID]));
            }
        }
        client.apply_snapshot(&ClientStateSnapshot {
            streams: vec![stream],
            authority,
            sync_control: BTreeSet::new(),
        });
        client
    }

    fn floor_scenario() -> (OnlineClients, GlobalAuthorityCache, ObjectPath) {
        let floor = ObjectPath::new("World:FloorActor");
        let a = client_with(1, OnlineClientKind::Local, &[(&floor, &["RelativeLocation"][..], true)]);
        let b = client_with(2, OnlineClientKind::Remote, &[]);
        let mut clients = OnlineClients::new(a);
        clients.insert_remote(b);
        let mut cache = GlobalAuthorityCache::new();
        for client in clients.iter() {
            cache.on_client_changed(client);
        }
        (clients, cache, floor)
    }

    #[test]
    fn test_take_authority_preview_reports_conflicting_property() {
        let (mut clients, cache, floor) = floor_scenario();
        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);

        assert_eq!(
            cache.can_client_take_authority_after_submission(&clients, &floor, b, None),
            TakeAuthorityVerdict::NotApplicable
        );

        clients
            .find_mut(b)
            .unwrap()
            .add_properties(&floor, "", &props(&["RelativeLocation.X"]));
        let mut conflicts = Vec::new();
        let verdict = cache.can_client_take_authority_after_submission(
            &clients,
            &floor,
            b,
            Some(&mut |client, property| {
                conflicts.push((client, property.clone()));
                ControlFlow::Continue(())
            }),
        );
        assert_eq!(verdict, TakeAuthorityVerdict::Conflict);
        assert_eq!(conflicts, vec![(a, PropertyChain::from_path("RelativeLocation"))]);
    }

    #[test]
    fn test_add_property_is_symmetric() {
        let (clients, cache, floor) = floor_scenario();
        let property = PropertyChain::from_path("RelativeLocation");
        assert!(cache.can_client_add_property(&clients, &floor, EndpointId::from_u128(1), &property));
        assert!(!cache.can_client_add_property(&clients, &floor, EndpointId::from_u128(2), &property));
    }

    #[test]
    fn test_owner_of_property() {
        let (clients, cache, floor) = floor_scenario();
        assert_eq!(
            cache.get_client_with_authority_over_property(
                &clients,
                &floor,
                &PropertyChain::from_path("RelativeLocation")
            ),
            Some(EndpointId::from_u128(1))
        );
        assert_eq!(
            cache.get_client_with_authority_over_property(
                &clients,
                &floor,
                &PropertyChain::from_path("Scale")
            ),
            None
        );
    }

    #[test]
    fn test_rebuild_removes_stale_contributions() {
        let (mut clients, mut cache, floor) = floor_scenario();
        let a = EndpointId::from_u128(1);
        assert!(cache.has_authority_over_object(&floor, a));

        clients.local_mut().apply_snapshot(&ClientStateSnapshot {
            streams: vec![StreamDescription::multi_user()],
            ..Default::default()
        });
        cache.on_client_changed(clients.local());

        assert!(!cache.has_authority_over_object(&floor, a));
        assert!(cache.clients_with_object_in_stream(&floor).is_empty());
        assert!(cache.stream_object_hierarchy().is_empty());
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_removed_client_leaves_no_empty_sets() {
        let (clients, mut cache, floor) = floor_scenario();
        cache.on_client_removed(EndpointId::from_u128(1));
        assert!(cache.clients_with_authority_over_object(&floor).is_empty());
        assert!(cache.objects_in_streams().next().is_none());
        assert!(cache.is_consistent());
        assert!(cache.only_references(&clients));
    }

    #[test]
    fn test_cleanse_uses_post_submission_state() {
        let (mut clients, cache, floor) = floor_scenario();
        let b = EndpointId::from_u128(2);
        let remote = clients.find_mut(b).unwrap();
        remote.add_properties(&floor, "", &props(&["RelativeLocation", "Scale"]));
        remote.take_authority(&floor).unwrap();

        let mut stream_request = clients.find(b).unwrap().build_stream_request();
        let removed = cache.cleanse_conflicts_from_stream_request(&clients, b, &mut stream_request);
        assert_eq!(removed, 1);

        let mut authority_request = clients.find(b).unwrap().build_authority_request();
        let dropped =
            cache.cleanse_conflicts_from_authority_request(&clients, b, &mut authority_request);
        assert_eq!(dropped, vec![floor]);
    }

    /// Remote 2 owns the floor through a stream of its own, which the index does not cover.
    fn custom_stream_scenario() -> (OnlineClients, GlobalAuthorityCache, ObjectPath, StreamId) {
        let floor = ObjectPath::new("World:FloorActor");
        let custom = StreamId(uuid::Uuid::from_u128(7));
        let local = client_with(1, OnlineClientKind::Local, &[]);
        let mut remote = client_with(2, OnlineClientKind::Remote, &[]);
        let mut stream = StreamDescription::new(custom);
        stream
            .replication_map
            .add_properties(&floor, "", &props(&["RelativeScale3D"]));
        remote.apply_snapshot(&ClientStateSnapshot {
            streams: vec![stream],
            authority: BTreeMap::from([(floor.clone(), StreamIdSet::from([custom]))]),
            sync_control: BTreeSet::new(),
        });
        let mut clients = OnlineClients::new(local);
        clients.insert_remote(remote);
        let mut cache = GlobalAuthorityCache::new();
        for client in clients.iter() {
            cache.on_client_changed(client);
        }
        (clients, cache, floor, custom)
    }

    #[test]
    fn test_authority_through_custom_stream_conflicts() {
        let (mut clients, cache, floor, _) = custom_stream_scenario();
        let local = EndpointId::from_u128(1);
        let scale = PropertyChain::from_path("RelativeScale3D.X");
        assert!(cache.clients_with_authority_over_object(&floor).is_empty());

        assert!(has_authority_conflict(&clients, local, &floor, &BTreeSet::from([scale.clone()])));
        assert!(!cache.can_client_add_property(&clients, &floor, local, &scale));
        assert!(cache.can_client_add_property(
            &clients,
            &floor,
            local,
            &PropertyChain::from_path("RelativeLocation")
        ));

        clients
            .local_mut()
            .add_properties(&floor, "", &props(&["RelativeScale3D"]));
        assert_eq!(
            cache.can_client_take_authority_after_submission(&clients, &floor, local, None),
            TakeAuthorityVerdict::Conflict
        );
    }

    #[test]
    fn test_index_enumeration_stops_on_break() {
        let (clients, cache, floor) = floor_scenario();
        let mut visited = Vec::new();
        cache.for_each_client_with_object_in_stream(&floor, &mut |client| {
            visited.push(client);
            ControlFlow::Break(())
        });
        cache.for_each_client_with_authority_over_object(&floor, &mut |client| {
            visited.push(client);
            ControlFlow::Continue(())
        });
        assert_eq!(visited, vec![EndpointId::from_u128(1); 2]);
        assert_eq!(clients.remote_count(), 1);
    }
}
