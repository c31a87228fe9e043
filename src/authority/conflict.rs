//! The authority conflict algorithm.
//!
//! A client may hold authority over property `P` of object `O` iff no other client both has
//! a property overlapping `P` (equal, ancestor or descendant) registered for `O` in one of
//! its streams, and currently has authority over `O` in that stream.
//!
//! The algorithm walks a [`ReplicationGroundTruth`] instead of any index so that the client
//! (confirmed state of every online client) and the server (its own records) run exactly
//! the same rules.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use crate::model::{EndpointId, ObjectPath, PropertyChain, StreamDescription, StreamId};
use crate::protocol::{ChangeAuthorityRequest, ChangeStreamRequest};

/// Verdict of a conflict check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityConflict {
    Allowed,
    Conflict,
}

impl AuthorityConflict {
    pub fn is_allowed(self) -> bool {
        self == AuthorityConflict::Allowed
    }
}

/// Source of truth about which client registers what and owns what.
pub trait ReplicationGroundTruth {
    /// Visits every client. Returning `Break` stops the walk.
    fn for_each_client(&self, callback: &mut dyn FnMut(EndpointId) -> ControlFlow<()>);

    /// Visits every stream of a client. Returning `Break` stops the walk.
    fn for_each_stream(
        &self,
        client: EndpointId,
        callback: &mut dyn FnMut(&StreamDescription) -> ControlFlow<()>,
    );

    fn has_authority(&self, client: EndpointId, object: &ObjectPath, stream: StreamId) -> bool;
}

/// Enumerates every `(other client, registered property)` pair that prevents `client` from
/// holding authority over `properties` of `object`.
///
/// `on_conflict` may return `Break` to stop after the first conflict.
pub fn enumerate_authority_conflicts(
    truth: &dyn ReplicationGroundTruth,
    client: EndpointId,
    object: &ObjectPath,
    properties: &BTreeSet<PropertyChain>,
    on_conflict: &mut dyn FnMut(EndpointId, &PropertyChain) -> ControlFlow<()>,
) -> AuthorityConflict {
    let mut verdict = AuthorityConflict::Allowed;
    if properties.is_empty() {
        return verdict;
    }

    truth.for_each_client(&mut |other| {
        if other == client {
            return ControlFlow::Continue(());
        }

        let mut flow = ControlFlow::Continue(());
        truth.for_each_stream(other, &mut |stream| {
            let Some(registered) = stream.replication_map.properties(object) else {
                return ControlFlow::Continue(());
            };
            if !truth.has_authority(other, object, stream.stream_id) {
                return ControlFlow::Continue(());
            }

            for other_property in registered {
                let overlaps = properties
                    .iter()
                    .any(|property| property.overlaps(other_property));
                if overlaps {
                    verdict = AuthorityConflict::Conflict;
                    if on_conflict(other, other_property).is_break() {
                        flow = ControlFlow::Break(());
                        return flow;
                    }
                }
            }
            ControlFlow::Continue(())
        });
        flow
    });

    verdict
}

/// Boolean short-circuit variant of [`enumerate_authority_conflicts`].
pub fn has_authority_conflict(
    truth: &dyn ReplicationGroundTruth,
    client: EndpointId,
    object: &ObjectPath,
    properties: &BTreeSet<PropertyChain>,
) -> bool {
    let verdict = enumerate_authority_conflicts(truth, client, object, properties, &mut |_, _| {
        ControlFlow::Break(())
    });
    verdict == AuthorityConflict::Conflict
}

/// Collects every conflict into a list.
pub fn collect_authority_conflicts(
    truth: &dyn ReplicationGroundTruth,
    client: EndpointId,
    object: &ObjectPath,
    properties: &BTreeSet<PropertyChain>,
) -> Vec<(EndpointId, PropertyChain)> {
    let mut conflicts = Vec::new();
    enumerate_authority_conflicts(truth, client, object, properties, &mut |other, property| {
        conflicts.push((other, property.clone()));
        ControlFlow::Continue(())
    });
    conflicts
}

/// Removes every object from `request.take_authority` that would conflict.
///
/// `properties_of` returns the properties `client` will have registered for an object once
/// its pending changes are applied. Returns the removed objects.
pub fn cleanse_conflicts_from_authority_request(
    truth: &dyn ReplicationGroundTruth,
    client: EndpointId,
    request: &mut ChangeAuthorityRequest,
    properties_of: &dyn Fn(&ObjectPath) -> BTreeSet<PropertyChain>,
) -> Vec<ObjectPath> {
    let mut removed = Vec::new();
    request.take_authority.retain(|object, _| {
        let properties = properties_of(object);
        let conflicts = has_authority_conflict(truth, client, object, &properties);
        if conflicts {
            removed.push(object.clone());
        }
        !conflicts
    });
    removed
}

/// Removes every property from `request.objects_to_put` that would conflict for objects
/// `client` has (or is about to take) authority over. Objects left without properties are
/// dropped from the request. Returns the number of removed properties.
pub fn cleanse_conflicts_from_stream_request(
    truth: &dyn ReplicationGroundTruth,
    client: EndpointId,
    request: &mut ChangeStreamRequest,
    will_have_authority: &dyn Fn(&ObjectPath, StreamId) -> bool,
) -> usize {
    let mut removed = 0;
    request.objects_to_put.retain(|object_id, info| {
        if !will_have_authority(&object_id.object, object_id.stream_id) {
            return true;
        }
        info.property_selection.retain(|property| {
            let single = BTreeSet::from([property.clone()]);
            let conflicts = has_authority_conflict(truth, client, &object_id.object, &single);
            if conflicts {
                removed += 1;
            }
            !conflicts
        });
        info.is_replicated()
    });
    removed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{MULTI_USER_STREAM_ID, StreamIdSet};
    use std::collections::BTreeMap;

    /// Minimal ground truth for exercising the algorithm.
    #[derive(Default)]
    pub(crate) struct FakeTruth {
        pub clients: BTreeMap<EndpointId, (StreamDescription, BTreeMap<ObjectPath, StreamIdSet>)>,
    }

    impl FakeTruth {
        pub(crate) fn register(
            &mut self,
            client: EndpointId,
            object: &ObjectPath,
            properties: &[&str],
            authority: bool,
        ) {
            let entry = self
                .clients
                .entry(client)
                .or_insert_with(|| (StreamDescription::multi_user(), BTreeMap::new()));
            let chains: Vec<PropertyChain> =
                properties.iter().map(|p| PropertyChain::from_path(p)).collect();
            entry.0.replication_map.add_properties(object, "", chains.iter());
            if authority {
                entry
                    .1
                    .entry(object.clone())
                    .or_default()
                    .insert(MULTI_USER_STREAM_ID);
            }
        }
    }

    impl ReplicationGroundTruth for FakeTruth {
        fn for_each_client(&self, callback: &mut dyn FnMut(EndpointId) -> ControlFlow<()>) {
            for client in self.clients.keys() {
                if callback(*client).is_break() {
                    return;
                }
            }
        }

        fn for_each_stream(
            &self,
            client: EndpointId,
            callback: &mut dyn FnMut(&StreamDescription) -> ControlFlow<()>,
        ) {
            if let Some((stream, _)) = self.clients.get(&client) {
                let _ = callback(stream);
            }
        }

        fn has_authority(&self, client: EndpointId, object: &ObjectPath, stream: StreamId) -> bool {
            self.clients
                .get(&client)
                .and_then(|(_, authority)| authority.get(object))
                .is_some_and(|streams| streams.contains(&stream))
        }
    }

    fn props(paths: &[&str]) -> BTreeSet<PropertyChain> {
        paths.iter().map(|p| PropertyChain::from_path(p)).collect()
    }

    #[test]
    fn test_same_property_conflicts_only_for_other_clients() {
        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);
        let floor = ObjectPath::new("World:Floor");
        let mut truth = FakeTruth::default();
        truth.register(a, &floor, &["RelativeLocation"], true);

        assert!(has_authority_conflict(&truth, b, &floor, &props(&["RelativeLocation"])));
        assert!(!has_authority_conflict(&truth, a, &floor, &props(&["RelativeLocation"])));
        let verdict = enumerate_authority_conflicts(
            &truth,
            b,
            &floor,
            &props(&["Scale"]),
            &mut |_, _| ControlFlow::Continue(()),
        );
        assert!(verdict.is_allowed());
    }

    #[test]
    fn test_child_conflicts_with_registered_ancestor() {
        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);
        let object = ObjectPath::new("World:Cube");
        let mut truth = FakeTruth::default();
        truth.register(a, &object, &["Transform"], true);

        let conflicts =
            collect_authority_conflicts(&truth, b, &object, &props(&["Transform.Location.X"]));
        assert_eq!(conflicts, vec![(a, PropertyChain::from_path("Transform"))]);
    }

    #[test]
    fn test_no_conflict_without_authority() {
        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);
        let object = ObjectPath::new("World:Cube");
        let mut truth = FakeTruth::default();
        truth.register(a, &object, &["Transform"], false);

        assert!(!has_authority_conflict(&truth, b, &object, &props(&["Transform"])));
    }

    #[test]
    fn test_disjoint_properties_do_not_conflict() {
        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);
        let object = ObjectPath::new("World:Cube");
        let mut truth = FakeTruth::default();
        truth.register(a, &object, &["Scale"], true);

        assert!(!has_authority_conflict(&truth, b, &object, &props(&["RelativeLocation"])));
    }

    #[test]
    fn test_enumerates_all_conflicting_clients() {
        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);
        let c = EndpointId::from_u128(3);
        let object = ObjectPath::new("World:Cube");
        let mut truth = FakeTruth::default();
        truth.register(a, &object, &["Scale"], true);
        truth.register(b, &object, &["Transform.Location"], true);

        let conflicts =
            collect_authority_conflicts(&truth, c, &object, &props(&["Scale", "Transform"]));
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.contains(&(a, PropertyChain::from_path("Scale"))));
        assert!(conflicts.contains(&(b, PropertyChain::from_path("Transform.Location"))));
    }

    #[test]
    fn test_cleanse_authority_request() {
        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);
        let cube = ObjectPath::new("World:Cube");
        let sphere = ObjectPath::new("World:Sphere");
        let mut truth = FakeTruth::default();
        truth.register(a, &cube, &["Scale"], true);

        let mut request = ChangeAuthorityRequest::default();
        for object in [&cube, &sphere] {
            request
                .take_authority
                .insert(object.clone(), StreamIdSet::from([MULTI_USER_STREAM_ID]));
        }

        let removed = cleanse_conflicts_from_authority_request(&truth, b, &mut request, &|_| {
            props(&["Scale"])
        });
        assert_eq!(removed, vec![cube]);
        assert!(request.take_authority.contains_key(&sphere));
    }

    #[test]
    fn test_cleanse_stream_request_keeps_legal_subset() {
        use crate::model::ReplicatedObjectInfo;
        use crate::protocol::ObjectInStreamId;

        let a = EndpointId::from_u128(1);
        let b = EndpointId::from_u128(2);
        let cube = ObjectPath::new("World:Cube");
        let mut truth = FakeTruth::default();
        truth.register(a, &cube, &["Scale"], true);

        let mut request = ChangeStreamRequest::default();
        let chains = props(&["Scale", "RelativeLocation"]);
        request.objects_to_put.insert(
            ObjectInStreamId::new(MULTI_USER_STREAM_ID, cube.clone()),
            ReplicatedObjectInfo::with_properties("", chains.iter()),
        );

        let removed =
            cleanse_conflicts_from_stream_request(&truth, b, &mut request, &|_, _| true);
        assert_eq!(removed, 1);
        let info = request.objects_to_put.values().next().unwrap();
        assert_eq!(info.property_selection, props(&["RelativeLocation"]));
    }
}
