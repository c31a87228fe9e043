//! Maps transient endpoints to stable client identities.
//!
//! Every (re)join gives a client a new endpoint id. The cache walks the activity log and
//! coalesces all endpoints of the same person under one [`KnownClient`]. Updates are
//! incremental: the cache remembers the next activity id it has not looked at yet.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::model::{ClientIdentity, EndpointId};
use crate::protocol::{Activity, ActivityId, FIRST_ACTIVITY_ID};
use crate::session::ActivityLog;

/// Default number of activities fetched per batch.
pub const DEFAULT_ACTIVITY_BATCH_SIZE: usize = 1000;

/// One logical client and every endpoint it ever used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownClient {
    pub identity: ClientIdentity,
    /// Endpoints in the order they were first seen
    pub endpoints: Vec<EndpointId>,
}

impl KnownClient {
    pub fn last_endpoint(&self) -> Option<EndpointId> {
        self.endpoints.last().copied()
    }
}

#[derive(Debug)]
pub struct EndpointCache {
    known_clients: Vec<KnownClient>,
    /// Index into `known_clients` for every endpoint
    endpoint_owner: HashMap<EndpointId, usize>,
    next_first_activity_to_fetch: ActivityId,
    batch_size: usize,
}

impl Default for EndpointCache {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_BATCH_SIZE)
    }
}

impl EndpointCache {
    pub fn new(batch_size: usize) -> Self {
        EndpointCache {
            known_clients: Vec::new(),
            endpoint_owner: HashMap::new(),
            next_first_activity_to_fetch: FIRST_ACTIVITY_ID,
            batch_size: batch_size.max(1),
        }
    }

    pub fn known_clients(&self) -> &[KnownClient] {
        &self.known_clients
    }

    pub fn next_first_activity_to_fetch(&self) -> ActivityId {
        self.next_first_activity_to_fetch
    }

    /// Fetches every activity not seen yet and registers its endpoint.
    /// Returns true if any client entry was added or changed.
    pub fn update_endpoints(&mut self, log: &dyn ActivityLog) -> bool {
        let last_activity = log.last_activity_id();
        let mut changed = false;
        while self.next_first_activity_to_fetch <= last_activity {
            let batch = log.get_activities(self.next_first_activity_to_fetch, self.batch_size);
            if batch.activities.is_empty() {
                debug!(
                    first = self.next_first_activity_to_fetch,
                    last_activity, "Activity log returned an empty batch"
                );
                break;
            }
            for activity in &batch.activities {
                if let Some(identity) = batch.identity_of(activity) {
                    changed |= self.register_endpoint(activity.endpoint_id, identity);
                }
                self.next_first_activity_to_fetch =
                    self.next_first_activity_to_fetch.max(activity.id + 1);
            }
        }
        changed
    }

    /// Registers a single new activity as it arrives.
    pub fn on_activity_added(&mut self, activity: &Activity, identity: &ClientIdentity) -> bool {
        let changed = self.register_endpoint(activity.endpoint_id, identity);
        // Activities arriving out of band must not make the next batch fetch skip anything.
        if activity.id == self.next_first_activity_to_fetch {
            self.next_first_activity_to_fetch += 1;
        }
        changed
    }

    /// Merges an `(endpoint, identity)` observation. Returns true if anything changed.
    pub fn register_endpoint(&mut self, endpoint_id: EndpointId, identity: &ClientIdentity) -> bool {
        if let Some(&owner) = self.endpoint_owner.get(&endpoint_id) {
            let known = &mut self.known_clients[owner];
            if known.identity.is_same_client(identity) {
                return false;
            }
            debug!(%endpoint_id, from = %known.identity, to = %identity, "Client changed its name");
            known.identity = identity.clone();
            self.merge_duplicate_of(owner);
            return true;
        }

        match self
            .known_clients
            .iter()
            .position(|known| known.identity.is_same_client(identity))
        {
            Some(index) => {
                trace!(%endpoint_id, client = %identity, "New endpoint for known client");
                self.known_clients[index].endpoints.push(endpoint_id);
                self.endpoint_owner.insert(endpoint_id, index);
            }
            None => {
                trace!(%endpoint_id, client = %identity, "New client");
                self.known_clients.push(KnownClient {
                    identity: identity.clone(),
                    endpoints: vec![endpoint_id],
                });
                self.endpoint_owner
                    .insert(endpoint_id, self.known_clients.len() - 1);
            }
        }
        true
    }

    /// Folds the entry at `index` into an older entry with the same identity, if there is one.
    fn merge_duplicate_of(&mut self, index: usize) {
        let identity = &self.known_clients[index].identity;
        let Some(target) = self
            .known_clients
            .iter()
            .position(|known| known.identity.is_same_client(identity))
            .filter(|target| *target != index)
        else {
            return;
        };
        let merged = self.known_clients.remove(index);
        let target = if target > index { target - 1 } else { target };
        debug!(client = %merged.identity, "Merged renamed client into existing entry");
        for endpoint_id in merged.endpoints {
            if !self.known_clients[target].endpoints.contains(&endpoint_id) {
                self.known_clients[target].endpoints.push(endpoint_id);
            }
        }
        self.endpoint_owner = self
            .known_clients
            .iter()
            .enumerate()
            .flat_map(|(index, known)| known.endpoints.iter().map(move |id| (*id, index)))
            .collect();
    }

    pub fn identity_of(&self, endpoint_id: EndpointId) -> Option<&ClientIdentity> {
        self.endpoint_owner
            .get(&endpoint_id)
            .map(|index| &self.known_clients[*index].identity)
    }

    pub fn find_client(&self, identity: &ClientIdentity) -> Option<&KnownClient> {
        self.known_clients
            .iter()
            .find(|known| known.identity.is_same_client(identity))
    }

    pub fn endpoints_of(&self, identity: &ClientIdentity) -> &[EndpointId] {
        self.find_client(identity)
            .map(|known| known.endpoints.as_slice())
            .unwrap_or(&[])
    }
}
