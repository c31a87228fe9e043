//! Local mute edits, coalesced into one request per tick.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::model::ObjectPath;
use crate::mute::synchronizer::MuteStateSynchronizer;
use crate::protocol::{
    ChangeMuteStateRequest, ChangeMuteStateResponse, MuteSetting, QueryMuteStateResponse,
};

/// Accumulates mute and unmute edits until the next flush.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    request: ChangeMuteStateRequest,
    dirty: bool,
}

impl ChangeTracker {
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pending_request(&self) -> &ChangeMuteStateRequest {
        &self.request
    }

    pub fn mute(&mut self, object: &ObjectPath, setting: MuteSetting) {
        self.request.objects_to_unmute.remove(object);
        self.request.objects_to_mute.insert(object.clone(), setting);
        self.dirty = true;
    }

    pub fn unmute(&mut self, object: &ObjectPath, setting: MuteSetting) {
        self.request.objects_to_mute.remove(object);
        self.request.objects_to_unmute.insert(object.clone(), setting);
        self.dirty = true;
    }

    /// Takes the coalesced request and resets the tracker. Returns `None` if nothing is pending.
    pub fn take(&mut self) -> Option<ChangeMuteStateRequest> {
        self.dirty = false;
        let request = std::mem::take(&mut self.request);
        (!request.is_empty()).then_some(request)
    }
}

/// How a sent mute request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteRequestOutcome {
    /// The server applied the request to the confirmed state
    Applied,
    /// Rejected or lost; the optimistic state must be re-queried
    Failed,
}

/// Owns the mute state of the session as seen by the local client.
///
/// `confirmed` follows the server; `optimistic` additionally contains every local edit, sent
/// or not. A failed request is not rolled back: the next query response resets `optimistic`.
#[derive(Debug, Clone, Default)]
pub struct MuteStateManager {
    confirmed: MuteStateSynchronizer,
    optimistic: MuteStateSynchronizer,
    tracker: ChangeTracker,
    /// Sent but not answered yet
    in_flight: Option<ChangeMuteStateRequest>,
}

impl MuteStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn synchronizer(&self) -> &MuteStateSynchronizer {
        &self.confirmed
    }

    pub fn has_pending_changes(&self) -> bool {
        self.tracker.is_dirty()
    }

    /// Whether `object` is muted, including local edits that are not confirmed yet.
    pub fn is_muted(&self, object: &ObjectPath) -> bool {
        self.optimistic.is_muted(object)
    }

    pub fn explicitly_muted(&self) -> &BTreeMap<ObjectPath, MuteSetting> {
        self.optimistic.explicitly_muted()
    }

    pub fn mute_objects<'a>(
        &mut self,
        objects: impl IntoIterator<Item = &'a ObjectPath>,
        setting: MuteSetting,
    ) {
        let mut edit = ChangeMuteStateRequest::default();
        for object in objects {
            self.tracker.mute(object, setting);
            edit.objects_to_mute.insert(object.clone(), setting);
        }
        self.optimistic.apply_request(&edit);
    }

    pub fn unmute_objects<'a>(
        &mut self,
        objects: impl IntoIterator<Item = &'a ObjectPath>,
        setting: MuteSetting,
    ) {
        let mut edit = ChangeMuteStateRequest::default();
        for object in objects {
            self.tracker.unmute(object, setting);
            edit.objects_to_unmute.insert(object.clone(), setting);
        }
        self.optimistic.apply_request(&edit);
    }

    pub fn has_request_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Takes the request to send this tick, if any. Nothing is taken while another request
    /// is still in flight.
    pub fn take_pending_request(&mut self) -> Option<ChangeMuteStateRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        let request = self.tracker.take()?;
        self.in_flight = Some(request.clone());
        Some(request)
    }

    /// Processes the outcome of the request in flight.
    pub fn on_request_completed(
        &mut self,
        request: &ChangeMuteStateRequest,
        result: Result<ChangeMuteStateResponse, TransportError>,
    ) -> MuteRequestOutcome {
        self.in_flight = None;
        match result {
            Ok(response) if response.is_success() => {
                self.apply_confirmed_request(request);
                MuteRequestOutcome::Applied
            }
            Ok(response) => {
                warn!(
                    rejected = response.rejected_objects.len(),
                    "Mute state change was rejected"
                );
                MuteRequestOutcome::Failed
            }
            Err(err) => {
                warn!(%err, "Mute state change failed");
                MuteRequestOutcome::Failed
            }
        }
    }

    /// Applies a mute change the server accepted, e.g. as part of a put-state request.
    pub fn apply_confirmed_request(&mut self, request: &ChangeMuteStateRequest) {
        self.confirmed.apply_request(request);
        self.optimistic.apply_request(request);
    }

    /// Replaces the state with the server's. The request in flight and unsent edits are
    /// re-applied on top, in that order.
    pub fn apply_query_response(&mut self, response: &QueryMuteStateResponse) -> bool {
        let before = self.optimistic.muted_objects().clone();
        self.confirmed.apply_query_response(response);
        self.optimistic = self.confirmed.clone();
        if let Some(in_flight) = &self.in_flight {
            self.optimistic.apply_request(in_flight);
        }
        self.optimistic.apply_request(self.tracker.pending_request());
        let changed = before != *self.optimistic.muted_objects();
        debug!(changed, "Mute state refreshed from server");
        changed
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
