//! The entry point the host application talks to.
//!
//! [`MultiUserReplicationManager`] joins and leaves the replication session, owns every
//! per-session manager while joined and turns session notifications into state changes.
//!
//! State lives behind a [`parking_lot::Mutex`] that is never held across an `await`. Every
//! asynchronous operation remembers the session generation it started in; if the session was
//! left (or left and re-joined) by the time a response arrives, the operation resolves with
//! [`ReplicationError::Cancelled`] and the response is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{
    OnlineClient, OnlineClientManager, RequestOutcome, SubmissionReport, prepare_local_submission,
    prepare_remote_submission,
};
use crate::config::ReplicationConfig;
use crate::error::{PresetError, ReplicationError};
use crate::events::{EventBus, ReplicationEvent};
use crate::model::{ClientIdentity, EndpointId, ObjectPath, PropertyChain, StreamIdSet};
use crate::mute::{MuteRequestOutcome, MuteStateManager};
use crate::notify::Notifier;
use crate::offline::{OfflineClient, OfflineClientManager, RejoinStreamAndAuthorityPredictor};
use crate::preset::{ApplyPresetFlags, MultiUserSessionPreset, PresetManager, SceneResolver};
use crate::protocol::{
    ActivityPayload, ChangeAuthorityErrorCode, ChangeMuteStateRequest, ChangeStreamErrorCode,
    JoinRequest, JoinResponse, MuteSetting, QueryClientStateRequest,
};
use crate::session::{ActivityLog, ReplicationSession, SessionEvent};
use crate::unified::{
    ClientSummary, ClientType, OfflineSkipMode, UnifiedClientRef, UnifiedClientView,
    UnifiedStreamCache,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Joining,
    Joined,
}

/// An owned client reference, online by endpoint or offline by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedClientId {
    Online(EndpointId),
    Offline(ClientIdentity),
}

impl From<UnifiedClientRef<'_>> for UnifiedClientId {
    fn from(client: UnifiedClientRef<'_>) -> Self {
        match client {
            UnifiedClientRef::Online(endpoint_id) => UnifiedClientId::Online(endpoint_id),
            UnifiedClientRef::Offline(identity) => UnifiedClientId::Offline(identity.clone()),
        }
    }
}

/// Who has an object registered and who owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorityOverview {
    pub object: ObjectPath,
    pub in_stream: Vec<EndpointId>,
    pub with_authority: Vec<EndpointId>,
    /// Offline clients predicted to re-register the object when they rejoin
    pub offline: Vec<ClientIdentity>,
}

/// Collaborators shared by the facade and the tasks it spawns.
struct Shared {
    session: Arc<dyn ReplicationSession>,
    activity_log: Arc<dyn ActivityLog>,
    scene: Arc<dyn SceneResolver>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    activity_batch_size: usize,
}

#[derive(Default)]
struct Inner {
    /// Bumped on every join and leave
    generation: u64,
    joining: bool,
    session: Option<JoinedSession>,
}

/// Everything that only exists while the session is joined.
struct JoinedSession {
    online: OnlineClientManager,
    offline: OfflineClientManager,
    stream_cache: UnifiedStreamCache,
    mute: MuteStateManager,
    presets: PresetManager,
    /// Remote clients whose state must be queried again
    stale_clients: BTreeSet<EndpointId>,
    mute_state_stale: bool,
}

impl JoinedSession {
    fn refresh_offline_clients(&mut self, log: &dyn ActivityLog) {
        if self
            .offline
            .refresh_offline_clients(&self.online.online_identities(), log)
        {
            self.stream_cache.refresh_offline(&self.offline);
        }
    }

    fn take_deferred_work(&mut self) -> Option<DeferredWork> {
        let mute_request = self.mute.take_pending_request();
        let work = DeferredWork {
            mute_request,
            stale_clients: std::mem::take(&mut self.stale_clients)
                .into_iter()
                .collect(),
            refresh_mute_state: std::mem::take(&mut self.mute_state_stale),
        };
        (!work.is_empty()).then_some(work)
    }
}

/// Work collected by [`MultiUserReplicationManager::tick`].
#[derive(Debug)]
struct DeferredWork {
    mute_request: Option<ChangeMuteStateRequest>,
    stale_clients: Vec<EndpointId>,
    refresh_mute_state: bool,
}

impl DeferredWork {
    fn is_empty(&self) -> bool {
        self.mute_request.is_none() && self.stale_clients.is_empty() && !self.refresh_mute_state
    }
}

/// A session generation plus a weak reference to the state it belongs to.
///
/// Tasks that outlive the facade only hold this; once the manager is dropped or the
/// generation is gone, every access fails with `Cancelled`.
#[derive(Clone)]
struct SessionHandle {
    shared: Arc<Shared>,
    inner: Weak<Mutex<Inner>>,
    generation: u64,
}

impl SessionHandle {
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut JoinedSession, &Shared) -> R,
    ) -> Result<R, ReplicationError> {
        let inner = self.inner.upgrade().ok_or(ReplicationError::Cancelled)?;
        let mut inner = inner.lock();
        if inner.generation != self.generation {
            debug!(
                generation = self.generation,
                current = inner.generation,
                "Dropping response of a left session"
            );
            return Err(ReplicationError::Cancelled);
        }
        let session = inner.session.as_mut().ok_or(ReplicationError::Cancelled)?;
        Ok(f(session, &self.shared))
    }

    async fn refresh_clients(&self, endpoints: Vec<EndpointId>) -> Result<(), ReplicationError> {
        if endpoints.is_empty() {
            return Ok(());
        }
        let response = self
            .shared
            .session
            .query_client_state(QueryClientStateRequest { endpoints })
            .await?;
        self.with_session(|session, _| {
            for (endpoint_id, snapshot) in &response.clients {
                session.online.apply_client_snapshot(*endpoint_id, snapshot);
            }
            debug!(clients = response.clients.len(), "Refreshed client state");
        })
    }

    async fn refresh_mute_state(&self) -> Result<(), ReplicationError> {
        let response = self.shared.session.query_mute_state().await?;
        let changed = self.with_session(|session, _| session.mute.apply_query_response(&response))?;
        if changed {
            self.shared.events.publish(ReplicationEvent::MuteStateChanged);
        }
        Ok(())
    }

    async fn send_mute_request(&self, request: ChangeMuteStateRequest) {
        let result = self.shared.session.change_mute_state(request.clone()).await;
        let outcome = self.with_session(|session, _| {
            let outcome = session.mute.on_request_completed(&request, result);
            if outcome == MuteRequestOutcome::Failed {
                session.mute_state_stale = true;
            }
            outcome
        });
        if matches!(outcome, Ok(MuteRequestOutcome::Applied)) {
            self.shared.events.publish(ReplicationEvent::MuteStateChanged);
        }
    }

    async fn run_deferred_work(self, work: DeferredWork) {
        if self.with_session(|_, _| ()).is_err() {
            return;
        }
        if let Some(request) = work.mute_request {
            self.send_mute_request(request).await;
        }
        if let Err(err) = self.refresh_clients(work.stale_clients).await {
            warn!(%err, "Failed to refresh remote clients");
        }
        if work.refresh_mute_state
            && let Err(err) = self.refresh_mute_state().await
        {
            warn!(%err, "Failed to refresh mute state");
        }
    }

    async fn submit_local(&self) -> Result<SubmissionReport, ReplicationError> {
        let plan = self.with_session(|session, _| prepare_local_submission(&mut session.online))?;
        let mut report = SubmissionReport::new(&plan);
        if plan.is_empty() {
            debug!("Local client has nothing to submit");
            return Ok(report);
        }

        if !plan.stream_request.is_empty() {
            let response = self
                .shared
                .session
                .change_stream(plan.stream_request.clone())
                .await?;
            match response.error_code {
                ChangeStreamErrorCode::Success => {
                    self.with_session(|session, _| {
                        session
                            .online
                            .apply_stream_change(plan.endpoint_id, &plan.stream_request)
                    })?;
                    report.stream = RequestOutcome::Accepted;
                }
                ChangeStreamErrorCode::Rejected => {
                    warn!(
                        conflicts = response.authority_conflicts.len(),
                        semantic_errors = response.semantic_errors.len(),
                        "Stream change was rejected"
                    );
                    report.stream = RequestOutcome::Rejected;
                    if !plan.authority_request.is_empty() {
                        report.authority = RequestOutcome::NotSent;
                    }
                    return Ok(report);
                }
                ChangeStreamErrorCode::Timeout => return Err(ReplicationError::Timeout),
                ChangeStreamErrorCode::FeatureDisabled => {
                    return Err(ReplicationError::FeatureDisabled);
                }
            }
        }

        if !plan.authority_request.is_empty() {
            let response = self
                .shared
                .session
                .change_authority(plan.authority_request.clone())
                .await?;
            match response.error_code {
                ChangeAuthorityErrorCode::Handled => {
                    self.with_session(|session, _| {
                        session.online.apply_authority_response(
                            plan.endpoint_id,
                            &plan.authority_request,
                            &response,
                        )
                    })?;
                    report.authority = if response.rejected_objects.is_empty() {
                        RequestOutcome::Accepted
                    } else {
                        RequestOutcome::Rejected
                    };
                    report.rejected_authority = response.rejected_objects;
                }
                ChangeAuthorityErrorCode::Timeout => return Err(ReplicationError::Timeout),
                ChangeAuthorityErrorCode::AuthorityManagementDisabled => {
                    return Err(ReplicationError::FeatureDisabled);
                }
            }
        }
        info!(
            stream = ?report.stream,
            authority = ?report.authority,
            "Submitted local changes"
        );
        Ok(report)
    }

    async fn submit_remote(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<SubmissionReport, ReplicationError> {
        let plan = self
            .with_session(|session, _| prepare_remote_submission(&mut session.online, endpoint_id))??;
        let Some(plan) = plan else {
            debug!(client = %endpoint_id, "Remote client has nothing to submit");
            return Ok(SubmissionReport::nothing_to_submit());
        };

        let response = self.shared.session.put_state(plan.request).await?;
        if let Err(err) = ReplicationError::from_put_state_code(response.response_code) {
            warn!(
                client = %endpoint_id,
                %err,
                unknown_endpoints = response.unknown_endpoints.len(),
                "Remote client change was not applied"
            );
            return Err(err);
        }
        self.with_session(|session, _| {
            session
                .online
                .apply_client_snapshot(endpoint_id, &plan.expected_state)
        })?;
        info!(client = %endpoint_id, "Submitted remote client changes");
        Ok(SubmissionReport {
            stream: RequestOutcome::Accepted,
            authority: RequestOutcome::Accepted,
            ..SubmissionReport::nothing_to_submit()
        })
    }
}

/// Joins the replication session and coordinates every client-state manager.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
pub struct MultiUserReplicationManager {
    inner: Arc<Mutex<Inner>>,
    shared: Arc<Shared>,
}

impl MultiUserReplicationManager {
    pub fn new<S>(
        session: Arc<S>,
        scene: Arc<dyn SceneResolver>,
        notifier: Arc<dyn Notifier>,
        config: &ReplicationConfig,
    ) -> Self
    where
        S: ReplicationSession + ActivityLog + 'static,
    {
        let activity_log: Arc<dyn ActivityLog> = session.clone();
        MultiUserReplicationManager {
            inner: Arc::new(Mutex::new(Inner::default())),
            shared: Arc::new(Shared {
                session,
                activity_log,
                scene,
                notifier,
                events: EventBus::new(config.event_channel_capacity),
                activity_batch_size: config.activity_fetch_batch_size,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        let inner = self.inner.lock();
        if inner.session.is_some() {
            ConnectionState::Joined
        } else if inner.joining {
            ConnectionState::Joining
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_joined(&self) -> bool {
        self.connection_state() == ConnectionState::Joined
    }

    pub fn local_endpoint_id(&self) -> EndpointId {
        self.shared.session.local_endpoint_id()
    }

    fn handle(&self) -> Result<SessionHandle, ReplicationError> {
        let inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(ReplicationError::NotInSession);
        }
        Ok(SessionHandle {
            shared: Arc::clone(&self.shared),
            inner: Arc::downgrade(&self.inner),
            generation: inner.generation,
        })
    }

    /// Joins replication.
    ///
    /// The join request carries the Multi-User stream the local client had when it last
    /// left, as recorded in the activity log. Once joined, the state of every client and the
    /// mute state are fetched and the previously owned authority is requested again.
    pub async fn join_session(&self) -> Result<(), ReplicationError> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.joining || inner.session.is_some() {
                warn!("Join requested while already joined or joining");
                return Err(ReplicationError::AlreadyInSession);
            }
            inner.joining = true;
            inner.generation += 1;
            inner.generation
        };

        let local_identity = self.shared.session.local_client_info();
        let mut predictor = RejoinStreamAndAuthorityPredictor::new(
            local_identity.clone(),
            self.shared.activity_batch_size,
        );
        predictor.recompute(self.shared.activity_log.as_ref());
        let request = JoinRequest {
            streams: predictor.predicted_stream().cloned().into_iter().collect(),
        };
        info!(
            client = %local_identity,
            restored_objects = predictor.predicted_map().len(),
            "Joining replication session"
        );

        let response = self.shared.session.join(request).await;
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                drop(inner);
                if matches!(response, Ok(JoinResponse::Success)) {
                    self.shared.session.leave();
                }
                info!("Join was cancelled");
                return Err(ReplicationError::Cancelled);
            }
            inner.joining = false;
            match response {
                Ok(JoinResponse::Success) => {}
                Ok(JoinResponse::Rejected { reason }) => {
                    warn!(%reason, "Join was rejected");
                    return Err(ReplicationError::JoinRejected(reason));
                }
                Ok(JoinResponse::FeatureDisabled) => {
                    warn!("Replication is disabled on the server");
                    return Err(ReplicationError::FeatureDisabled);
                }
                Err(err) => {
                    error!(%err, "Join failed");
                    return Err(err.into());
                }
            }
            inner.session = Some(self.create_session(local_identity));
        }
        info!("Joined replication session");
        self.shared.events.publish(ReplicationEvent::Joined);

        let handle = SessionHandle {
            shared: Arc::clone(&self.shared),
            inner: Arc::downgrade(&self.inner),
            generation,
        };
        let mut endpoints = vec![self.local_endpoint_id()];
        endpoints.extend(self.shared.session.session_client_endpoint_ids());
        if let Err(err) = handle.refresh_clients(endpoints).await {
            warn!(%err, "Failed to fetch client state after joining");
        }
        if let Err(err) = handle.refresh_mute_state().await {
            warn!(%err, "Failed to fetch mute state after joining");
        }
        self.restore_authority(&handle, predictor.predicted_authority())
            .await
    }

    async fn restore_authority(
        &self,
        handle: &SessionHandle,
        objects: &BTreeSet<ObjectPath>,
    ) -> Result<(), ReplicationError> {
        if objects.is_empty() {
            return Ok(());
        }
        let local = self.local_endpoint_id();
        handle.with_session(|session, _| {
            session.online.edit_client(local, |client| {
                for object in objects {
                    if let Err(err) = client.take_authority(object) {
                        debug!(%object, %err, "Not restoring authority");
                    }
                }
            })
        })?;
        match handle.submit_local().await {
            Ok(report) if !report.is_fully_accepted() => {
                warn!(rejected = report.rejected_authority.len(), "Could not restore all authority");
            }
            Ok(_) => info!(objects = objects.len(), "Restored authority"),
            Err(ReplicationError::Cancelled) => return Err(ReplicationError::Cancelled),
            Err(err) => warn!(%err, "Failed to restore authority"),
        }
        Ok(())
    }

    fn create_session(&self, local_identity: ClientIdentity) -> JoinedSession {
        let session = &self.shared.session;
        let remotes = session
            .session_client_endpoint_ids()
            .into_iter()
            .filter_map(|endpoint_id| {
                session
                    .client_info(endpoint_id)
                    .map(|identity| (endpoint_id, identity))
            });
        let online = OnlineClientManager::new(
            session.local_endpoint_id(),
            local_identity,
            remotes,
            self.shared.events.clone(),
            Arc::clone(&self.shared.notifier),
        );
        let mut joined = JoinedSession {
            online,
            offline: OfflineClientManager::new(
                self.shared.activity_batch_size,
                self.shared.events.clone(),
            ),
            stream_cache: UnifiedStreamCache::new(),
            mute: MuteStateManager::new(),
            presets: PresetManager::new(),
            stale_clients: BTreeSet::new(),
            mute_state_stale: false,
        };
        joined.refresh_offline_clients(self.shared.activity_log.as_ref());
        joined
    }

    /// Leaves replication. Pending operations resolve with `Cancelled`.
    ///
    /// Returns false if there was nothing to leave.
    pub fn leave_session(&self) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            if !inner.joining && inner.session.is_none() {
                return false;
            }
            inner.generation += 1;
            inner.joining = false;
            inner.session.take()
        };
        let Some(mut session) = session else {
            info!("Cancelled join");
            return true;
        };
        self.shared.session.leave();
        session.offline.clear();
        info!("Left replication session");
        self.shared.events.publish(ReplicationEvent::Left);
        true
    }

    /// Applies a notification of the session.
    pub fn handle_session_event(&self, event: SessionEvent) {
        let mut inner = self.inner.lock();
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        let local = self.shared.session.local_endpoint_id();
        let log = self.shared.activity_log.as_ref();
        match event {
            SessionEvent::ClientConnected {
                endpoint_id,
                identity,
            } => {
                if endpoint_id == local {
                    return;
                }
                session.online.handle_client_connected(endpoint_id, identity);
                session.stale_clients.insert(endpoint_id);
                session.refresh_offline_clients(log);
            }
            SessionEvent::ClientDisconnected { endpoint_id } => {
                session.stale_clients.remove(&endpoint_id);
                session.online.handle_client_disconnected(endpoint_id);
                session.refresh_offline_clients(log);
            }
            SessionEvent::ActivityAdded { activity, identity } => {
                session.offline.on_activity_added(&activity, &identity);
                session.stream_cache.refresh_offline(&session.offline);
                if activity.endpoint_id == local {
                    return;
                }
                match activity.payload {
                    ActivityPayload::JoinReplication | ActivityPayload::LeaveReplication(_)
                        if session.online.find_client(activity.endpoint_id).is_some() =>
                    {
                        session.stale_clients.insert(activity.endpoint_id);
                    }
                    ActivityPayload::ChangeMuteState => session.mute_state_stale = true,
                    _ => {}
                }
            }
        }
    }

    /// Forwards session notifications to [`Self::handle_session_event`] until the channel
    /// closes or the manager is dropped.
    pub fn spawn_session_event_loop(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => manager.handle_session_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed session events; refreshing all clients");
                        manager.mark_all_stale();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Session event loop stopped");
        })
    }

    fn mark_all_stale(&self) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.session.as_mut() {
            session.stale_clients.extend(session.online.remote_endpoints());
            session.mute_state_stale = true;
            session.refresh_offline_clients(self.shared.activity_log.as_ref());
        }
    }

    fn collect_deferred_work(&self) -> Option<(SessionHandle, DeferredWork)> {
        let handle = self.handle().ok()?;
        let work = handle
            .with_session(|session, _| session.take_deferred_work())
            .ok()
            .flatten()?;
        Some((handle, work))
    }

    /// Starts the work that accumulated since the last tick: at most one mute request, plus
    /// refreshes of clients and mute state that notifications marked as stale.
    ///
    /// Must be called from within a tokio runtime. Returns `None` if there was nothing to do.
    pub fn tick(&self) -> Option<JoinHandle<()>> {
        let (handle, work) = self.collect_deferred_work()?;
        debug!(?work, "Flushing deferred work");
        Some(tokio::spawn(handle.run_deferred_work(work)))
    }

    /// Like [`Self::tick`], but runs the work on the current task.
    pub async fn flush(&self) {
        if let Some((handle, work)) = self.collect_deferred_work() {
            handle.run_deferred_work(work).await;
        }
    }

    /// Runs `edit` on the pending change model of an online client.
    pub fn edit_client<R>(
        &self,
        endpoint_id: EndpointId,
        edit: impl FnOnce(&mut OnlineClient) -> R,
    ) -> Result<R, ReplicationError> {
        let mut inner = self.inner.lock();
        let session = inner
            .session
            .as_mut()
            .ok_or(ReplicationError::NotInSession)?;
        session
            .online
            .edit_client(endpoint_id, edit)
            .ok_or(ReplicationError::UnknownClient(endpoint_id))
    }

    pub fn add_properties(
        &self,
        endpoint_id: EndpointId,
        object: &ObjectPath,
        class_path: &str,
        properties: &BTreeSet<PropertyChain>,
    ) -> Result<(), ReplicationError> {
        self.edit_client(endpoint_id, |client| {
            client.add_properties(object, class_path, properties)
        })
    }

    pub fn remove_properties(
        &self,
        endpoint_id: EndpointId,
        object: &ObjectPath,
        properties: &BTreeSet<PropertyChain>,
    ) -> Result<(), ReplicationError> {
        self.edit_client(endpoint_id, |client| {
            client.remove_properties(object, properties)
        })
    }

    /// Queues taking authority. Fails immediately, without contacting the server, if the
    /// object is not registered in the client's stream.
    pub fn take_authority(
        &self,
        endpoint_id: EndpointId,
        object: &ObjectPath,
    ) -> Result<(), ReplicationError> {
        self.edit_client(endpoint_id, |client| client.take_authority(object))?
    }

    pub fn release_authority(
        &self,
        endpoint_id: EndpointId,
        object: &ObjectPath,
    ) -> Result<(), ReplicationError> {
        self.edit_client(endpoint_id, |client| client.release_authority(object))
    }

    /// Sends the pending edits of a client.
    ///
    /// The local client's edits go out as a stream change followed by an authority change;
    /// a remote client's edits as a single put-state request. Nothing is sent if there is
    /// nothing to change.
    pub async fn submit_client_changes(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<SubmissionReport, ReplicationError> {
        let handle = self.handle()?;
        let is_local = handle.with_session(|session, _| {
            session.online.local_client().endpoint_id() == endpoint_id
        })?;
        if is_local {
            handle.submit_local().await
        } else {
            handle.submit_remote(endpoint_id).await
        }
    }

    /// Re-fetches the confirmed state of the given clients.
    pub async fn refresh_clients(&self, endpoints: Vec<EndpointId>) -> Result<(), ReplicationError> {
        self.handle()?.refresh_clients(endpoints).await
    }

    /// Re-fetches the confirmed state of every online client, the local one included.
    pub async fn refresh_all_clients(&self) -> Result<(), ReplicationError> {
        let handle = self.handle()?;
        let endpoints = handle.with_session(|session, _| {
            session
                .online
                .clients()
                .iter()
                .map(OnlineClient::endpoint_id)
                .collect()
        })?;
        handle.refresh_clients(endpoints).await
    }

    pub async fn refresh_mute_state(&self) -> Result<(), ReplicationError> {
        self.handle()?.refresh_mute_state().await
    }

    /// Mutes objects locally. The change is sent on the next tick.
    pub fn mute_objects(
        &self,
        objects: &[ObjectPath],
        setting: MuteSetting,
    ) -> Result<(), ReplicationError> {
        self.with_session_mut(|session| session.mute.mute_objects(objects, setting))?;
        self.shared.events.publish(ReplicationEvent::MuteStateChanged);
        Ok(())
    }

    pub fn unmute_objects(
        &self,
        objects: &[ObjectPath],
        setting: MuteSetting,
    ) -> Result<(), ReplicationError> {
        self.with_session_mut(|session| session.mute.unmute_objects(objects, setting))?;
        self.shared.events.publish(ReplicationEvent::MuteStateChanged);
        Ok(())
    }

    /// Whether `object` is muted, including local edits that were not confirmed yet.
    pub fn is_muted(&self, object: &ObjectPath) -> bool {
        self.with_session(|session| session.mute.is_muted(object))
            .unwrap_or(false)
    }

    /// Moves `properties` of `object` to `target`, taking them from every other client.
    pub async fn reassign_properties(
        &self,
        object: &ObjectPath,
        class_path: &str,
        properties: &BTreeSet<PropertyChain>,
        target: EndpointId,
    ) -> Result<(), ReplicationError> {
        let handle = self.handle()?;
        let request = handle.with_session(|session, _| {
            session.online.reassignment_logic().build_request(
                session.online.clients(),
                object,
                class_path,
                properties,
                target,
            )
        })??;
        let affected: Vec<EndpointId> = request.new_streams.keys().copied().collect();

        let response = self.shared.session.put_state(request).await?;
        ReplicationError::from_put_state_code(response.response_code)?;
        info!(%object, to = %target, clients = affected.len(), "Reassigned properties");
        handle.refresh_clients(affected).await
    }

    /// Snapshots the online clients passing `filter` and the session's mute state.
    pub fn export_preset(
        &self,
        filter: &dyn Fn(&ClientIdentity) -> bool,
    ) -> Result<MultiUserSessionPreset, PresetError> {
        let inner = self.inner.lock();
        let session = inner.session.as_ref().ok_or(PresetError::NotInSession)?;
        session.presets.export_to_preset(
            session.online.clients(),
            session.mute.synchronizer(),
            self.shared.scene.as_ref(),
            filter,
        )
    }

    /// Replaces the content of the session with `preset` in one put-state request.
    ///
    /// Only one apply may be in flight. Leaving the session while it is in flight resolves
    /// it with [`PresetError::Cancelled`].
    pub async fn apply_preset(
        &self,
        preset: &MultiUserSessionPreset,
        flags: ApplyPresetFlags,
    ) -> Result<(), PresetError> {
        let handle = self.handle()?;
        let request = handle.with_session(|session, shared| {
            session.presets.begin_apply()?;
            session
                .presets
                .build_apply_request(
                    preset,
                    session.online.clients(),
                    shared.scene.as_ref(),
                    flags,
                )
                .inspect_err(|_| session.presets.finish_apply())
        })??;
        let affected: Vec<EndpointId> = request.new_streams.keys().copied().collect();
        let mute_change = request.mute_change.clone();

        let response = self.shared.session.put_state(request).await;
        handle.with_session(|session, _| session.presets.finish_apply())?;
        let response = response.map_err(ReplicationError::from)?;
        if let Err(err) = ReplicationError::from_put_state_code(response.response_code) {
            warn!(
                %err,
                conflicts = response.authority_conflicts.len(),
                "Preset was not applied"
            );
            return Err(err.into());
        }

        handle.with_session(|session, _| session.mute.apply_confirmed_request(&mute_change))?;
        if let Err(err) = handle.refresh_clients(affected).await {
            warn!(%err, "Failed to refresh clients after applying preset");
        }
        info!("Applied session preset");
        self.shared.events.publish(ReplicationEvent::MuteStateChanged);
        self.shared.events.publish(ReplicationEvent::PresetApplied);
        Ok(())
    }

    pub fn is_applying_preset(&self) -> bool {
        self.with_session(|session| session.presets.is_applying())
            .unwrap_or(false)
    }

    fn with_session<R>(&self, f: impl FnOnce(&JoinedSession) -> R) -> Option<R> {
        self.inner.lock().session.as_ref().map(f)
    }

    fn with_session_mut<R>(
        &self,
        f: impl FnOnce(&mut JoinedSession) -> R,
    ) -> Result<R, ReplicationError> {
        self.inner
            .lock()
            .session
            .as_mut()
            .map(f)
            .ok_or(ReplicationError::NotInSession)
    }

    /// Read access to the online clients. `None` if not joined.
    pub fn with_online_clients<R>(&self, f: impl FnOnce(&OnlineClientManager) -> R) -> Option<R> {
        self.with_session(|session| f(&session.online))
    }

    pub fn offline_clients(&self) -> Vec<OfflineClient> {
        self.with_session(|session| session.offline.clients().cloned().collect())
            .unwrap_or_default()
    }

    pub fn client_summaries(&self) -> Vec<ClientSummary> {
        self.with_session(|session| {
            UnifiedClientView::new(&session.online, &session.offline).summaries()
        })
        .unwrap_or_default()
    }

    /// Summary of the client currently or last using `endpoint_id`.
    pub fn find_client(&self, endpoint_id: EndpointId) -> Option<ClientSummary> {
        self.client_summaries()
            .into_iter()
            .find(|summary| summary.endpoint_id == Some(endpoint_id))
    }

    pub fn get_client_type(&self, endpoint_id: EndpointId) -> Option<ClientType> {
        self.with_session(|session| {
            UnifiedClientView::new(&session.online, &session.offline).get_client_type(endpoint_id)
        })
        .flatten()
    }

    pub fn clients_with_object(
        &self,
        object: &ObjectPath,
        mode: OfflineSkipMode,
    ) -> Vec<UnifiedClientId> {
        self.with_session(|session| {
            session
                .stream_cache
                .clients_with_object(session.online.clients(), object, mode)
                .into_iter()
                .map(UnifiedClientId::from)
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn authority_overview(&self, object: &ObjectPath) -> Option<AuthorityOverview> {
        self.with_session(|session| {
            let cache = session.online.authority_cache();
            let offline = session
                .stream_cache
                .clients_with_object(session.online.clients(), object, OfflineSkipMode::All)
                .into_iter()
                .filter_map(|client| match client {
                    UnifiedClientRef::Offline(identity) => Some(identity.clone()),
                    UnifiedClientRef::Online(_) => None,
                })
                .collect();
            AuthorityOverview {
                object: object.clone(),
                in_stream: cache.clients_with_object_in_stream(object),
                with_authority: cache.clients_with_authority_over_object(object),
                offline,
            }
        })
    }

    /// Confirmed authority of every online client.
    pub fn authority_by_client(&self) -> BTreeMap<EndpointId, BTreeMap<ObjectPath, StreamIdSet>> {
        self.with_session(|session| {
            session
                .online
                .clients()
                .iter()
                .map(|client| (client.endpoint_id(), client.authority().authority().clone()))
                .collect()
        })
        .unwrap_or_default()
    }
}

impl Drop for MultiUserReplicationManager {
    fn drop(&mut self) {
        if self.inner.lock().session.is_some() {
            self.leave_session();
        }
    }
}
