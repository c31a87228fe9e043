//! Edge case tests: vacuous requests, transport failures, cancellation and identity handling.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;

use multi_user_replication::error::TransportError;
use multi_user_replication::offline::EndpointCache;
use multi_user_replication::preset::{LabelObjectPath, PresetClient, PresetObject};
use multi_user_replication::protocol::{
    ActivityBatch, ActivityId, ActivityPayload, ChangeAuthorityRequest, ChangeAuthorityResponse,
    ChangeMuteStateRequest, ChangeMuteStateResponse, ChangeStreamRequest, ChangeStreamResponse,
    JoinRequest, JoinResponse, MuteSetting, PutStateRequest, PutStateResponse,
    QueryClientStateRequest, QueryClientStateResponse, QueryMuteStateResponse,
};
use multi_user_replication::session::ResponseFuture;
use multi_user_replication::{
    ActivityLog, ApplyPresetFlags, ClientIdentity, ConnectionState, EndpointId, InMemoryServer,
    InMemorySession, MultiUserReplicationManager, MultiUserSessionPreset, ObjectPath, PresetError,
    PropertyChain, RecordingNotifier, ReplicationConfig, ReplicationError, ReplicationSession,
    RequestOutcome, StaticScene,
};

fn chains(paths: &[&str]) -> BTreeSet<PropertyChain> {
    paths.iter().map(|p| PropertyChain::from_path(p)).collect()
}

fn manager_for(session: Arc<InMemorySession>) -> MultiUserReplicationManager {
    MultiUserReplicationManager::new(
        session,
        Arc::new(StaticScene::new()),
        Arc::new(RecordingNotifier::default()),
        &ReplicationConfig::default(),
    )
}

/// Wraps an in-memory session and holds join and put-state responses until released.
struct GatedSession {
    inner: InMemorySession,
    join_permits: Arc<Semaphore>,
    put_state_permits: Arc<Semaphore>,
}

impl GatedSession {
    fn new(inner: InMemorySession) -> Self {
        GatedSession {
            inner,
            join_permits: Arc::new(Semaphore::new(0)),
            put_state_permits: Arc::new(Semaphore::new(0)),
        }
    }
}

fn gated<T: Send + 'static>(permits: &Arc<Semaphore>, response: ResponseFuture<T>) -> ResponseFuture<T> {
    let permits = Arc::clone(permits);
    async move {
        permits
            .acquire()
            .await
            .map_err(|_| TransportError::Disconnected)?
            .forget();
        response.await
    }
    .boxed()
}

impl ReplicationSession for GatedSession {
    fn local_endpoint_id(&self) -> EndpointId {
        self.inner.local_endpoint_id()
    }

    fn local_client_info(&self) -> ClientIdentity {
        self.inner.local_client_info()
    }

    fn session_client_endpoint_ids(&self) -> Vec<EndpointId> {
        self.inner.session_client_endpoint_ids()
    }

    fn client_info(&self, endpoint_id: EndpointId) -> Option<ClientIdentity> {
        self.inner.client_info(endpoint_id)
    }

    fn join(&self, request: JoinRequest) -> ResponseFuture<JoinResponse> {
        gated(&self.join_permits, self.inner.join(request))
    }

    fn leave(&self) {
        self.inner.leave();
    }

    fn change_stream(&self, request: ChangeStreamRequest) -> ResponseFuture<ChangeStreamResponse> {
        self.inner.change_stream(request)
    }

    fn change_authority(
        &self,
        request: ChangeAuthorityRequest,
    ) -> ResponseFuture<ChangeAuthorityResponse> {
        self.inner.change_authority(request)
    }

    fn change_mute_state(
        &self,
        request: ChangeMuteStateRequest,
    ) -> ResponseFuture<ChangeMuteStateResponse> {
        self.inner.change_mute_state(request)
    }

    fn query_mute_state(&self) -> ResponseFuture<QueryMuteStateResponse> {
        self.inner.query_mute_state()
    }

    fn put_state(&self, request: PutStateRequest) -> ResponseFuture<PutStateResponse> {
        gated(&self.put_state_permits, self.inner.put_state(request))
    }

    fn query_client_state(
        &self,
        request: QueryClientStateRequest,
    ) -> ResponseFuture<QueryClientStateResponse> {
        self.inner.query_client_state(request)
    }
}

impl ActivityLog for GatedSession {
    fn last_activity_id(&self) -> ActivityId {
        self.inner.last_activity_id()
    }

    fn get_activities(&self, first_id: ActivityId, max_count: usize) -> ActivityBatch {
        self.inner.get_activities(first_id, max_count)
    }
}

fn gated_manager(session: Arc<GatedSession>, scene: StaticScene) -> Arc<MultiUserReplicationManager> {
    Arc::new(MultiUserReplicationManager::new(
        session,
        Arc::new(scene),
        Arc::new(RecordingNotifier::default()),
        &ReplicationConfig::default(),
    ))
}

#[test]
fn test_endpoint_cache_merge_is_idempotent() {
    let server = InMemoryServer::new();
    let alice = ClientIdentity::new("Alice", "laptop");
    let first = server.connect(alice.clone());
    server.append_activity(first.endpoint_id(), ActivityPayload::JoinReplication);
    server.disconnect(first.endpoint_id());
    let second = server.connect(alice.clone());
    server.append_activity(
        second.endpoint_id(),
        ActivityPayload::Other {
            summary: "Saved package".to_string(),
        },
    );

    let mut cache = EndpointCache::new(1);
    assert!(cache.update_endpoints(&server));
    assert!(!cache.update_endpoints(&server));
    for activity in server.activities() {
        assert!(!cache.on_activity_added(&activity, &alice));
    }

    assert_eq!(cache.known_clients().len(), 1);
    assert_eq!(
        cache.endpoints_of(&alice),
        &[first.endpoint_id(), second.endpoint_id()]
    );
}

#[tokio::test]
async fn test_take_authority_without_stream_fails_without_network() {
    let server = InMemoryServer::new();
    let session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
    let local = session.endpoint_id();
    let manager = manager_for(session);
    manager.join_session().await.unwrap();

    let before = server.request_count();
    let result = manager.take_authority(local, &ObjectPath::new("World:Cube"));
    assert!(matches!(result, Err(ReplicationError::InvalidRequest(_))));
    manager
        .release_authority(local, &ObjectPath::new("World:Cube"))
        .unwrap();
    let report = manager.submit_client_changes(local).await.unwrap();

    assert_eq!(report.stream, RequestOutcome::Skipped);
    assert_eq!(report.authority, RequestOutcome::Skipped);
    assert_eq!(server.request_count(), before);
}

#[tokio::test]
async fn test_cleansed_authority_request_is_not_sent() {
    let server = InMemoryServer::new();
    let floor = ObjectPath::new("World:FloorActor");

    let alice_session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
    let alice_id = alice_session.endpoint_id();
    let alice = manager_for(alice_session);
    alice.join_session().await.unwrap();
    alice
        .add_properties(alice_id, &floor, "Class", &chains(&["RelativeLocation"]))
        .unwrap();
    alice.take_authority(alice_id, &floor).unwrap();
    alice.submit_client_changes(alice_id).await.unwrap();

    let bob_session = Arc::new(server.connect(ClientIdentity::new("Bob", "desktop")));
    let bob_id = bob_session.endpoint_id();
    let bob = manager_for(bob_session);
    bob.join_session().await.unwrap();
    bob.add_properties(bob_id, &floor, "Class", &chains(&["RelativeLocation.X"]))
        .unwrap();
    bob.take_authority(bob_id, &floor).unwrap();

    let before = server.request_count();
    let report = bob.submit_client_changes(bob_id).await.unwrap();
    assert_eq!(report.cleansed_authority, vec![floor.clone()]);
    assert_eq!(report.authority, RequestOutcome::Skipped);
    // Only the stream change went out
    assert_eq!(server.request_count(), before + 1);
}

#[tokio::test]
async fn test_stream_timeout_is_reported() {
    let server = InMemoryServer::new();
    let session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
    let local = session.endpoint_id();
    let manager = manager_for(session);
    manager.join_session().await.unwrap();

    manager
        .add_properties(local, &ObjectPath::new("World:Cube"), "Class", &chains(&["Health"]))
        .unwrap();
    server.fail_next_requests_with_timeout(1);
    assert_eq!(
        manager.submit_client_changes(local).await,
        Err(ReplicationError::Timeout)
    );
    assert!(server.client_state(local).unwrap().streams.is_empty());
}

#[tokio::test]
async fn test_failed_mute_request_is_corrected_by_next_query() {
    let server = InMemoryServer::new();
    let session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
    let manager = manager_for(session);
    manager.join_session().await.unwrap();
    let cube = ObjectPath::new("World:Cube");

    manager
        .mute_objects(&[cube.clone()], MuteSetting::default())
        .unwrap();
    server.fail_next_requests_with_timeout(1);
    manager.flush().await;
    assert!(manager.is_muted(&cube));
    assert!(!server.is_explicitly_muted(&cube));

    // The failure schedules a query for the next tick
    let requests = server.request_count();
    manager.flush().await;
    assert_eq!(server.request_count(), requests + 1);
    assert!(!manager.is_muted(&cube));

    manager.flush().await;
    assert_eq!(server.request_count(), requests + 1);
}

#[tokio::test]
async fn test_mute_request_after_failure_is_sent_on_a_later_tick() {
    let server = InMemoryServer::new();
    let session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
    let manager = manager_for(session);
    manager.join_session().await.unwrap();
    let cube = ObjectPath::new("World:Cube");

    manager
        .mute_objects(&[cube.clone()], MuteSetting::default())
        .unwrap();
    server.fail_next_requests_with_timeout(1);
    manager.flush().await;

    manager
        .mute_objects(&[cube.clone()], MuteSetting::default())
        .unwrap();
    manager.flush().await;
    assert!(server.is_explicitly_muted(&cube));
    assert!(manager.is_muted(&cube));
}

#[tokio::test]
async fn test_duplicate_identity_is_reported_once() {
    let server = InMemoryServer::new();
    let mut events = server.subscribe();
    let notifier = Arc::new(RecordingNotifier::default());
    let session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
    let manager = MultiUserReplicationManager::new(
        session,
        Arc::new(StaticScene::new()),
        notifier.clone(),
        &ReplicationConfig::default(),
    );
    manager.join_session().await.unwrap();

    server.connect(ClientIdentity::new("Alice", "laptop"));
    server.connect(ClientIdentity::new("Alice", "laptop"));
    while let Ok(event) = events.try_recv() {
        manager.handle_session_event(event);
    }
    assert_eq!(notifier.warnings().len(), 1);
}

#[tokio::test]
async fn test_leave_during_join_cancels_it() {
    let server = InMemoryServer::new();
    let session = Arc::new(GatedSession::new(
        server.connect(ClientIdentity::new("Alice", "laptop")),
    ));
    let local = session.local_endpoint_id();
    let join_permits = Arc::clone(&session.join_permits);
    let manager = gated_manager(session, StaticScene::new());

    let join = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.join_session().await }
    });
    while manager.connection_state() != ConnectionState::Joining {
        tokio::task::yield_now().await;
    }
    assert!(manager.leave_session());
    join_permits.add_permits(1);

    assert_eq!(join.await.unwrap(), Err(ReplicationError::Cancelled));
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(server.client_state(local).is_none());
}

#[tokio::test]
async fn test_second_preset_apply_is_rejected_and_leave_cancels_the_first() {
    let server = InMemoryServer::new();
    let session = Arc::new(GatedSession::new(
        server.connect(ClientIdentity::new("Alice", "laptop")),
    ));
    session.join_permits.add_permits(1);
    let put_state_permits = Arc::clone(&session.put_state_permits);
    let scene = StaticScene::new().with_actor("Cube", ObjectPath::new("World:Cube"));
    let manager = gated_manager(session, scene);
    manager.join_session().await.unwrap();

    let preset = MultiUserSessionPreset {
        clients: vec![PresetClient {
            identity: ClientIdentity::new("Alice", "laptop"),
            objects: vec![PresetObject {
                path: LabelObjectPath::actor("Cube"),
                class_path: "Class".to_string(),
                properties: chains(&["Scale"]),
                has_authority: true,
                frequency_override: None,
            }],
            default_frequency: Default::default(),
        }],
        muted_objects: Vec::new(),
        unmuted_objects: Vec::new(),
    };

    let first = tokio::spawn({
        let manager = Arc::clone(&manager);
        let preset = preset.clone();
        async move {
            manager
                .apply_preset(&preset, ApplyPresetFlags::default())
                .await
        }
    });
    while !manager.is_applying_preset() {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        manager
            .apply_preset(&preset, ApplyPresetFlags::default())
            .await,
        Err(PresetError::InProgress)
    );

    assert!(manager.leave_session());
    put_state_permits.add_permits(1);
    assert_eq!(first.await.unwrap(), Err(PresetError::Cancelled));
}

#[tokio::test]
async fn test_rejoin_after_leave_starts_fresh() {
    let server = InMemoryServer::new();
    let session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
    let local = session.endpoint_id();
    let manager = manager_for(session);
    let cube = ObjectPath::new("World:Cube");

    manager.join_session().await.unwrap();
    manager
        .add_properties(local, &cube, "Class", &chains(&["Health"]))
        .unwrap();
    manager.leave_session();
    assert_eq!(
        manager.submit_client_changes(local).await,
        Err(ReplicationError::NotInSession)
    );

    manager.join_session().await.unwrap();
    let pending = manager
        .with_online_clients(|online| online.local_client().has_pending_changes())
        .unwrap();
    assert!(!pending);
}
