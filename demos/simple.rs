//! Simple standalone example of two clients sharing an actor.
//!
//! Alice registers the floor's location and takes authority over it. Bob then tries to
//! replicate the same property, is stopped by the conflict rules, and finally leaves, after
//! which Alice still sees him as an offline client.
//!
//! Run with: cargo run --example simple

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast;

use multi_user_replication::{
    ClientIdentity, InMemoryServer, MultiUserReplicationManager, ObjectPath, PropertyChain,
    ReplicationConfig, SessionEvent, StaticScene, TracingNotifier,
};

fn new_manager(server: &InMemoryServer, name: &str) -> MultiUserReplicationManager {
    let session = server.connect(ClientIdentity::new(name, "example"));
    MultiUserReplicationManager::new(
        Arc::new(session),
        Arc::new(StaticScene::new()),
        Arc::new(TracingNotifier),
        &ReplicationConfig::default(),
    )
}

/// Delivers every queued session notification and runs the deferred work.
async fn sync(manager: &MultiUserReplicationManager, events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        manager.handle_session_event(event);
    }
    manager.flush().await;
}

#[tokio::main]
async fn main() {
    println!("=== Simple Multi-User Replication Example ===\n");

    let server = InMemoryServer::new();
    let mut alice_events = server.subscribe();
    let alice = new_manager(&server, "Alice");
    alice.join_session().await.unwrap();

    let bob = new_manager(&server, "Bob");
    bob.join_session().await.unwrap();
    sync(&alice, &mut alice_events).await;

    let floor = ObjectPath::new("World:FloorActor");
    let location: BTreeSet<PropertyChain> = [PropertyChain::from_path("RelativeLocation")].into();

    println!("Alice replicates the floor's location and takes authority:");
    let alice_id = alice.local_endpoint_id();
    alice
        .add_properties(alice_id, &floor, "StaticMeshActor", &location)
        .unwrap();
    alice.take_authority(alice_id, &floor).unwrap();
    let report = alice.submit_client_changes(alice_id).await.unwrap();
    println!("  stream: {:?}, authority: {:?}", report.stream, report.authority);

    println!("\nBob wants to move the floor too:");
    bob.refresh_all_clients().await.unwrap();
    let bob_id = bob.local_endpoint_id();
    let x = PropertyChain::from_path("RelativeLocation.X");
    let allowed = bob
        .with_online_clients(|online| online.can_client_add_property(&floor, bob_id, &x))
        .unwrap_or(false);
    println!("  may Bob replicate RelativeLocation.X? {allowed}");

    let overlapping: BTreeSet<PropertyChain> = [x].into();
    bob.add_properties(bob_id, &floor, "StaticMeshActor", &overlapping)
        .unwrap();
    bob.take_authority(bob_id, &floor).unwrap();
    let report = bob.submit_client_changes(bob_id).await.unwrap();
    println!(
        "  authority: {:?}, dropped before sending: {:?}",
        report.authority, report.cleansed_authority
    );

    if let Some(overview) = alice.authority_overview(&floor) {
        println!("\n--- Who replicates {floor} ---");
        println!("  in stream:      {:?}", overview.in_stream);
        println!("  with authority: {:?}", overview.with_authority);
    }

    println!("\n--- Bob leaves ---");
    drop(bob);
    server.disconnect(bob_id);
    sync(&alice, &mut alice_events).await;

    for summary in alice.client_summaries() {
        println!(
            "  {} ({:?}): {} objects, {} owned",
            summary.identity, summary.client_type, summary.object_count, summary.authority_count
        );
    }
}
