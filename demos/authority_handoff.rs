//! Several clients working on one level at the same time.
//!
//! Shows a racing authority request being rejected by the server, an explicit handoff of
//! properties between clients, session-wide muting, and saving the whole setup as a preset
//! that is applied again after everything was cleared.
//!
//! Run with: cargo run --example authority_handoff

use std::collections::BTreeSet;
use std::sync::Arc;

use multi_user_replication::protocol::MuteSetting;
use multi_user_replication::{
    ApplyPresetFlags, ClientIdentity, InMemoryServer, MultiUserReplicationManager, ObjectPath,
    PropertyChain, ReplicationConfig, StaticScene, TracingNotifier,
};

fn chains(paths: &[&str]) -> BTreeSet<PropertyChain> {
    paths.iter().map(|p| PropertyChain::from_path(p)).collect()
}

fn scene() -> Arc<StaticScene> {
    Arc::new(
        StaticScene::new()
            .with_actor("Floor", ObjectPath::new("World:FloorActor"))
            .with_actor("Lamp", ObjectPath::new("World:LampActor")),
    )
}

async fn join(server: &InMemoryServer, name: &str) -> MultiUserReplicationManager {
    let session = server.connect(ClientIdentity::new(name, "example"));
    let manager = MultiUserReplicationManager::new(
        Arc::new(session),
        scene(),
        Arc::new(TracingNotifier),
        &ReplicationConfig::default(),
    );
    manager.join_session().await.unwrap();
    manager
}

fn print_authority(manager: &MultiUserReplicationManager, object: &ObjectPath) {
    for summary in manager.client_summaries() {
        let Some(endpoint_id) = summary.endpoint_id else {
            continue;
        };
        let owns = manager
            .authority_by_client()
            .get(&endpoint_id)
            .is_some_and(|authority| authority.contains_key(object));
        println!("  {:<8} owns {object}: {owns}", summary.identity.display_name);
    }
}

#[tokio::main]
async fn main() {
    println!("=== Authority Handoff Example ===\n");

    let server = InMemoryServer::new();
    let alice = join(&server, "Alice").await;
    let bob = join(&server, "Bob").await;
    let carol = join(&server, "Carol").await;
    let lamp = ObjectPath::new("World:LampActor");

    println!("--- Alice and Bob both grab the lamp before seeing each other ---");
    let (alice_id, bob_id) = (alice.local_endpoint_id(), bob.local_endpoint_id());
    alice
        .add_properties(alice_id, &lamp, "PointLight", &chains(&["Intensity"]))
        .unwrap();
    alice.take_authority(alice_id, &lamp).unwrap();
    bob.add_properties(bob_id, &lamp, "PointLight", &chains(&["Intensity", "LightColor"]))
        .unwrap();
    bob.take_authority(bob_id, &lamp).unwrap();

    let (alice_report, bob_report) = tokio::join!(
        alice.submit_client_changes(alice_id),
        bob.submit_client_changes(bob_id)
    );
    let alice_report = alice_report.unwrap();
    let bob_report = bob_report.unwrap();
    println!(
        "  Alice: authority {:?}, rejected {:?}",
        alice_report.authority,
        alice_report.rejected_authority.keys().collect::<Vec<_>>()
    );
    println!(
        "  Bob:   authority {:?}, rejected {:?}",
        bob_report.authority,
        bob_report.rejected_authority.keys().collect::<Vec<_>>()
    );

    carol.refresh_all_clients().await.unwrap();
    println!("\nCarol's view:");
    print_authority(&carol, &lamp);

    println!("\n--- Carol hands the lamp's intensity to herself ---");
    let carol_id = carol.local_endpoint_id();
    carol
        .reassign_properties(&lamp, "PointLight", &chains(&["Intensity"]), carol_id)
        .await
        .unwrap();
    print_authority(&carol, &lamp);

    println!("\n--- Carol mutes the lamp for everyone ---");
    carol
        .mute_objects(&[lamp.clone()], MuteSetting::default())
        .unwrap();
    carol.flush().await;
    println!("  muted on the server: {}", server.is_explicitly_muted(&lamp));

    println!("\n--- Saving the session as a preset ---");
    let preset = carol.export_preset(&|_| true).unwrap();
    let json = preset.to_json().unwrap();
    println!("  preset is {} bytes of JSON", json.len());

    carol
        .unmute_objects(&[lamp.clone()], MuteSetting::default())
        .unwrap();
    carol.flush().await;
    carol
        .remove_properties(carol_id, &lamp, &chains(&["Intensity"]))
        .unwrap();
    carol.submit_client_changes(carol_id).await.unwrap();
    println!("  after clearing, muted: {}", server.is_explicitly_muted(&lamp));

    println!("\n--- Applying the preset again ---");
    let restored = multi_user_replication::MultiUserSessionPreset::from_json(&json).unwrap();
    carol
        .apply_preset(&restored, ApplyPresetFlags::default())
        .await
        .unwrap();
    carol.refresh_all_clients().await.unwrap();
    println!("  muted: {}", server.is_explicitly_muted(&lamp));
    print_authority(&carol, &lamp);
}
