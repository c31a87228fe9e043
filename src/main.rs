//! Demo binary: runs an in-process session with a local and a remote client and serves the
//! local client's replication state over HTTP.
//!
//! Usage: `multi-user-replication [config.toml]`

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use multi_user_replication::server::create_router;
use multi_user_replication::{
    ClientIdentity, InMemoryServer, MultiUserReplicationManager, ObjectPath, PropertyChain,
    ReplicationConfig, StaticScene, TracingNotifier,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ReplicationConfig::from_file(&path)?,
        None => ReplicationConfig::default(),
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Multi-User replication demo...");

    let server = InMemoryServer::new();
    let scene = Arc::new(
        StaticScene::new()
            .with_actor("Floor", ObjectPath::new("World:FloorActor"))
            .with_object(ObjectPath::new("World:FloorActor.StaticMeshComponent0")),
    );
    let session = Arc::new(server.connect(config.local_identity.identity()));
    let manager = Arc::new(MultiUserReplicationManager::new(
        session,
        scene,
        Arc::new(TracingNotifier),
        &config,
    ));
    let event_loop = manager.spawn_session_event_loop(server.subscribe());

    manager
        .join_session()
        .await
        .context("Failed to join the replication session")?;
    seed_demo_content(&server, &manager).await?;

    let ticker = {
        let manager = Arc::downgrade(&manager);
        let interval = Duration::from_millis(config.tick_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.tick();
            }
        })
    };

    if config.introspection.enabled {
        let addr: SocketAddr = format!("{}:{}", config.introspection.host, config.introspection.port)
            .parse()
            .context("Invalid introspection address")?;
        info!("Server listening on http://{}", addr);
        info!("Available endpoints:");
        info!("  GET  /health                     - Health check");
        info!("  GET  /clients                    - Online and offline clients");
        info!("  GET  /authority?object=<path>    - Who registered and owns an object");
        info!("  GET  /authority/clients          - Authority of every online client");
        info!("  GET  /objects/clients?object=... - Online and offline clients of an object");
        info!("  GET  /mute?object=<path>         - Whether an object is muted");
        info!("Try: curl 'http://{}/authority?object=World:FloorActor'", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let app = create_router(Arc::clone(&manager));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Introspection server failed")?;
    } else {
        shutdown_signal().await;
    }

    manager.leave_session();
    ticker.abort();
    event_loop.abort();
    info!("Shut down");
    Ok(())
}

/// Lets a second client own part of the floor and leave, so the demo has an offline client.
async fn seed_demo_content(
    server: &InMemoryServer,
    manager: &MultiUserReplicationManager,
) -> Result<()> {
    let floor = ObjectPath::new("World:FloorActor");
    let location: BTreeSet<PropertyChain> = [PropertyChain::from_path("RelativeLocation")].into();

    let remote = server.connect(ClientIdentity::new("Bob", "workstation"));
    let remote_manager = MultiUserReplicationManager::new(
        Arc::new(remote.clone()),
        Arc::new(StaticScene::new()),
        Arc::new(TracingNotifier),
        &ReplicationConfig::default(),
    );
    remote_manager.join_session().await?;
    let bob = remote.endpoint_id();
    remote_manager.add_properties(bob, &floor, "StaticMeshActor", &location)?;
    remote_manager.take_authority(bob, &floor)?;
    remote_manager.submit_client_changes(bob).await?;
    drop(remote_manager);
    server.disconnect(bob);

    let local = manager.local_endpoint_id();
    let scale: BTreeSet<PropertyChain> = [PropertyChain::from_path("RelativeScale3D")].into();
    manager.add_properties(local, &floor, "StaticMeshActor", &scale)?;
    manager.take_authority(local, &floor)?;
    let report = manager.submit_client_changes(local).await?;
    if !report.is_fully_accepted() {
        warn!(?report, "Demo content was not fully accepted");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "Failed to listen for ctrl-c");
    }
}
