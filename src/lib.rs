//! # Multi-User Replication
//!
//! The client-side coordination core of a collaborative editing session in which several
//! clients replicate properties of shared world objects.
//!
//! ## Features
//!
//! - **Stream and authority tracking**: every client's registered properties and owned objects,
//!   confirmed by the server, with local edits kept apart until they are submitted
//! - **Conflict rules**: overlapping or ancestor-related properties can only be owned by one
//!   client at a time; requests are cleansed before they are sent
//! - **Offline clients**: clients known from the activity log, with a prediction of what they
//!   get back when they rejoin
//! - **Mute state and presets**: session-wide muting and saved replication setups
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! use multi_user_replication::{
//!     ClientIdentity, InMemoryServer, MultiUserReplicationManager, ObjectPath, PropertyChain,
//!     ReplicationConfig, StaticScene, TracingNotifier,
//! };
//!
//! # tokio_test_main();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test_main() {
//! let server = InMemoryServer::new();
//! let session = Arc::new(server.connect(ClientIdentity::new("Alice", "laptop")));
//! let manager = MultiUserReplicationManager::new(
//!     session,
//!     Arc::new(StaticScene::new()),
//!     Arc::new(TracingNotifier),
//!     &ReplicationConfig::default(),
//! );
//! manager.join_session().await.unwrap();
//!
//! let local = manager.local_endpoint_id();
//! let cube = ObjectPath::new("World:Cube");
//! let properties: BTreeSet<_> = [PropertyChain::from_path("RelativeLocation")].into();
//! manager.add_properties(local, &cube, "StaticMeshActor", &properties).unwrap();
//! manager.take_authority(local, &cube).unwrap();
//! let report = manager.submit_client_changes(local).await.unwrap();
//! assert!(report.is_fully_accepted());
//! # }
//! ```

pub mod authority;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod model;
pub mod mute;
pub mod notify;
pub mod offline;
pub mod preset;
pub mod protocol;
pub mod server;
pub mod session;
pub mod unified;

pub use authority::{AuthorityConflict, GlobalAuthorityCache, TakeAuthorityVerdict};
pub use client::{OnlineClient, OnlineClientManager, RequestOutcome, SubmissionReport};
pub use config::{ConfigError, ReplicationConfig};
pub use error::{PresetError, ReplicationError, TransportError};
pub use events::{EventBus, ReplicationEvent};
pub use manager::{AuthorityOverview, ConnectionState, MultiUserReplicationManager, UnifiedClientId};
pub use model::{
    ClientIdentity, EndpointId, MULTI_USER_STREAM_ID, ObjectPath, PropertyChain, StreamDescription,
    StreamId,
};
pub use notify::{Notifier, RecordingNotifier, TracingNotifier};
pub use offline::{OfflineClient, OfflineClientManager};
pub use preset::{ApplyPresetFlags, MultiUserSessionPreset, SceneResolver, StaticScene};
pub use session::memory::{InMemoryServer, InMemorySession};
pub use session::{ActivityLog, ReplicationSession, SessionEvent};
pub use unified::{ClientSummary, ClientType, OfflineSkipMode};
