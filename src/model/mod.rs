//! Value types describing clients and replicated content.
//!
//! Everything in here is plain data with set/map semantics and no dependencies on the rest
//! of the crate.

pub mod hierarchy;
pub mod identity;
pub mod object_path;
pub mod property_chain;
pub mod stream;

pub use hierarchy::ObjectHierarchy;
pub use identity::{ClientIdentity, EndpointId, are_logically_same_clients};
pub use object_path::ObjectPath;
pub use property_chain::{InvalidPropertyChain, PropertyChain};
pub use stream::{
    FrequencySettings, MULTI_USER_STREAM_ID, ObjectFrequency, ObjectReplicationMap,
    ReplicatedObjectInfo, ReplicationMode, StreamDescription, StreamId, StreamIdSet,
    find_multi_user_stream,
};
