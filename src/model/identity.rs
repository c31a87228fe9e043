//! Client identity types.
//!
//! This module contains the transient [`EndpointId`] assigned to every connection and the
//! stable [`ClientIdentity`] used to recognise the same person across reconnects.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A transient identifier assigned to one connection of a client.
///
/// Every join produces a new endpoint id, so it must never be used as a long-term key for a
/// person. Endpoint ids are never reused within a session, which makes them safe handles:
/// a lookup with an expired id simply finds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a fresh random endpoint id.
    pub fn new_v4() -> Self {
        EndpointId(Uuid::new_v4())
    }

    /// Builds a deterministic endpoint id, handy for fixtures.
    pub fn from_u128(value: u128) -> Self {
        EndpointId(Uuid::from_u128(value))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The logically stable identity of a client.
///
/// Two identities describe the same client iff both the display name and the device name
/// match exactly (case-sensitive).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Name the user chose for themselves
    pub display_name: String,
    /// Name of the machine the user connected from
    pub device_name: String,
}

impl ClientIdentity {
    pub fn new(display_name: impl Into<String>, device_name: impl Into<String>) -> Self {
        ClientIdentity {
            display_name: display_name.into(),
            device_name: device_name.into(),
        }
    }

    /// Returns true if both identities denote the same client.
    pub fn is_same_client(&self, other: &ClientIdentity) -> bool {
        are_logically_same_clients(self, other)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.device_name)
    }
}

/// The identity rule used everywhere a reconnecting client has to be recognised.
pub fn are_logically_same_clients(left: &ClientIdentity, right: &ClientIdentity) -> bool {
    left.display_name == right.display_name && left.device_name == right.device_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_client_requires_both_names() {
        let alice = ClientIdentity::new("Alice", "DeviceA");

        assert!(alice.is_same_client(&ClientIdentity::new("Alice", "DeviceA")));
        assert!(!alice.is_same_client(&ClientIdentity::new("Alice", "DeviceB")));
        assert!(!alice.is_same_client(&ClientIdentity::new("Bob", "DeviceA")));
    }

    #[test]
    fn test_identity_is_case_sensitive() {
        let alice = ClientIdentity::new("Alice", "DeviceA");
        assert!(!alice.is_same_client(&ClientIdentity::new("alice", "DeviceA")));
    }

    #[test]
    fn test_endpoint_ids_are_unique() {
        assert_ne!(EndpointId::new_v4(), EndpointId::new_v4());
        assert_eq!(EndpointId::from_u128(7), EndpointId::from_u128(7));
    }
}
