//! Error types of the replication client.
//!
//! Conflict rejections are not errors: they are reported per object in responses. The
//! variants here cover transport failures, precondition violations and cancellation.

use thiserror::Error;

use crate::model::EndpointId;
use crate::protocol::PutStateResponseCode;

/// Failure of the underlying session transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("session disconnected while the request was in flight")]
    Disconnected,
}

/// The main error enum of the client core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("request timed out")]
    Timeout,

    #[error("session disconnected")]
    Disconnected,

    #[error("operation was cancelled because the session was left")]
    Cancelled,

    #[error("not in a replication session")]
    NotInSession,

    #[error("already in a replication session or joining one")]
    AlreadyInSession,

    #[error("the server rejected the join: {0}")]
    JoinRejected(String),

    #[error("unknown client {0}")]
    UnknownClient(EndpointId),

    #[error("request rejected by the server: {0}")]
    Rejected(String),

    #[error("replication is disabled on the server")]
    FeatureDisabled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a request of this kind is already in flight")]
    InProgress,
}

impl From<TransportError> for ReplicationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ReplicationError::Timeout,
            TransportError::Disconnected => ReplicationError::Disconnected,
        }
    }
}

impl ReplicationError {
    /// Maps a put-state response code to the outward-facing result.
    ///
    /// Timeout and feature-disabled are surfaced as themselves; every other failure becomes
    /// `Rejected`.
    pub fn from_put_state_code(code: PutStateResponseCode) -> Result<(), ReplicationError> {
        match code {
            PutStateResponseCode::Success => Ok(()),
            PutStateResponseCode::Timeout => Err(ReplicationError::Timeout),
            PutStateResponseCode::FeatureDisabled => Err(ReplicationError::FeatureDisabled),
            other => Err(ReplicationError::Rejected(format!("{other:?}"))),
        }
    }
}

/// Failures of preset export and apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresetError {
    #[error("no client passed the export filter")]
    NoClients,

    #[error("none of the preset's objects exist in the current world")]
    NoObjectsFound,

    #[error("a preset is already being applied")]
    InProgress,

    #[error("not in a replication session")]
    NotInSession,

    #[error("request timed out")]
    Timeout,

    #[error("replication is disabled on the server")]
    FeatureDisabled,

    #[error("the server rejected the preset")]
    Rejected,

    #[error("preset apply was cancelled because the session was left")]
    Cancelled,

    #[error("preset could not be (de)serialized: {0}")]
    Serialization(String),
}

impl From<ReplicationError> for PresetError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Timeout => PresetError::Timeout,
            ReplicationError::FeatureDisabled => PresetError::FeatureDisabled,
            ReplicationError::Cancelled | ReplicationError::Disconnected => PresetError::Cancelled,
            ReplicationError::NotInSession => PresetError::NotInSession,
            ReplicationError::InProgress => PresetError::InProgress,
            _ => PresetError::Rejected,
        }
    }
}

impl From<serde_json::Error> for PresetError {
    fn from(err: serde_json::Error) -> Self {
        PresetError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_state_codes_collapse_to_rejected() {
        assert_eq!(
            ReplicationError::from_put_state_code(PutStateResponseCode::Success),
            Ok(())
        );
        assert_eq!(
            ReplicationError::from_put_state_code(PutStateResponseCode::Timeout),
            Err(ReplicationError::Timeout)
        );
        assert_eq!(
            ReplicationError::from_put_state_code(PutStateResponseCode::FeatureDisabled),
            Err(ReplicationError::FeatureDisabled)
        );
        for code in [
            PutStateResponseCode::ClientUnknown,
            PutStateResponseCode::StreamError,
            PutStateResponseCode::AuthorityConflict,
            PutStateResponseCode::MuteError,
        ] {
            assert!(matches!(
                ReplicationError::from_put_state_code(code),
                Err(ReplicationError::Rejected(_))
            ));
        }
    }
}
