use thiserror::Error;

use crate::media::MediaError;
use crate::models::SessionStatus;
use crate::webrtc::PeerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid transition: cannot {action} a session in {from} state")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    #[error("Transport locked: cannot switch transport while the session is live")]
    TransportLocked,

    #[error("Signaling conflict: {0}")]
    SignalingConflict(String),

    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),

    #[error("Peer connection failed for {peer}: {reason}")]
    PeerConnectionFailed { peer: String, reason: String },

    #[error("Session has ended")]
    SessionEnded,

    #[error("Stream not ready: {0}")]
    StreamNotReady(String),

    #[error("Hosted room error: {0}")]
    HostedRoom(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn peer(peer: impl Into<String>, err: PeerError) -> Self {
        Self::PeerConnectionFailed {
            peer: peer.into(),
            reason: err.to_string(),
        }
    }

    /// Short label shown to the operator for each failure kind.
    #[must_use]
    pub fn operator_message(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "action not allowed in the current broadcast state",
            Self::TransportLocked => "transport cannot be changed while live",
            Self::SignalingConflict(_) => "stale signaling message ignored",
            Self::MediaAcquisitionFailed(MediaError::PermissionDenied(_)) => "camera access error",
            Self::MediaAcquisitionFailed(MediaError::DeviceUnavailable(_)) => "capture device unavailable",
            Self::PeerConnectionFailed { .. } => "viewer connection failed",
            Self::SessionEnded => "broadcast has ended",
            Self::StreamNotReady(_) => "stream not ready",
            Self::HostedRoom(_) => "hosted room unavailable",
            Self::NotFound(_) => "broadcast not found",
            Self::InvalidInput(_) => "invalid request",
            Self::Serialization(_) | Self::Internal(_) => "internal error",
        }
    }

    /// Whether the failure only concerns a single viewer.
    #[must_use]
    pub const fn is_per_viewer(&self) -> bool {
        matches!(
            self,
            Self::PeerConnectionFailed { .. } | Self::SignalingConflict(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_messages_are_distinct_per_kind() {
        let denied = Error::from(MediaError::PermissionDenied("camera".to_string()));
        let not_ready = Error::StreamNotReady("event-abc-admin".to_string());

        assert_eq!(denied.operator_message(), "camera access error");
        assert_eq!(not_ready.operator_message(), "stream not ready");
        assert_ne!(denied.operator_message(), not_ready.operator_message());
    }

    #[test]
    fn test_per_viewer_classification() {
        let failed = Error::peer("viewer-1", PeerError::IceFailed);
        assert!(failed.is_per_viewer());
        assert!(failed.to_string().contains("viewer-1"));

        assert!(!Error::SessionEnded.is_per_viewer());
        assert!(!Error::TransportLocked.is_per_viewer());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::InvalidTransition {
            from: SessionStatus::Ended,
            action: "start",
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: cannot start a session in ended state"
        );
    }
}
