//! Peer connection abstraction
//!
//! The browser-native peer connection is an opaque capability. The
//! coordinator drives it through [`PeerConnection`] so tests can simulate ICE
//! completion and answer delivery deterministically.

pub mod connection;
pub mod registry;

pub use connection::{ConnectionState, ViewerConnection};
pub use registry::ConnectionRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::media::MediaTrack;
use crate::models::{SignalKind, SignalMessage};

/// ICE server configuration handed to new peer connections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

impl From<&SignalMessage> for SessionDescription {
    fn from(message: &SignalMessage) -> Self {
        match message.kind {
            SignalKind::Offer => Self::offer(message.sdp.clone()),
            SignalKind::Answer => Self::answer(message.sdp.clone()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("ICE negotiation failed")]
    IceFailed,

    #[error("ICE gathering did not complete in time")]
    IceGatheringTimeout,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("connection closed")]
    Closed,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Resolves once ICE gathering reached "complete"
    async fn ice_gathering_complete(&self) -> Result<(), PeerError>;

    /// Local description including every gathered candidate
    fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, ice: &IceServerConfig) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ViewerId;

    #[test]
    fn test_description_from_signal() {
        let offer = SignalMessage::offer("v=0 o", 1);
        let answer = SignalMessage::answer(&ViewerId::from("v"), "v=0 a", Some(1));

        assert_eq!(SessionDescription::from(&offer).sdp_type, SdpType::Offer);
        let desc = SessionDescription::from(&answer);
        assert_eq!(desc.sdp_type, SdpType::Answer);
        assert_eq!(desc.sdp, "v=0 a");
    }

    #[test]
    fn test_session_description_serialization() {
        let desc = SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n");

        let json = serde_json::to_string(&desc).unwrap();
        let deserialized: SessionDescription = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, desc);
        assert!(json.contains("\"offer\""));
    }
}
