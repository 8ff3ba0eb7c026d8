//! Signaling mailbox message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ViewerId;

/// Sender tag used by the broadcaster's offers
pub const BROADCASTER_SENDER: &str = "broadcaster";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Content of the session mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sdp: String,
    pub sender: String,
    /// Offer revision; answers echo the revision they respond to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    pub sent_at: DateTime<Utc>,
}

impl SignalMessage {
    #[must_use]
    pub fn offer(sdp: impl Into<String>, revision: u64) -> Self {
        Self {
            kind: SignalKind::Offer,
            sdp: sdp.into(),
            sender: BROADCASTER_SENDER.to_string(),
            revision: Some(revision),
            sent_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn answer(viewer: &ViewerId, sdp: impl Into<String>, revision: Option<u64>) -> Self {
        Self {
            kind: SignalKind::Answer,
            sdp: sdp.into(),
            sender: viewer.as_str().to_string(),
            revision,
            sent_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_offer(&self) -> bool {
        self.kind == SignalKind::Offer
    }

    #[must_use]
    pub fn is_answer(&self) -> bool {
        self.kind == SignalKind::Answer
    }
}
