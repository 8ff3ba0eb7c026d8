use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{SessionId, SignalMessage};

/// Broadcast session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Draft,
    Published,
    Live,
    Ended,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport strategy used to carry the broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Self-hosted peer-to-peer with a rendezvous server
    #[default]
    Direct,
    /// Third-party conferencing room
    Hosted,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Hosted => f.write_str("hosted"),
        }
    }
}

/// One row of the session store.
///
/// Viewer count is not persisted; it is derived from presence subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastSession {
    pub id: SessionId,
    pub status: SessionStatus,
    pub is_streaming: bool,
    pub is_recording: bool,
    pub transport: TransportKind,
    /// Direct peer id or hosted room URL, present while streaming
    pub room_reference: Option<String>,
    /// Single signaling slot, last writer wins
    pub mailbox: Option<SignalMessage>,
    pub updated_at: DateTime<Utc>,
}

impl BroadcastSession {
    /// Create a draft session, as the CRUD layer does
    #[must_use]
    pub fn new(id: SessionId, transport: TransportKind) -> Self {
        Self {
            id,
            status: SessionStatus::Draft,
            is_streaming: false,
            is_recording: false,
            transport,
            room_reference: None,
            mailbox: None,
            updated_at: Utc::now(),
        }
    }

    /// `is_streaming` implies live, `is_recording` implies streaming, and a
    /// room reference only exists while streaming.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        (!self.is_streaming || self.status == SessionStatus::Live)
            && (!self.is_recording || self.is_streaming)
            && (self.room_reference.is_none() || self.is_streaming)
    }
}

/// Partial update applied by [`crate::store::SessionStore::update`].
///
/// Nullable fields use `Option<Option<_>>`: `Some(None)` clears the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub is_streaming: Option<bool>,
    pub is_recording: Option<bool>,
    pub transport: Option<TransportKind>,
    pub room_reference: Option<Option<String>>,
    pub mailbox: Option<Option<SignalMessage>>,
}

impl SessionPatch {
    #[must_use]
    pub fn mailbox(message: Option<SignalMessage>) -> Self {
        Self {
            mailbox: Some(message),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(self, session: &mut BroadcastSession) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(streaming) = self.is_streaming {
            session.is_streaming = streaming;
        }
        if let Some(recording) = self.is_recording {
            session.is_recording = recording;
        }
        if let Some(transport) = self.transport {
            session.transport = transport;
        }
        if let Some(room_reference) = self.room_reference {
            session.room_reference = room_reference;
        }
        if let Some(mailbox) = self.mailbox {
            session.mailbox = mailbox;
        }
        session.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_draft() {
        let session = BroadcastSession::new(SessionId::from("s1"), TransportKind::Hosted);

        assert_eq!(session.status, SessionStatus::Draft);
        assert!(!session.is_streaming);
        assert!(session.room_reference.is_none());
        assert!(session.invariants_hold());
    }

    #[test]
    fn test_invariants_detect_streaming_outside_live() {
        let mut session = BroadcastSession::new(SessionId::from("s1"), TransportKind::Direct);
        session.is_streaming = true;
        assert!(!session.invariants_hold());

        session.status = SessionStatus::Live;
        assert!(session.invariants_hold());

        session.is_streaming = false;
        session.is_recording = true;
        assert!(!session.invariants_hold());
    }

    #[test]
    fn test_patch_clears_nullable_fields() {
        let mut session = BroadcastSession::new(SessionId::from("s1"), TransportKind::Direct);
        session.room_reference = Some("event-s1-admin".to_string());
        session.mailbox = Some(SignalMessage::offer("v=0", 1));

        SessionPatch {
            room_reference: Some(None),
            mailbox: Some(None),
            ..Default::default()
        }
        .apply(&mut session);

        assert!(session.room_reference.is_none());
        assert!(session.mailbox.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Published).unwrap();
        assert_eq!(json, "\"published\"");

        let kind: TransportKind = serde_json::from_str("\"hosted\"").unwrap();
        assert_eq!(kind, TransportKind::Hosted);
    }
}
