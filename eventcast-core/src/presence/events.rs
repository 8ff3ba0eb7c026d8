use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{generate_id, SessionId, SessionStatus, ViewerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Broadcaster,
    Viewer,
}

/// Identity announced on `join-event`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ViewerId,
    pub display_name: String,
    pub role: ParticipantRole,
}

impl Participant {
    pub fn viewer(id: impl Into<ViewerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role: ParticipantRole::Viewer,
        }
    }

    pub fn broadcaster(id: impl Into<ViewerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role: ParticipantRole::Broadcaster,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: SessionId,
    pub sender_id: ViewerId,
    pub sender_name: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(session_id: SessionId, sender: &Participant, text: String) -> Self {
        Self {
            id: generate_id(),
            session_id,
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            text,
            sent_at: Utc::now(),
        }
    }
}

/// Frames sent by clients on the presence channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinEvent {
        session_id: SessionId,
        participant: Participant,
    },
    SendMessage {
        session_id: SessionId,
        text: String,
    },
    Heartbeat,
    LeaveEvent,
}

/// Frames pushed to every subscriber of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ViewerCount {
        session_id: SessionId,
        count: usize,
    },
    NewMessage(ChatMessage),
    /// Sent to a joining client only
    ChatHistory {
        session_id: SessionId,
        messages: Vec<ChatMessage>,
    },
    StreamStatus {
        session_id: SessionId,
        status: SessionStatus,
        is_streaming: bool,
        is_recording: bool,
    },
    /// Per-viewer connection problem, sent to broadcasters only
    ConnectionError {
        session_id: SessionId,
        viewer_id: Option<ViewerId>,
        message: String,
        detail: String,
    },
}

impl ServerEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::ViewerCount { .. } => "viewer-count",
            Self::NewMessage(_) => "new-message",
            Self::ChatHistory { .. } => "chat-history",
            Self::StreamStatus { .. } => "stream-status",
            Self::ConnectionError { .. } => "connection-error",
        }
    }
}
