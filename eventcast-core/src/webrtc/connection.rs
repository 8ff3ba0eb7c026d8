//! Per-viewer connection state

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::PeerConnection;
use crate::models::ViewerId;

/// `idle -> offering -> awaiting-answer -> connected -> closed`
///
/// Any state may move to `closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Idle,
    Offering,
    AwaitingAnswer,
    Connected,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Offering)
                | (Self::Offering, Self::AwaitingAnswer)
                | (Self::AwaitingAnswer, Self::Connected)
                | (Self::Idle | Self::Offering | Self::AwaitingAnswer | Self::Connected, Self::Closed)
        )
    }
}

/// Connected viewer tracked in the [`super::ConnectionRegistry`].
///
/// Each connection carries its own lock so concurrent viewer events never
/// contend on a session-wide lock.
pub struct ViewerConnection {
    pub viewer_id: ViewerId,
    /// Offer revision this viewer answered
    pub revision: u64,
    pub connected_at: DateTime<Utc>,
    peer: Arc<dyn PeerConnection>,
    state: Mutex<ConnectionState>,
}

impl ViewerConnection {
    pub fn connected(viewer_id: ViewerId, revision: u64, peer: Arc<dyn PeerConnection>) -> Self {
        Self {
            viewer_id,
            revision,
            connected_at: Utc::now(),
            peer,
            state: Mutex::new(ConnectionState::Connected),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            debug!(viewer_id = %self.viewer_id, from = ?*state, to = ?next, "Ignoring state change");
            return false;
        }
        *state = next;
        true
    }

    /// Close the underlying peer connection once; later calls are no-ops
    pub async fn close(&self) {
        if !self.transition(ConnectionState::Closed) {
            return;
        }
        self.peer.close().await;
        debug!(viewer_id = %self.viewer_id, revision = self.revision, "Viewer connection closed");
    }
}

impl std::fmt::Debug for ViewerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerConnection")
            .field("viewer_id", &self.viewer_id)
            .field("revision", &self.revision)
            .field("state", &self.state())
            .finish()
    }
}
