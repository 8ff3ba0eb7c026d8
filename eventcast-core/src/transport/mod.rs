//! Transport strategies
//!
//! Both strategies satisfy the same session-control contract so the service
//! can drive a broadcast without knowing how media reaches viewers.

mod direct;
mod hosted;

pub use direct::{DirectTransport, RendezvousMessage};
pub use hosted::{HostedRoomProvider, HostedTransport};

#[cfg(test)]
pub use hosted::MockHostedRoomProvider;

use async_trait::async_trait;
use std::sync::Arc;

use crate::media::{MediaSource, MediaStream};
use crate::models::{BroadcastSession, SessionId, TransportKind};
use crate::Result;

/// What a local preview renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewSource {
    /// The broadcaster's own captured stream (Direct)
    Local(MediaStream),
    /// The hosted room the broadcaster joined (Hosted)
    Room(String),
}

/// Operator-side video element
pub trait VideoSink: Send + Sync {
    fn attach(&self, source: PreviewSource) -> Result<()>;
}

#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begin transmitting and return the room reference viewers discover.
    /// Starting an already running session returns its current reference.
    async fn start(&self, session: &BroadcastSession, source: MediaSource) -> Result<String>;

    /// Tear down everything started for the session
    async fn stop(&self, session: &BroadcastSession) -> Result<()>;

    /// Whether this process is currently transmitting for the session
    fn is_active(&self, session_id: &SessionId) -> bool;

    fn attach_local_preview(&self, session_id: &SessionId, sink: &dyn VideoSink) -> Result<()>;
}

/// Picks the strategy configured on a session
#[derive(Clone)]
pub struct TransportSelector {
    direct: Arc<DirectTransport>,
    hosted: Arc<HostedTransport>,
}

impl TransportSelector {
    #[must_use]
    pub fn new(direct: Arc<DirectTransport>, hosted: Arc<HostedTransport>) -> Self {
        Self { direct, hosted }
    }

    #[must_use]
    pub fn select(&self, kind: TransportKind) -> Arc<dyn BroadcastTransport> {
        match kind {
            TransportKind::Direct => self.direct.clone(),
            TransportKind::Hosted => self.hosted.clone(),
        }
    }

    #[must_use]
    pub fn direct(&self) -> &Arc<DirectTransport> {
        &self.direct
    }

    #[must_use]
    pub fn hosted(&self) -> &Arc<HostedTransport> {
        &self.hosted
    }
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector").finish_non_exhaustive()
    }
}
