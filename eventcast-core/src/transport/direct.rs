use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{BroadcastTransport, PreviewSource, VideoSink};
use crate::config::BroadcastConfig;
use crate::coordinator::BroadcastCoordinator;
use crate::media::{MediaCapture, MediaSource, MediaStream};
use crate::models::{BroadcastSession, SessionId, TransportKind, ViewerId};
use crate::signaling::SignalingRelay;
use crate::webrtc::PeerConnectionFactory;
use crate::{Error, Result};

/// Frames exchanged over the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RendezvousMessage {
    RequestStream {
        peer_id: String,
        viewer_id: ViewerId,
    },
    Stream {
        peer_id: String,
        stream: MediaStream,
    },
    NotReady {
        peer_id: String,
        reason: String,
    },
}

/// Self-hosted peer-to-peer strategy.
///
/// Owns one [`BroadcastCoordinator`] per running session. The room reference
/// is the deterministic peer id `event-{session}-admin`.
pub struct DirectTransport {
    config: Arc<BroadcastConfig>,
    relay: Arc<dyn SignalingRelay>,
    peers: Arc<dyn PeerConnectionFactory>,
    capture: Arc<dyn MediaCapture>,
    coordinators: DashMap<SessionId, Arc<BroadcastCoordinator>>,
}

impl DirectTransport {
    #[must_use]
    pub fn new(
        config: Arc<BroadcastConfig>,
        relay: Arc<dyn SignalingRelay>,
        peers: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
    ) -> Self {
        Self {
            config,
            relay,
            peers,
            capture,
            coordinators: DashMap::new(),
        }
    }

    #[must_use]
    pub fn coordinator(&self, session_id: &SessionId) -> Option<Arc<BroadcastCoordinator>> {
        self.coordinators
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Directly connected viewers of a session, 0 if it is not running
    #[must_use]
    pub fn viewer_count(&self, session_id: &SessionId) -> usize {
        self.coordinator(session_id)
            .map_or(0, |c| c.viewer_count())
    }

    /// Answer a viewer's rendezvous frame.
    ///
    /// A request for a session whose media is not captured yet gets
    /// `NOT_READY` so the viewer can retry.
    pub fn handle_rendezvous(&self, message: RendezvousMessage) -> Result<RendezvousMessage> {
        let RendezvousMessage::RequestStream { peer_id, viewer_id } = message else {
            return Err(Error::InvalidInput(
                "only REQUEST_STREAM is accepted by the broadcaster".to_string(),
            ));
        };

        let session_id = SessionId::from_direct_peer_id(&peer_id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown peer id: {peer_id}")))?;

        let stream = self
            .coordinator(&session_id)
            .and_then(|c| c.local_stream());

        match stream {
            Some(stream) => {
                info!(
                    session_id = %session_id,
                    viewer_id = %viewer_id,
                    stream_id = %stream.id,
                    "Answering stream request"
                );
                Ok(RendezvousMessage::Stream { peer_id, stream })
            }
            None => {
                debug!(session_id = %session_id, viewer_id = %viewer_id, "Stream requested before media is ready");
                Ok(RendezvousMessage::NotReady {
                    peer_id,
                    reason: Error::StreamNotReady(session_id.to_string())
                        .operator_message()
                        .to_string(),
                })
            }
        }
    }

    /// Decode, answer and encode one JSON rendezvous frame
    pub fn handle_rendezvous_frame(&self, frame: &str) -> Result<String> {
        let message: RendezvousMessage = serde_json::from_str(frame)?;
        let reply = self.handle_rendezvous(message)?;
        Ok(serde_json::to_string(&reply)?)
    }
}

#[async_trait]
impl BroadcastTransport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn start(&self, session: &BroadcastSession, source: MediaSource) -> Result<String> {
        let peer_id = session.id.direct_peer_id();

        if let Some(existing) = self.coordinator(&session.id) {
            if !existing.is_stopped() {
                debug!(session_id = %session.id, "Direct broadcast already running");
                return Ok(peer_id);
            }
        }

        let coordinator = BroadcastCoordinator::new(
            session.id.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.relay),
            Arc::clone(&self.peers),
            Arc::clone(&self.capture),
        );
        coordinator.start(source).await?;
        self.coordinators.insert(session.id.clone(), coordinator);

        info!(session_id = %session.id, peer_id = %peer_id, "Direct broadcast started");
        Ok(peer_id)
    }

    async fn stop(&self, session: &BroadcastSession) -> Result<()> {
        let Some((_, coordinator)) = self.coordinators.remove(&session.id) else {
            warn!(session_id = %session.id, "No direct broadcast running to stop");
            return Ok(());
        };

        let closed = coordinator.stop().await;
        info!(session_id = %session.id, closed, "Direct broadcast stopped");
        Ok(())
    }

    fn is_active(&self, session_id: &SessionId) -> bool {
        self.coordinator(session_id)
            .is_some_and(|c| !c.is_stopped())
    }

    fn attach_local_preview(&self, session_id: &SessionId, sink: &dyn VideoSink) -> Result<()> {
        let stream = self
            .coordinator(session_id)
            .and_then(|c| c.local_stream())
            .ok_or_else(|| Error::StreamNotReady(session_id.to_string()))?;
        sink.attach(PreviewSource::Local(stream))
    }
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport")
            .field("sessions", &self.coordinators.len())
            .finish_non_exhaustive()
    }
}
