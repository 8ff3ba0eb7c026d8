use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::{BroadcastTransport, PreviewSource, VideoSink};
use crate::media::MediaSource;
use crate::models::{BroadcastSession, SessionId, TransportKind};
use crate::{Error, Result};

/// External conferencing service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostedRoomProvider: Send + Sync {
    /// Allocate a room and return its URL
    async fn create_room(&self) -> Result<String>;

    async fn destroy_room(&self, url: &str) -> Result<()>;
}

/// Delegates media to a hosted room; no mailbox signaling is involved
pub struct HostedTransport {
    provider: Arc<dyn HostedRoomProvider>,
    rooms: DashMap<SessionId, String>,
}

impl HostedTransport {
    #[must_use]
    pub fn new(provider: Arc<dyn HostedRoomProvider>) -> Self {
        Self {
            provider,
            rooms: DashMap::new(),
        }
    }

    #[must_use]
    pub fn room_url(&self, session_id: &SessionId) -> Option<String> {
        self.rooms.get(session_id).map(|r| r.value().clone())
    }
}

/// Accept only http(s) room urls. The provider's string is kept as returned.
fn validate_room_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| Error::HostedRoom(format!("invalid room url {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::HostedRoom(format!(
            "room url must be http(s), got {}",
            url.scheme()
        )));
    }
    Ok(())
}

#[async_trait]
impl BroadcastTransport for HostedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Hosted
    }

    async fn start(&self, session: &BroadcastSession, _source: MediaSource) -> Result<String> {
        if let Some(url) = self.room_url(&session.id) {
            return Ok(url);
        }

        let raw = self.provider.create_room().await?;
        if let Err(err) = validate_room_url(&raw) {
            if let Err(cleanup) = self.provider.destroy_room(&raw).await {
                warn!(session_id = %session.id, error = %cleanup, "Failed to destroy rejected room");
            }
            return Err(err);
        }

        self.rooms.insert(session.id.clone(), raw.clone());
        info!(session_id = %session.id, room_url = %raw, "Hosted room created");
        Ok(raw)
    }

    async fn stop(&self, session: &BroadcastSession) -> Result<()> {
        let url = self
            .rooms
            .remove(&session.id)
            .map(|(_, url)| url)
            .or_else(|| session.room_reference.clone());

        let Some(url) = url else {
            return Ok(());
        };

        self.provider.destroy_room(&url).await?;
        info!(session_id = %session.id, room_url = %url, "Hosted room destroyed");
        Ok(())
    }

    fn is_active(&self, session_id: &SessionId) -> bool {
        self.rooms.contains_key(session_id)
    }

    fn attach_local_preview(&self, session_id: &SessionId, sink: &dyn VideoSink) -> Result<()> {
        let url = self
            .room_url(session_id)
            .ok_or_else(|| Error::StreamNotReady(session_id.to_string()))?;
        sink.attach(PreviewSource::Room(url))
    }
}

impl std::fmt::Debug for HostedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedTransport")
            .field("rooms", &self.rooms.len())
            .finish_non_exhaustive()
    }
}
