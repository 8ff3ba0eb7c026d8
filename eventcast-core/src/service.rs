//! Admin-facing broadcast operations
//!
//! Every operation on a session runs under that session's lock: the state
//! machine plans a patch, transport side effects run, and only then is the
//! patch persisted. Sessions never block each other.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::CoordinatorEvent;
use crate::lifecycle::{self, StartPlan};
use crate::media::{MediaCapture, MediaSource};
use crate::models::{BroadcastSession, SessionId, SessionStatus, TransportKind};
use crate::presence::{ParticipantRole, PresenceHub, ServerEvent};
use crate::signaling::{MailboxRelay, SignalingRelay};
use crate::store::SessionStore;
use crate::transport::{
    DirectTransport, HostedRoomProvider, HostedTransport, TransportSelector, VideoSink,
};
use crate::webrtc::PeerConnectionFactory;
use crate::Result;

/// What the public viewer page needs to find a running broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSessionInfo {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub is_streaming: bool,
    pub transport: TransportKind,
    /// Rendezvous peer id, Direct sessions only
    pub peer_id: Option<String>,
    /// Hosted room URL, Hosted sessions only
    pub room_url: Option<String>,
}

impl PublicSessionInfo {
    /// Derived from session metadata alone
    #[must_use]
    pub fn from_session(session: &BroadcastSession) -> Self {
        let (peer_id, room_url) = match (session.transport, session.is_streaming) {
            (TransportKind::Direct, true) => (Some(session.id.direct_peer_id()), None),
            (TransportKind::Hosted, true) => (None, session.room_reference.clone()),
            (_, false) => (None, None),
        };

        Self {
            session_id: session.id.clone(),
            status: session.status,
            is_streaming: session.is_streaming,
            transport: session.transport,
            peer_id,
            room_url,
        }
    }
}

/// Presence viewers vs. video-connected viewers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerCounts {
    pub present: usize,
    pub direct: usize,
}

pub struct BroadcastService {
    store: Arc<dyn SessionStore>,
    relay: Arc<dyn SignalingRelay>,
    transports: TransportSelector,
    presence: PresenceHub,
    locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
    /// Direct sessions: coordinator events -> broadcaster presence connections
    forwarders: DashMap<SessionId, JoinHandle<()>>,
}

impl BroadcastService {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        relay: Arc<dyn SignalingRelay>,
        transports: TransportSelector,
        presence: PresenceHub,
    ) -> Self {
        Self {
            store,
            relay,
            transports,
            presence,
            locks: DashMap::new(),
            forwarders: DashMap::new(),
        }
    }

    /// Wire the default relay, both transports and the presence hub
    #[must_use]
    pub fn from_config(
        config: &Config,
        store: Arc<dyn SessionStore>,
        peers: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
        rooms: Arc<dyn HostedRoomProvider>,
    ) -> Self {
        let relay: Arc<dyn SignalingRelay> = Arc::new(MailboxRelay::new(Arc::clone(&store)));
        let direct = DirectTransport::new(
            Arc::new(config.broadcast.clone()),
            Arc::clone(&relay),
            peers,
            capture,
        );
        let hosted = HostedTransport::new(rooms);
        let transports = TransportSelector::new(Arc::new(direct), Arc::new(hosted));

        Self::new(store, relay, transports, PresenceHub::new(config.presence.clone()))
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceHub {
        &self.presence
    }

    #[must_use]
    pub fn transports(&self) -> &TransportSelector {
        &self.transports
    }

    fn session_lock(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.entry(session_id.clone()).or_default().value())
    }

    fn emit_status(&self, session: &BroadcastSession) {
        let sent = self.presence.broadcast(
            &session.id,
            ServerEvent::StreamStatus {
                session_id: session.id.clone(),
                status: session.status,
                is_streaming: session.is_streaming,
                is_recording: session.is_recording,
            },
        );
        debug!(session_id = %session.id, sent, "Stream status emitted");
    }

    fn forward_coordinator_events(&self, session_id: &SessionId) {
        let Some(coordinator) = self.transports.direct().coordinator(session_id) else {
            return;
        };
        let mut events = coordinator.subscribe();
        drop(coordinator);

        let presence = self.presence.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(frame) = connection_error(&id, event) {
                            presence.send_to_role(&id, ParticipantRole::Broadcaster, frame);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %id, skipped, "Coordinator events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(session_id = %id, "Coordinator event forwarding stopped");
        });

        if let Some(previous) = self.forwarders.insert(session_id.clone(), handle) {
            previous.abort();
        }
    }

    fn stop_forwarding(&self, session_id: &SessionId) {
        if let Some((_, handle)) = self.forwarders.remove(session_id) {
            handle.abort();
        }
    }

    pub async fn get(&self, session_id: &SessionId) -> Result<BroadcastSession> {
        self.store.get(session_id).await
    }

    /// draft -> published
    pub async fn publish(&self, session_id: &SessionId) -> Result<BroadcastSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.store.get(session_id).await?;
        let patch = lifecycle::plan_publish(&session)?;
        let updated = self.store.update(session_id, patch).await?;

        info!(session_id = %session_id, "Session published");
        Ok(updated)
    }

    /// Go live. Calling it on a session that is already streaming returns the
    /// session unchanged.
    pub async fn start(
        &self,
        session_id: &SessionId,
        source: MediaSource,
    ) -> Result<BroadcastSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.store.get(session_id).await?;
        let transport = self.transports.select(session.transport);

        if let StartPlan::AlreadyLive { room_reference } = lifecycle::plan_start(&session)? {
            if transport.is_active(session_id) {
                debug!(session_id = %session_id, room_reference = %room_reference, "Already live");
                return Ok(session);
            }
            warn!(session_id = %session_id, "Live session has no running transport, restarting it");
        }

        let room_reference = transport.start(&session, source).await?;

        let updated = match self
            .store
            .update(session_id, lifecycle::started_patch(room_reference.clone()))
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                if let Err(stop_err) = transport.stop(&session).await {
                    warn!(session_id = %session_id, error = %stop_err, "Rollback of transport start failed");
                }
                return Err(err);
            }
        };

        info!(
            session_id = %session_id,
            transport = ?updated.transport,
            room_reference = %room_reference,
            "Broadcast started"
        );
        if updated.transport == TransportKind::Direct {
            self.forward_coordinator_events(session_id);
        }
        self.emit_status(&updated);
        Ok(updated)
    }

    /// live -> published. All viewer connections are closed before the new
    /// state is persisted.
    pub async fn stop(&self, session_id: &SessionId) -> Result<BroadcastSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.store.get(session_id).await?;
        let patch = lifecycle::plan_stop(&session)?;

        if let Err(err) = self.transports.select(session.transport).stop(&session).await {
            warn!(session_id = %session_id, error = %err, "Transport stop failed, continuing teardown");
        }
        self.stop_forwarding(session_id);
        self.relay.clear(session_id).await?;

        let updated = self.store.update(session_id, patch).await?;
        info!(session_id = %session_id, "Broadcast stopped");
        self.emit_status(&updated);
        Ok(updated)
    }

    /// Any state -> ended. Terminal.
    pub async fn end(&self, session_id: &SessionId) -> Result<BroadcastSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.store.get(session_id).await?;
        let patch = lifecycle::plan_end(&session)?;

        let transport = self.transports.select(session.transport);
        if session.is_streaming || transport.is_active(session_id) {
            if let Err(err) = transport.stop(&session).await {
                warn!(session_id = %session_id, error = %err, "Transport stop failed, continuing teardown");
            }
        }
        self.stop_forwarding(session_id);
        self.relay.clear(session_id).await?;

        let updated = self.store.update(session_id, patch).await?;
        info!(session_id = %session_id, "Session ended");
        self.emit_status(&updated);
        self.presence.close_session(session_id);
        drop(_guard);
        self.locks.remove(session_id);
        Ok(updated)
    }

    pub async fn toggle_recording(&self, session_id: &SessionId) -> Result<BroadcastSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.store.get(session_id).await?;
        let patch = lifecycle::plan_toggle_recording(&session)?;
        let updated = self.store.update(session_id, patch).await?;

        info!(session_id = %session_id, is_recording = updated.is_recording, "Recording toggled");
        self.emit_status(&updated);
        Ok(updated)
    }

    /// Switch transport strategy; rejected with `TransportLocked` while live
    pub async fn set_transport(
        &self,
        session_id: &SessionId,
        kind: TransportKind,
    ) -> Result<BroadcastSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = self.store.get(session_id).await?;
        let Some(patch) = lifecycle::plan_transport_change(&session, kind)? else {
            return Ok(session);
        };

        let updated = self.store.update(session_id, patch).await?;
        info!(session_id = %session_id, transport = ?kind, "Transport changed");
        Ok(updated)
    }

    pub async fn list_sessions(&self) -> Result<Vec<BroadcastSession>> {
        self.store.list().await
    }

    pub async fn live_sessions(&self) -> Result<Vec<BroadcastSession>> {
        let sessions = self.store.list().await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.status == SessionStatus::Live)
            .collect())
    }

    pub async fn public_info(&self, session_id: &SessionId) -> Result<PublicSessionInfo> {
        let session = self.store.get(session_id).await?;
        Ok(PublicSessionInfo::from_session(&session))
    }

    #[must_use]
    pub fn viewer_counts(&self, session_id: &SessionId) -> ViewerCounts {
        ViewerCounts {
            present: self.presence.viewer_count(session_id),
            direct: self.transports.direct().viewer_count(session_id),
        }
    }

    pub async fn attach_local_preview(
        &self,
        session_id: &SessionId,
        sink: &dyn VideoSink,
    ) -> Result<()> {
        let session = self.store.get(session_id).await?;
        self.transports
            .select(session.transport)
            .attach_local_preview(session_id, sink)
    }
}

/// Operator-facing frame for a coordinator event, `None` for successes
fn connection_error(session_id: &SessionId, event: CoordinatorEvent) -> Option<ServerEvent> {
    let (viewer_id, error) = match event {
        CoordinatorEvent::ViewerConnected(_) => return None,
        CoordinatorEvent::ViewerFailed { viewer_id, error } => (Some(viewer_id), error),
        CoordinatorEvent::OfferFailed { error, .. } => (None, error),
    };
    Some(ServerEvent::ConnectionError {
        session_id: session_id.clone(),
        viewer_id,
        message: error.operator_message().to_string(),
        detail: error.to_string(),
    })
}

impl std::fmt::Debug for BroadcastService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastService")
            .field("presence", &self.presence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaError;
    use crate::models::{SignalMessage, ViewerId};
    use crate::presence::Participant;
    use crate::store::{MemorySessionStore, MockSessionStore};
    use crate::test_helpers::{FakeHostedRooms, FakeMediaCapture, FakePeerFactory};
    use crate::transport::BroadcastTransport;
    use crate::Error;
    use std::time::Duration;

    struct Fixture {
        service: BroadcastService,
        store: MemorySessionStore,
        peers: Arc<FakePeerFactory>,
        capture: Arc<FakeMediaCapture>,
        rooms: Arc<FakeHostedRooms>,
    }

    fn direct_id() -> SessionId {
        SessionId::from("keynote")
    }

    fn hosted_id() -> SessionId {
        SessionId::from("panel")
    }

    fn fixture() -> Fixture {
        let store = MemorySessionStore::new();
        store.insert(BroadcastSession::new(direct_id(), TransportKind::Direct));
        store.insert(BroadcastSession::new(hosted_id(), TransportKind::Hosted));

        let peers = FakePeerFactory::new();
        let capture = FakeMediaCapture::new();
        let rooms = FakeHostedRooms::new();
        let service = BroadcastService::from_config(
            &Config::default(),
            Arc::new(store.clone()),
            peers.clone(),
            capture.clone(),
            rooms.clone(),
        );

        Fixture {
            service,
            store,
            peers,
            capture,
            rooms,
        }
    }

    async fn go_live(f: &Fixture, id: &SessionId) -> BroadcastSession {
        f.service.publish(id).await.unwrap();
        f.service.start(id, MediaSource::Camera).await.unwrap()
    }

    async fn connect_viewer(f: &Fixture, viewer: &str) {
        let id = direct_id();
        let offer = f.service.get(&id).await.unwrap().mailbox.unwrap();
        let answer = SignalMessage::answer(&ViewerId::from(viewer), "v=0 answer", offer.revision);
        f.store
            .update(&id, crate::models::SessionPatch::mailbox(Some(answer)))
            .await
            .unwrap();
        let coordinator = f.service.transports().direct().coordinator(&id).unwrap();
        coordinator.poll_signaling().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_session_goes_live_with_offer_in_mailbox() {
        let f = fixture();

        let session = go_live(&f, &direct_id()).await;

        assert_eq!(session.status, SessionStatus::Live);
        assert!(session.is_streaming);
        assert_eq!(session.room_reference.as_deref(), Some("event-keynote-admin"));
        assert!(session.mailbox.as_ref().is_some_and(SignalMessage::is_offer));
        assert!(session.invariants_hold());

        f.service.stop(&direct_id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_hosted_session_goes_live_with_room_url() {
        let f = fixture();

        let session = go_live(&f, &hosted_id()).await;

        assert_eq!(session.status, SessionStatus::Live);
        assert_eq!(
            session.room_reference.as_deref(),
            Some("https://rooms.example.com/live-1")
        );
        assert!(session.mailbox.is_none());
        assert_eq!(f.peers.created_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_keeps_offer_cycle_and_viewers() {
        let f = fixture();
        let id = direct_id();
        go_live(&f, &id).await;
        connect_viewer(&f, "viewer-1").await;
        let created = f.peers.created_count();

        let again = f.service.start(&id, MediaSource::Camera).await.unwrap();

        assert!(again.is_streaming);
        assert_eq!(f.peers.created_count(), created);
        assert_eq!(f.capture.acquired(), 1);
        assert_eq!(f.service.viewer_counts(&id).direct, 1);

        f.service.stop(&id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_all_connections_and_clears_state() {
        let f = fixture();
        let id = direct_id();
        go_live(&f, &id).await;
        connect_viewer(&f, "viewer-a").await;
        connect_viewer(&f, "viewer-b").await;
        assert_eq!(f.service.viewer_counts(&id).direct, 2);
        let coordinator = f.service.transports().direct().coordinator(&id).unwrap();

        let session = f.service.stop(&id).await.unwrap();

        assert_eq!(session.status, SessionStatus::Published);
        assert!(!session.is_streaming);
        assert!(!session.is_recording);
        assert!(session.room_reference.is_none());
        assert!(session.mailbox.is_none());
        assert_eq!(coordinator.viewer_count(), 0);
        assert_eq!(coordinator.active_task_count(), 0);
        assert!(f.peers.created().iter().all(|p| p.is_closed()));
        assert_eq!(f.capture.released().len(), 1);
        assert_eq!(f.service.viewer_counts(&id).direct, 0);
    }

    #[tokio::test]
    async fn test_stop_hosted_destroys_room() {
        let f = fixture();
        let id = hosted_id();
        let live = go_live(&f, &id).await;

        f.service.stop(&id).await.unwrap();

        assert_eq!(f.rooms.destroyed(), vec![live.room_reference.unwrap()]);
    }

    #[tokio::test]
    async fn test_toggle_recording_requires_streaming() {
        let f = fixture();
        let id = hosted_id();
        f.service.publish(&id).await.unwrap();

        let err = f.service.toggle_recording(&id).await.unwrap_err();

        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(!f.service.get(&id).await.unwrap().is_recording);

        f.service.start(&id, MediaSource::Camera).await.unwrap();
        let recording = f.service.toggle_recording(&id).await.unwrap();
        assert!(recording.is_recording);
        assert!(recording.invariants_hold());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_on_live_session_is_terminal() {
        let f = fixture();
        let id = direct_id();
        go_live(&f, &id).await;

        let ended = f.service.end(&id).await.unwrap();

        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(!ended.is_streaming);
        assert!(ended.mailbox.is_none());
        assert!(!f.service.transports().direct().is_active(&id));
        assert!(matches!(
            f.service.start(&id, MediaSource::Camera).await,
            Err(Error::SessionEnded)
        ));
        assert!(matches!(f.service.end(&id).await, Err(Error::SessionEnded)));
    }

    #[tokio::test]
    async fn test_start_requires_published() {
        let f = fixture();

        let err = f.service.start(&hosted_id(), MediaSource::Camera).await.unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: SessionStatus::Draft,
                ..
            }
        ));
        assert_eq!(f.rooms.created(), 0);
    }

    #[tokio::test]
    async fn test_transport_locked_while_live() {
        let f = fixture();
        let id = hosted_id();
        go_live(&f, &id).await;

        assert!(matches!(
            f.service.set_transport(&id, TransportKind::Direct).await,
            Err(Error::TransportLocked)
        ));

        f.service.stop(&id).await.unwrap();
        let switched = f.service.set_transport(&id, TransportKind::Direct).await.unwrap();
        assert_eq!(switched.transport, TransportKind::Direct);
    }

    #[tokio::test]
    async fn test_media_denied_leaves_session_published() {
        let f = fixture();
        let id = direct_id();
        f.service.publish(&id).await.unwrap();
        f.capture
            .deny_with(MediaError::PermissionDenied("blocked".to_string()));

        let err = f.service.start(&id, MediaSource::Camera).await.unwrap_err();

        assert_eq!(err.operator_message(), "camera access error");
        let session = f.service.get(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Published);
        assert!(!session.is_streaming);
        assert!(session.mailbox.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_session_without_running_transport_restarts_it() {
        let f = fixture();
        let id = direct_id();
        f.store
            .update(
                &id,
                crate::models::SessionPatch {
                    status: Some(SessionStatus::Live),
                    is_streaming: Some(true),
                    room_reference: Some(Some(id.direct_peer_id())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        f.service.start(&id, MediaSource::Camera).await.unwrap();

        assert_eq!(f.capture.acquired(), 1);
        assert!(f.service.transports().direct().is_active(&id));
        f.service.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_changes_reach_presence_subscribers() {
        let f = fixture();
        let id = hosted_id();
        let mut sub = f
            .service
            .presence()
            .join(id.clone(), Participant::viewer("v1", "Ada"));

        go_live(&f, &id).await;

        let mut saw_live = false;
        while let Ok(event) = sub.receiver.try_recv() {
            if let ServerEvent::StreamStatus { is_streaming, status, .. } = event {
                saw_live = is_streaming && status == SessionStatus::Live;
            }
        }
        assert!(saw_live);
        assert_eq!(f.service.viewer_counts(&id).present, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_failure_reaches_broadcaster_only() {
        let f = fixture();
        let id = direct_id();
        let presence = f.service.presence();
        let mut host = presence.join(id.clone(), Participant::broadcaster("admin", "Host"));
        let mut viewer = presence.join(id.clone(), Participant::viewer("v1", "Ada"));

        f.peers.fail_next_remote_description();
        go_live(&f, &id).await;
        let answer = SignalMessage::answer(&ViewerId::from("v1"), "v=0 answer", Some(1));
        f.store
            .update(&id, crate::models::SessionPatch::mailbox(Some(answer)))
            .await
            .unwrap();

        // Applied by the background poll tick
        tokio::time::sleep(Duration::from_millis(5_100)).await;

        let mut errors = Vec::new();
        while let Ok(event) = host.receiver.try_recv() {
            if let ServerEvent::ConnectionError { viewer_id, message, .. } = event {
                errors.push((viewer_id, message));
            }
        }
        assert_eq!(
            errors,
            vec![(Some(ViewerId::from("v1")), "viewer connection failed".to_string())]
        );
        while let Ok(event) = viewer.receiver.try_recv() {
            assert!(!matches!(event, ServerEvent::ConnectionError { .. }));
        }
        assert_eq!(f.service.viewer_counts(&id).direct, 0);

        f.service.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_listing_and_public_info() {
        let f = fixture();
        go_live(&f, &hosted_id()).await;

        assert_eq!(f.service.list_sessions().await.unwrap().len(), 2);
        let live = f.service.live_sessions().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, hosted_id());

        let info = f.service.public_info(&hosted_id()).await.unwrap();
        assert_eq!(info.room_url.as_deref(), Some("https://rooms.example.com/live-1"));
        assert!(info.peer_id.is_none());

        let idle = f.service.public_info(&direct_id()).await.unwrap();
        assert!(idle.peer_id.is_none() && idle.room_url.is_none());
    }

    #[test]
    fn test_public_info_for_direct_session() {
        let mut session = BroadcastSession::new(SessionId::from("s9"), TransportKind::Direct);
        session.status = SessionStatus::Live;
        session.is_streaming = true;

        let info = PublicSessionInfo::from_session(&session);

        assert_eq!(info.peer_id.as_deref(), Some("event-s9-admin"));
        assert!(info.room_url.is_none());
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let mut store = MockSessionStore::new();
        store
            .expect_get()
            .returning(|id| Err(Error::NotFound(format!("session {id}"))));
        let service = BroadcastService::from_config(
            &Config::default(),
            Arc::new(store),
            FakePeerFactory::new(),
            FakeMediaCapture::new(),
            FakeHostedRooms::new(),
        );

        let err = service.publish(&SessionId::from("missing")).await.unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.operator_message(), "broadcast not found");
    }
}
