//! Broadcaster-side coordinator for the Direct transport
//!
//! One coordinator exists per live session. It owns the captured media, the
//! single in-flight offer and the registry of connected viewers:
//!
//! - an offer is created, ICE gathering is awaited to completion, and the
//!   complete description is written to the session mailbox
//! - a re-publish task rewrites that same offer every interval until an
//!   answer is accepted
//! - a poll task reads the mailbox; a matching answer finalizes the pending
//!   connection, moves it into the registry and starts a fresh offer for the
//!   next viewer
//!
//! The pending offer and mailbox writes are serialized by one per-session
//! lock. Registered connections are guarded individually.
//!
//! Per-viewer failures never stop the broadcast. They are published as
//! [`CoordinatorEvent`]s, and a failed offer for the next viewer is retried
//! from the poll tick with exponential backoff.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BroadcastConfig;
use crate::media::{MediaCapture, MediaSource, MediaStream, MediaTrack};
use crate::models::{SessionId, SignalMessage, ViewerId};
use crate::signaling::SignalingRelay;
use crate::webrtc::{
    ConnectionRegistry, ConnectionState, PeerConnection, PeerConnectionFactory, PeerError,
    SessionDescription, ViewerConnection,
};
use crate::{Error, Result};

/// Result of one signaling poll tick
#[derive(Debug)]
pub enum PollOutcome {
    /// Mailbox is empty
    Empty,
    /// Mailbox still holds our own offer
    OwnOffer,
    /// An answer was applied and the viewer registered
    Connected(ViewerId),
    /// A stale or unexpected answer was ignored (`Error::SignalingConflict`)
    Discarded(Error),
    /// Applying the answer failed; only that connection was closed
    Failed(Error),
}

const EVENT_CAPACITY: usize = 64;
const MAX_OFFER_BACKOFF: Duration = Duration::from_secs(60);

/// Per-viewer outcomes reported while the broadcast runs
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    ViewerConnected(ViewerId),
    /// Only this viewer's connection was closed
    ViewerFailed {
        viewer_id: ViewerId,
        error: Arc<Error>,
    },
    /// The offer for the next viewer could not be prepared
    OfferFailed {
        error: Arc<Error>,
        retry_in: Duration,
    },
}

struct OfferBackoff {
    failures: u32,
    retry_at: Instant,
}

struct PendingOffer {
    revision: u64,
    peer: Arc<dyn PeerConnection>,
    message: SignalMessage,
    republish: CancellationToken,
}

type ConflictKey = (String, Option<u64>, chrono::DateTime<chrono::Utc>);

pub struct BroadcastCoordinator {
    session_id: SessionId,
    config: Arc<BroadcastConfig>,
    relay: Arc<dyn SignalingRelay>,
    peers: Arc<dyn PeerConnectionFactory>,
    capture: Arc<dyn MediaCapture>,

    media: RwLock<Option<MediaStream>>,
    pending: tokio::sync::Mutex<Option<PendingOffer>>,
    registry: ConnectionRegistry,

    revision: AtomicU64,
    republished: AtomicU64,
    started: AtomicBool,
    offering: AtomicBool,
    last_conflict: Mutex<Option<ConflictKey>>,
    offer_backoff: Mutex<Option<OfferBackoff>>,
    events: broadcast::Sender<CoordinatorEvent>,

    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastCoordinator {
    pub fn new(
        session_id: SessionId,
        config: Arc<BroadcastConfig>,
        relay: Arc<dyn SignalingRelay>,
        peers: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            session_id,
            config,
            relay,
            peers,
            capture,
            media: RwLock::new(None),
            pending: tokio::sync::Mutex::new(None),
            registry: ConnectionRegistry::new(),
            revision: AtomicU64::new(0),
            republished: AtomicU64::new(0),
            started: AtomicBool::new(false),
            offering: AtomicBool::new(false),
            last_conflict: Mutex::new(None),
            offer_backoff: Mutex::new(None),
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Receive per-viewer events. Only events sent after subscribing are seen.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoordinatorEvent) {
        if self.events.send(event).is_err() {
            debug!(session_id = %self.session_id, "No event subscribers");
        }
    }

    /// Acquire local media and publish the first offer.
    ///
    /// Calling it again on a running coordinator does nothing.
    pub async fn start(self: &Arc<Self>, source: MediaSource) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Internal(format!(
                "coordinator for session {} was already stopped",
                self.session_id
            )));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.session_id, "Coordinator already started");
            return Ok(());
        }

        let stream = match self.capture.acquire(source).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, ?source, "Media acquisition failed");
                self.started.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };
        if self.shutdown.is_cancelled() {
            self.capture.release(&stream).await;
            return Ok(());
        }

        info!(
            session_id = %self.session_id,
            stream_id = %stream.id,
            tracks = stream.tracks.len(),
            ?source,
            "Local media acquired"
        );
        *self.media.write() = Some(stream);

        if let Err(err) = self.begin_offer_cycle().await {
            error!(session_id = %self.session_id, error = %err, "Failed to publish initial offer");
            self.release_media().await;
            self.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        if !self.shutdown.is_cancelled() {
            self.spawn_poll_loop();
        }
        Ok(())
    }

    /// Create a fresh peer connection, wait for complete ICE gathering and
    /// publish its offer. A no-op if the coordinator is stopping or an offer
    /// is already pending.
    async fn begin_offer_cycle(self: &Arc<Self>) -> Result<()> {
        self.offering.store(true, Ordering::SeqCst);
        let result = self.run_offer_cycle().await;
        self.offering.store(false, Ordering::SeqCst);
        result
    }

    async fn run_offer_cycle(self: &Arc<Self>) -> Result<()> {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let label = format!("offer#{revision}");

        let peer = self
            .peers
            .create(&self.config.ice_server_config())
            .await
            .map_err(|e| Error::peer(&label, e))?;

        let tracks = self.local_tracks();
        let sdp = match self.prepare_offer(&peer, &tracks).await {
            Ok(sdp) => sdp,
            Err(_) if self.shutdown.is_cancelled() => {
                peer.close().await;
                debug!(session_id = %self.session_id, revision, "Offer abandoned by stop");
                return Ok(());
            }
            Err(err) => {
                peer.close().await;
                return Err(Error::peer(&label, err));
            }
        };

        let message = SignalMessage::offer(sdp, revision);
        let mut pending = self.pending.lock().await;
        if self.shutdown.is_cancelled() || pending.is_some() {
            drop(pending);
            peer.close().await;
            debug!(session_id = %self.session_id, revision, "Offer superseded before publish");
            return Ok(());
        }

        if let Err(err) = self.relay.publish(&self.session_id, message.clone()).await {
            drop(pending);
            peer.close().await;
            return Err(err);
        }

        let republish = self.shutdown.child_token();
        *pending = Some(PendingOffer {
            revision,
            peer,
            message,
            republish: republish.clone(),
        });
        drop(pending);

        info!(session_id = %self.session_id, revision, "Offer published, awaiting answer");
        self.spawn_republish_loop(revision, republish);
        Ok(())
    }

    async fn prepare_offer(
        &self,
        peer: &Arc<dyn PeerConnection>,
        tracks: &[MediaTrack],
    ) -> std::result::Result<String, PeerError> {
        for track in tracks {
            peer.add_track(track).await?;
        }
        let offer = peer.create_offer().await?;

        // The mailbox is polled, so only a fully gathered description is usable
        let gathering = tokio::time::timeout(
            self.config.ice_gathering_timeout(),
            peer.ice_gathering_complete(),
        );
        tokio::select! {
            () = self.shutdown.cancelled() => return Err(PeerError::Closed),
            gathered = gathering => gathered.map_err(|_| PeerError::IceGatheringTimeout)??,
        }

        Ok(peer.local_description().unwrap_or(offer).sdp)
    }

    /// Re-write the pending offer verbatim. Returns whether anything was
    /// written.
    pub async fn republish_offer(&self) -> Result<bool> {
        let pending = self.pending.lock().await;
        let Some(offer) = pending.as_ref() else {
            return Ok(false);
        };
        if offer.republish.is_cancelled() {
            return Ok(false);
        }

        // Leave an unread answer to the current offer for the poll tick
        if let Some(current) = self.relay.poll(&self.session_id).await? {
            let answers_pending = current.is_answer()
                && current.revision.is_none_or(|r| r == offer.revision);
            if answers_pending {
                debug!(session_id = %self.session_id, revision = offer.revision, "Answer waiting, skipping re-publish");
                return Ok(false);
            }
        }

        self.relay
            .publish(&self.session_id, offer.message.clone())
            .await?;
        let count = self.republished.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(session_id = %self.session_id, revision = offer.revision, count, "Offer re-published");
        Ok(true)
    }

    /// Read the mailbox once and act on an answer if one is there
    pub async fn poll_signaling(self: &Arc<Self>) -> Result<PollOutcome> {
        let Some(message) = self.relay.poll(&self.session_id).await? else {
            return Ok(PollOutcome::Empty);
        };
        if message.is_offer() {
            return Ok(PollOutcome::OwnOffer);
        }

        let mut guard = self.pending.lock().await;
        if self.shutdown.is_cancelled() {
            return Ok(PollOutcome::Empty);
        }
        if let Some(reason) = conflict_reason(guard.as_ref(), &message) {
            drop(guard);
            return Ok(self.discard(&message, reason));
        }
        let Some(pending) = guard.take() else {
            return Ok(PollOutcome::Empty);
        };

        pending.republish.cancel();
        let viewer_id = ViewerId::from(message.sender.clone());

        if let Err(err) = pending
            .peer
            .set_remote_description(SessionDescription::from(&message))
            .await
        {
            pending.peer.close().await;
            drop(guard);
            warn!(
                session_id = %self.session_id,
                viewer_id = %viewer_id,
                revision = pending.revision,
                error = %err,
                "Failed to apply answer, connection closed"
            );
            self.emit(CoordinatorEvent::ViewerFailed {
                viewer_id: viewer_id.clone(),
                error: Arc::new(Error::peer(viewer_id.as_str(), err.clone())),
            });
            self.offer_next_if_room().await;
            return Ok(PollOutcome::Failed(Error::peer(viewer_id.as_str(), err)));
        }

        let connection = Arc::new(ViewerConnection::connected(
            viewer_id.clone(),
            pending.revision,
            pending.peer,
        ));
        let replaced = self.registry.insert(connection);
        drop(guard);

        if let Some(old) = replaced {
            old.close().await;
            debug!(session_id = %self.session_id, viewer_id = %viewer_id, "Replaced previous connection for viewer");
        }

        info!(
            session_id = %self.session_id,
            viewer_id = %viewer_id,
            revision = pending.revision,
            viewers = self.registry.len(),
            "Viewer connected"
        );
        self.emit(CoordinatorEvent::ViewerConnected(viewer_id.clone()));

        self.offer_next_if_room().await;
        Ok(PollOutcome::Connected(viewer_id))
    }

    fn discard(&self, message: &SignalMessage, reason: String) -> PollOutcome {
        let key = (message.sender.clone(), message.revision, message.sent_at);
        let mut last = self.last_conflict.lock();
        if last.as_ref() == Some(&key) {
            debug!(session_id = %self.session_id, sender = %message.sender, "Stale answer still in mailbox");
        } else {
            warn!(
                session_id = %self.session_id,
                sender = %message.sender,
                revision = ?message.revision,
                reason = %reason,
                "Discarding unexpected answer"
            );
            *last = Some(key);
        }
        PollOutcome::Discarded(Error::SignalingConflict(reason))
    }

    async fn offer_next_if_room(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.config.has_capacity(self.registry.len()) {
            info!(
                session_id = %self.session_id,
                viewers = self.registry.len(),
                "Viewer capacity reached, not offering"
            );
            self.offer_backoff.lock().take();
            return;
        }
        match self.begin_offer_cycle().await {
            Ok(()) => {
                self.offer_backoff.lock().take();
            }
            Err(err) => {
                let retry_in = self.schedule_offer_retry();
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    ?retry_in,
                    "Failed to prepare next offer"
                );
                self.emit(CoordinatorEvent::OfferFailed {
                    error: Arc::new(err),
                    retry_in,
                });
            }
        }
    }

    fn schedule_offer_retry(&self) -> Duration {
        let mut backoff = self.offer_backoff.lock();
        let failures = backoff.as_ref().map_or(0, |b| b.failures) + 1;
        let delay = self
            .config
            .poll_interval()
            .saturating_mul(1u32 << (failures - 1).min(6))
            .min(MAX_OFFER_BACKOFF);
        *backoff = Some(OfferBackoff {
            failures,
            retry_at: Instant::now() + delay,
        });
        delay
    }

    /// Retry the next viewer's offer once the backoff of an earlier failure
    /// has elapsed
    async fn resume_offering(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.offering.load(Ordering::SeqCst) {
            return;
        }
        let due = self
            .offer_backoff
            .lock()
            .as_ref()
            .is_some_and(|b| Instant::now() >= b.retry_at);
        if !due || self.pending.lock().await.is_some() {
            return;
        }
        debug!(session_id = %self.session_id, "Retrying offer for next viewer");
        self.offer_next_if_room().await;
    }

    /// Close and unregister one viewer
    pub async fn disconnect_viewer(self: &Arc<Self>, viewer_id: &ViewerId) -> bool {
        let Some(connection) = self.registry.remove(viewer_id) else {
            return false;
        };
        connection.close().await;
        info!(
            session_id = %self.session_id,
            viewer_id = %viewer_id,
            viewers = self.registry.len(),
            "Viewer disconnected"
        );

        if self.pending.lock().await.is_none() {
            self.offer_next_if_room().await;
        }
        true
    }

    /// Close a viewer whose transport failed and hand back the error for the
    /// operator. Other viewers are unaffected.
    pub async fn report_peer_failure(self: &Arc<Self>, viewer_id: &ViewerId, reason: PeerError) -> Error {
        warn!(session_id = %self.session_id, viewer_id = %viewer_id, error = %reason, "Peer connection failed");
        self.emit(CoordinatorEvent::ViewerFailed {
            viewer_id: viewer_id.clone(),
            error: Arc::new(Error::peer(viewer_id.as_str(), reason.clone())),
        });
        self.disconnect_viewer(viewer_id).await;
        Error::peer(viewer_id.as_str(), reason)
    }

    /// Cancel timers, discard the in-flight offer, close every connection and
    /// release captured media. Returns how many viewers were disconnected.
    pub async fn stop(&self) -> usize {
        self.shutdown.cancel();

        loop {
            let handles = std::mem::take(&mut *self.tasks.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(session_id = %self.session_id, error = %err, "Coordinator task panicked");
                }
            }
        }

        let pending = self.pending.lock().await.take();
        if let Some(pending) = pending {
            pending.republish.cancel();
            pending.peer.close().await;
            debug!(session_id = %self.session_id, revision = pending.revision, "Discarded in-flight offer");
        }

        let closed = self.registry.close_all().await;
        self.release_media().await;

        info!(session_id = %self.session_id, closed, "Broadcast coordinator stopped");
        closed
    }

    async fn release_media(&self) {
        let stream = self.media.write().take();
        if let Some(stream) = stream {
            self.capture.release(&stream).await;
            debug!(session_id = %self.session_id, stream_id = %stream.id, "Local media released");
        }
    }

    fn local_tracks(&self) -> Vec<MediaTrack> {
        self.media
            .read()
            .as_ref()
            .map(|stream| stream.tracks.clone())
            .unwrap_or_default()
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn spawn_republish_loop(self: &Arc<Self>, revision: u64, token: CancellationToken) {
        let this = Arc::clone(self);
        let period = self.config.republish_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.republish_offer().await {
                            warn!(session_id = %this.session_id, revision, error = %err, "Re-publish failed");
                        }
                    }
                }
            }
            debug!(session_id = %this.session_id, revision, "Re-publish loop stopped");
        });
        self.track_task(handle);
    }

    fn spawn_poll_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = self.config.poll_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.poll_signaling().await {
                            error!(session_id = %this.session_id, error = %err, "Signaling poll failed");
                        }
                        this.resume_offering().await;
                    }
                }
            }
            debug!(session_id = %this.session_id, "Signaling poll loop stopped");
        });
        self.track_task(handle);
    }

    /// Number of directly connected viewers
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn viewer_ids(&self) -> Vec<ViewerId> {
        self.registry.viewer_ids()
    }

    #[must_use]
    pub fn connection_state(&self, viewer_id: &ViewerId) -> Option<ConnectionState> {
        self.registry.get(viewer_id).map(|c| c.state())
    }

    /// Revision of the offer currently awaiting an answer
    pub async fn pending_revision(&self) -> Option<u64> {
        self.pending.lock().await.as_ref().map(|p| p.revision)
    }

    /// State of the offer slot: `offering` while a description is being
    /// prepared, `awaiting-answer` once published, `idle` otherwise
    pub async fn offer_state(&self) -> ConnectionState {
        if self.shutdown.is_cancelled() {
            return ConnectionState::Closed;
        }
        if self.pending.lock().await.is_some() {
            return ConnectionState::AwaitingAnswer;
        }
        if self.offering.load(Ordering::SeqCst) {
            ConnectionState::Offering
        } else {
            ConnectionState::Idle
        }
    }

    /// Whether a re-publish timer is running for the pending offer
    pub async fn is_republishing(&self) -> bool {
        self.pending
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !p.republish.is_cancelled())
    }

    #[must_use]
    pub fn republish_count(&self) -> u64 {
        self.republished.load(Ordering::SeqCst)
    }

    /// Captured stream, once media is ready
    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.media.read().clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.tasks.lock().iter().filter(|h| !h.is_finished()).count()
    }
}

fn conflict_reason(pending: Option<&PendingOffer>, answer: &SignalMessage) -> Option<String> {
    let Some(pending) = pending else {
        return Some("no offer is awaiting an answer".to_string());
    };
    match answer.revision {
        Some(revision) if revision != pending.revision => Some(format!(
            "answer targets revision {revision}, pending offer is revision {}",
            pending.revision
        )),
        _ => None,
    }
}

impl std::fmt::Debug for BroadcastCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastCoordinator")
            .field("session_id", &self.session_id)
            .field("viewers", &self.registry.len())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}
