//! Deterministic collaborators for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::media::{MediaCapture, MediaError, MediaSource, MediaStream, MediaTrack, TrackKind};
use crate::transport::{HostedRoomProvider, PreviewSource, VideoSink};
use crate::webrtc::{IceServerConfig, PeerConnection, PeerConnectionFactory, PeerError, SessionDescription};
use crate::{Error, Result};

pub struct FakePeerConnection {
    pub number: u64,
    fail_remote: bool,
    fail_ice: bool,
    gather_delay: Option<Duration>,
    tracks: Mutex<Vec<MediaTrack>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    close_calls: AtomicUsize,
}

impl FakePeerConnection {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            fail_remote: false,
            fail_ice: false,
            gather_delay: None,
            tracks: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.remote.lock().as_ref().map(|d| d.sdp.clone())
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> std::result::Result<(), PeerError> {
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> std::result::Result<SessionDescription, PeerError> {
        let offer = SessionDescription::offer(format!("v=0 offer-{}", self.number));
        *self.local.lock() = Some(offer.clone());
        Ok(offer)
    }

    async fn ice_gathering_complete(&self) -> std::result::Result<(), PeerError> {
        if let Some(delay) = self.gather_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_ice {
            return Err(PeerError::IceFailed);
        }
        if let Some(local) = self.local.lock().as_mut() {
            local.sdp.push_str("\r\na=end-of-candidates");
        }
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> std::result::Result<(), PeerError> {
        if self.fail_remote {
            return Err(PeerError::Negotiation("malformed answer".to_string()));
        }
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out numbered [`FakePeerConnection`]s and remembers them
#[derive(Default)]
pub struct FakePeerFactory {
    counter: AtomicU64,
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail_next_remote: AtomicBool,
    fail_ice: AtomicBool,
    gather_delay: Mutex<Option<Duration>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_remote_description(&self) {
        self.fail_next_remote.store(true, Ordering::SeqCst);
    }

    pub fn fail_ice(&self) {
        self.fail_ice.store(true, Ordering::SeqCst);
    }

    /// Peers created from now on behave normally again
    pub fn clear_faults(&self) {
        self.fail_ice.store(false, Ordering::SeqCst);
        self.fail_next_remote.store(false, Ordering::SeqCst);
    }

    pub fn set_gather_delay(&self, delay: Duration) {
        *self.gather_delay.lock() = Some(delay);
    }

    pub fn created(&self) -> Vec<Arc<FakePeerConnection>> {
        self.created.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice: &IceServerConfig,
    ) -> std::result::Result<Arc<dyn PeerConnection>, PeerError> {
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut peer = FakePeerConnection::new(number);
        peer.fail_remote = self.fail_next_remote.swap(false, Ordering::SeqCst);
        peer.fail_ice = self.fail_ice.load(Ordering::SeqCst);
        peer.gather_delay = *self.gather_delay.lock();

        let peer = Arc::new(peer);
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Default)]
pub struct FakeMediaCapture {
    deny: Mutex<Option<MediaError>>,
    acquired: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl FakeMediaCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_with(&self, error: MediaError) {
        *self.deny.lock() = Some(error);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    fn grab(&self, source: MediaSource) -> std::result::Result<MediaStream, MediaError> {
        if let Some(err) = self.deny.lock().clone() {
            return Err(err);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream::new(
            source,
            vec![
                MediaTrack::new(TrackKind::Video, "video"),
                MediaTrack::new(TrackKind::Audio, "audio"),
            ],
        ))
    }
}

#[async_trait]
impl MediaCapture for FakeMediaCapture {
    async fn acquire_camera(&self) -> std::result::Result<MediaStream, MediaError> {
        self.grab(MediaSource::Camera)
    }

    async fn acquire_screen(&self) -> std::result::Result<MediaStream, MediaError> {
        self.grab(MediaSource::Screen)
    }

    async fn release(&self, stream: &MediaStream) {
        self.released.lock().push(stream.id.clone());
    }
}

#[derive(Default)]
pub struct FakeHostedRooms {
    counter: AtomicU64,
    destroyed: Mutex<Vec<String>>,
}

impl FakeHostedRooms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().clone()
    }
}

#[async_trait]
impl HostedRoomProvider for FakeHostedRooms {
    async fn create_room(&self) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("https://rooms.example.com/live-{n}"))
    }

    async fn destroy_room(&self, url: &str) -> Result<()> {
        self.destroyed.lock().push(url.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    attached: Mutex<Vec<PreviewSource>>,
}

impl RecordingSink {
    pub fn attached(&self) -> Vec<PreviewSource> {
        self.attached.lock().clone()
    }
}

impl VideoSink for RecordingSink {
    fn attach(&self, source: PreviewSource) -> Result<()> {
        if matches!(&source, PreviewSource::Room(url) if url.is_empty()) {
            return Err(Error::InvalidInput("empty room url".to_string()));
        }
        self.attached.lock().push(source);
        Ok(())
    }
}
