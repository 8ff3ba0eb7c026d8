//! Local media capture boundary
//!
//! Capture itself is performed by the browser or device layer; this crate only
//! tracks which stream the broadcaster is sending and releases it on teardown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::generate_id;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where the broadcaster's picture comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    #[default]
    Camera,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            kind,
            label: label.into(),
        }
    }
}

/// Captured local stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub source: MediaSource,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    #[must_use]
    pub fn new(source: MediaSource, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: generate_id(),
            source,
            tracks,
        }
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire_camera(&self) -> Result<MediaStream, MediaError>;

    async fn acquire_screen(&self) -> Result<MediaStream, MediaError>;

    /// Stop every track of a previously acquired stream
    async fn release(&self, stream: &MediaStream);

    async fn acquire(&self, source: MediaSource) -> Result<MediaStream, MediaError> {
        match source {
            MediaSource::Camera => self.acquire_camera().await,
            MediaSource::Screen => self.acquire_screen().await,
        }
    }
}
