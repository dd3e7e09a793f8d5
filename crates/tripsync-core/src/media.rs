//! Local and remote media abstractions.
//!
//! The mesh never touches capture devices or rendering surfaces directly:
//! devices are reached through [`MediaDevices`], remote tracks are handed
//! to a caller-supplied [`MediaSink`].

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::RealtimeError;
use crate::events::{TrackInfo, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A captured local track (microphone or camera).
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Mute or unmute without renegotiating.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Release the capture device. Irreversible.
    fn stop(&self);

    fn is_live(&self) -> bool;

    /// Backend-specific sending track, for peer connection backends that
    /// can only send tracks they created themselves.
    fn backend(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// The set of tracks acquired for one call.
#[derive(Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tracks.iter().map(|t| (t.id(), t.kind())))
            .finish()
    }
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            found = true;
        }
        found
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .any(|t| t.kind() == kind && t.is_live() && t.is_enabled())
    }

    /// Stop every track; returns how many were still live.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for track in &self.tracks {
            if track.is_live() {
                track.stop();
                stopped += 1;
            }
        }
        stopped
    }

    pub fn live_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire capture tracks. Denied permissions or missing devices map
    /// to [`RealtimeError::MediaAcquisition`].
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, RealtimeError>;
}

/// A remote track surfaced by a peer connection backend.
#[derive(Clone)]
pub struct RemoteTrack {
    pub info: TrackInfo,
    /// Backend-specific handle the sink knows how to render.
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack").field("info", &self.info).finish()
    }
}

/// Caller-supplied destination for remote media (a video tile, an audio
/// output). Called from the mesh task; implementations must not block.
pub trait MediaSink: Send + Sync {
    fn attach(&self, participant_id: &str, track: RemoteTrack);

    fn detach(&self, participant_id: &str);
}

/// Sink that discards remote media, for audio-less shells.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MediaSink for NullSink {
    fn attach(&self, participant_id: &str, track: RemoteTrack) {
        tracing::debug!(participant = participant_id, track = %track.info.id, "discarding remote track");
    }

    fn detach(&self, _participant_id: &str) {}
}
