//! Local capture: devices, screen share and track enablement

pub mod track;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::track::track_local::TrackLocal;

use crate::error::{DeviceError, Result};
use crate::peer::types::TrackKind;
use crate::utils::random_id;

pub use track::{SampleSource, SampleTrack};

/// A live capture track (microphone, camera or display)
pub trait CaptureTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Enable or disable output without releasing hardware
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Stop capture and free the underlying device
    fn stop(&self);
    fn is_live(&self) -> bool;
    /// Outgoing WebRTC track fed by this capture, if it has one
    fn rtp_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Which devices to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: bool,
}

impl CaptureRequest {
    pub const AUDIO_VIDEO: CaptureRequest = CaptureRequest {
        audio: true,
        video: true,
    };

    fn wants(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }
}

/// Host capture backend
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open_devices(
        &self,
        request: CaptureRequest,
    ) -> std::result::Result<Vec<Arc<dyn CaptureTrack>>, DeviceError>;

    async fn open_display(&self) -> std::result::Result<Vec<Arc<dyn CaptureTrack>>, DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOrigin {
    Devices,
    Display,
}

/// Handle to a set of acquired tracks.
///
/// Hardware is freed by [`MediaDeviceController::release`]. A handle dropped
/// without release stops its tracks and logs a warning.
pub struct LocalMedia {
    id: String,
    origin: CaptureOrigin,
    tracks: Vec<Arc<dyn CaptureTrack>>,
}

impl LocalMedia {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> CaptureOrigin {
        self.origin
    }

    pub fn tracks(&self) -> &[Arc<dyn CaptureTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<dyn CaptureTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    fn stop_all(&mut self) -> usize {
        let tracks = std::mem::take(&mut self.tracks);
        for track in &tracks {
            track.stop();
        }
        tracks.len()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if !self.tracks.is_empty() {
            warn!(media = %self.id, "Local media dropped without release, stopping tracks");
            self.stop_all();
        }
    }
}

/// Acquires and releases local media through a [`MediaSource`]
#[derive(Clone)]
pub struct MediaDeviceController {
    source: Arc<dyn MediaSource>,
}

impl MediaDeviceController {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self { source }
    }

    /// Open microphone and/or camera
    pub async fn acquire(&self, request: CaptureRequest) -> Result<LocalMedia> {
        if !request.audio && !request.video {
            return Err(DeviceError::Unsupported("nothing requested".into()).into());
        }
        let tracks = self.source.open_devices(request).await?;
        let mut media = LocalMedia {
            id: random_id(),
            origin: CaptureOrigin::Devices,
            tracks,
        };

        for kind in [TrackKind::Audio, TrackKind::Video] {
            if request.wants(kind) && media.track(kind).is_none() {
                media.stop_all();
                return Err(DeviceError::NotFound(format!("no {kind:?} track")).into());
            }
        }

        info!(
            media = %media.id,
            audio = request.audio,
            video = request.video,
            "Acquired local media ({} tracks)",
            media.tracks.len()
        );
        Ok(media)
    }

    /// Open a display (screen share) capture
    pub async fn acquire_display(&self) -> Result<LocalMedia> {
        let tracks = self.source.open_display().await?;
        let mut media = LocalMedia {
            id: random_id(),
            origin: CaptureOrigin::Display,
            tracks,
        };
        if media.track(TrackKind::Video).is_none() {
            media.stop_all();
            return Err(DeviceError::NotFound("display capture has no video".into()).into());
        }
        info!(media = %media.id, "Acquired display capture");
        Ok(media)
    }

    /// Toggle every track of `kind`; returns how many were toggled
    pub fn set_track_enabled(&self, media: &LocalMedia, kind: TrackKind, enabled: bool) -> usize {
        let mut toggled = 0;
        for track in media.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            toggled += 1;
        }
        debug!(media = %media.id, ?kind, enabled, "Toggled {} tracks", toggled);
        toggled
    }

    /// Stop every track of `media`
    pub fn release(&self, mut media: LocalMedia) -> usize {
        let stopped = media.stop_all();
        info!(media = %media.id, "Released local media ({} tracks)", stopped);
        stopped
    }
}
