//! Sample-fed capture tracks backed by WebRTC static sample tracks

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{CaptureRequest, CaptureTrack, MediaSource};
use crate::error::{CallError, DeviceError, Result};
use crate::peer::types::TrackKind;
use crate::utils::random_id;

/// Create RTP codec capability for audio (Opus)
pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Create RTP codec capability for video (VP8)
pub fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Capture track whose media is pushed in by the host as encoded samples
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl SampleTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let capability = match kind {
            TrackKind::Audio => audio_codec_capability(),
            TrackKind::Video => video_codec_capability(),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.into(),
        ));
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Write one encoded sample. Disabled or stopped tracks swallow the
    /// sample and return `Ok(false)`.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_live() || !self.is_enabled() {
            trace!(track = %self.id, "Sample dropped (muted or stopped)");
            return Ok(false);
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| CallError::Device(DeviceError::Other(format!("write sample: {e}"))))?;
        Ok(true)
    }
}

impl CaptureTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!(track = %self.id, "Sample track stopped");
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn rtp_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.track.clone())
    }
}

/// [`MediaSource`] handing out [`SampleTrack`]s. The host keeps the tracks
/// (via the returned handles) and feeds them from its own capture pipeline.
pub struct SampleSource {
    stream_id: String,
    display_supported: bool,
}

impl SampleSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            display_supported: true,
        }
    }

    pub fn without_display(mut self) -> Self {
        self.display_supported = false;
        self
    }

    fn track(&self, kind: TrackKind, label: &str) -> Arc<dyn CaptureTrack> {
        Arc::new(SampleTrack::new(
            kind,
            format!("{label}-{}", random_id()),
            self.stream_id.clone(),
        ))
    }
}

#[async_trait]
impl MediaSource for SampleSource {
    async fn open_devices(
        &self,
        request: CaptureRequest,
    ) -> std::result::Result<Vec<Arc<dyn CaptureTrack>>, DeviceError> {
        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(self.track(TrackKind::Audio, "mic"));
        }
        if request.video {
            tracks.push(self.track(TrackKind::Video, "camera"));
        }
        Ok(tracks)
    }

    async fn open_display(&self) -> std::result::Result<Vec<Arc<dyn CaptureTrack>>, DeviceError> {
        if !self.display_supported {
            return Err(DeviceError::Unsupported("display capture".into()));
        }
        Ok(vec![self.track(TrackKind::Video, "screen")])
    }
}
