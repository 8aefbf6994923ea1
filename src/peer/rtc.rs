//! [`PeerTransport`] backed by webrtc-rs

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use super::transport::{PeerEventKind, PeerEventSink, PeerFactory, PeerTransport};
use super::types::{
    IceCandidate, IceConnectionState, RemoteTrackInfo, SdpType, SessionDescription, TrackKind,
    UserId,
};
use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::{log_candidate, log_selected_pair, summarize_candidates};
use crate::media::CaptureTrack;

/// Remote media handed to the host for rendering
#[derive(Clone)]
pub struct RemoteMedia {
    pub peer: UserId,
    pub track: Arc<TrackRemote>,
}

/// Creates [`RtcPeer`]s sharing one configured webrtc API
pub struct RtcPeerFactory {
    api: API,
    config: CallConfig,
    remote_media: Option<mpsc::UnboundedSender<RemoteMedia>>,
}

impl RtcPeerFactory {
    pub fn new(config: CallConfig) -> Result<Self> {
        config.validate()?;
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::Config(format!("register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| CallError::Config(format!("register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            config,
            remote_media: None,
        })
    }

    /// Forward incoming remote tracks to `tx`
    pub fn with_remote_media(mut self, tx: mpsc::UnboundedSender<RemoteMedia>) -> Self {
        self.remote_media = Some(tx);
        self
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.config.rtc_ice_servers(),
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
        let remote = sink.remote().clone();
        let pc = self
            .api
            .new_peer_connection(self.rtc_config())
            .await
            .map_err(|e| CallError::negotiation(&remote, format!("new peer connection: {e}")))?;
        let peer = Arc::new(RtcPeer {
            remote,
            pc: Arc::new(pc),
            video_sender: Mutex::new(None),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
        });
        peer.attach_handlers(sink, self.remote_media.clone());
        Ok(peer)
    }
}

/// One webrtc-rs peer connection
pub struct RtcPeer {
    remote: UserId,
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn map_track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

impl RtcPeer {
    fn fail(&self, what: &str, e: impl std::fmt::Display) -> CallError {
        CallError::negotiation(&self.remote, format!("{what}: {e}"))
    }

    fn to_rtc(&self, desc: SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        parsed.map_err(|e| self.fail("parse sdp", e))
    }

    fn from_rtc(&self, desc: RTCSessionDescription) -> Result<SessionDescription> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
            other => Err(self.fail("unexpected sdp type", other)),
        }
    }

    fn attach_handlers(
        &self,
        sink: PeerEventSink,
        remote_media: Option<mpsc::UnboundedSender<RemoteMedia>>,
    ) {
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));

        let candidate_sink = sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            };
                            log_candidate("LOCAL", &candidate);
                            gathered.lock().push(candidate.clone());
                            candidate_sink.emit(PeerEventKind::LocalCandidate(candidate));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    },
                    None => {
                        let all = std::mem::take(&mut *gathered.lock());
                        summarize_candidates(&all);
                        candidate_sink.emit(PeerEventKind::GatheringComplete);
                    }
                }
                Box::pin(async {})
            }));

        let state_sink = sink.clone();
        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&self.pc);
        self.pc
            .on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
                debug!(peer = %state_sink.remote(), "ICE connection state changed to: {:?}", st);
                if st == RTCIceConnectionState::Failed {
                    if let Some(pc) = weak_pc.upgrade() {
                        tokio::spawn(async move {
                            log_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                if let Some(state) = map_ice_state(st) {
                    state_sink.emit(PeerEventKind::IceState(state));
                }
                Box::pin(async {})
            }));

        let track_sink = sink;
        let tracks = self.remote_tracks.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            match map_track_kind(track.kind()) {
                Some(kind) => {
                    info!(
                        peer = %track_sink.remote(),
                        "Remote track: id={} stream={} kind={:?}",
                        track.id(),
                        track.stream_id(),
                        kind
                    );
                    tracks.lock().push(track.clone());
                    if let Some(tx) = &remote_media {
                        let media = RemoteMedia {
                            peer: track_sink.remote().clone(),
                            track: track.clone(),
                        };
                        if tx.send(media).is_err() {
                            debug!("Remote media receiver gone");
                        }
                    }
                    track_sink.emit(PeerEventKind::RemoteTrack(RemoteTrackInfo {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                }
                None => warn!("Ignoring remote track of unknown kind"),
            }
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn add_tracks(&self, tracks: &[Arc<dyn CaptureTrack>]) -> Result<()> {
        for track in tracks {
            let Some(rtp) = track.rtp_track() else {
                debug!(track = track.id(), "Capture track has no RTP output, skipping");
                continue;
            };
            let sender = self
                .pc
                .add_track(rtp)
                .await
                .map_err(|e| self.fail("add track", e))?;
            if track.kind() == TrackKind::Video {
                *self.video_sender.lock() = Some(sender);
            }
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<dyn CaptureTrack>>) -> Result<()> {
        let sender = self.video_sender.lock().clone();
        let Some(sender) = sender else {
            return Err(CallError::InvalidState(format!(
                "no video sender towards {}",
                self.remote
            )));
        };
        let rtp = track.and_then(|t| t.rtp_track());
        sender
            .replace_track(rtp)
            .await
            .map_err(|e| self.fail("replace track", e))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| self.fail("create offer", e))?;
        self.from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| self.fail("create answer", e))?;
        self.from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = self.to_rtc(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| self.fail("set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = self.to_rtc(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| self.fail("set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| self.fail("add ice candidate", e))
    }

    async fn close(&self) -> Result<()> {
        self.remote_tracks.lock().clear();
        self.video_sender.lock().take();
        self.pc
            .close()
            .await
            .map_err(|e| self.fail("close", e))
    }
}
