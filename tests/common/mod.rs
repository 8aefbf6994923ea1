//! Scripted peers and capture devices for call scenarios
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use roomcall::error::{CallError, DeviceError, Result};
use roomcall::media::{CaptureRequest, CaptureTrack, MediaDeviceController, MediaSource};
use roomcall::peer::{
    IceCandidate, IceConnectionState, PeerEventKind, PeerEventSink, PeerFactory, PeerTransport,
    SessionDescription, TrackKind, UserId,
};
use roomcall::{CallConfig, CallSession, MemoryHub};

pub const ROOM: &str = "R1";

#[derive(Debug, Default, Clone)]
pub struct FakePeerState {
    pub local_desc: Option<SessionDescription>,
    pub remote_desc: Option<SessionDescription>,
    pub applied: Vec<IceCandidate>,
    /// Candidates offered before any remote description
    pub premature: usize,
    pub offers: usize,
    pub answers: usize,
    pub tracks: Vec<String>,
    pub video_track: Option<String>,
    pub closed: bool,
    connected: bool,
}

/// Peer that "connects" as soon as both descriptions are in place
pub struct FakePeer {
    pub local: UserId,
    pub remote: UserId,
    sink: PeerEventSink,
    state: Mutex<FakePeerState>,
}

impl FakePeer {
    pub fn state(&self) -> FakePeerState {
        self.state.lock().clone()
    }

    pub fn connection_id(&self) -> u64 {
        self.sink.connection_id()
    }

    /// Inject an event as if the underlying connection raised it
    pub fn emit(&self, kind: PeerEventKind) {
        self.sink.emit(kind);
    }

    fn maybe_connect(&self) {
        let mut state = self.state.lock();
        if state.connected || state.local_desc.is_none() || state.remote_desc.is_none() {
            return;
        }
        state.connected = true;
        drop(state);
        self.sink
            .emit(PeerEventKind::IceState(IceConnectionState::Checking));
        self.sink
            .emit(PeerEventKind::IceState(IceConnectionState::Connected));
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_tracks(&self, tracks: &[Arc<dyn CaptureTrack>]) -> Result<()> {
        let mut state = self.state.lock();
        for track in tracks {
            state.tracks.push(track.id().to_string());
            if track.kind() == TrackKind::Video {
                state.video_track = Some(track.id().to_string());
            }
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<dyn CaptureTrack>>) -> Result<()> {
        self.state.lock().video_track = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 offer {}->{} conn {} #{}",
            self.local,
            self.remote,
            self.sink.connection_id(),
            state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0 answer {}->{} conn {} #{}",
            self.local,
            self.remote,
            self.sink.connection_id(),
            state.answers
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let first = {
            let mut state = self.state.lock();
            let first = state.local_desc.is_none();
            state.local_desc = Some(desc);
            first
        };
        if first {
            self.sink.emit(PeerEventKind::LocalCandidate(IceCandidate::new(format!(
                "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host ufrag {}",
                self.local
            ))));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.lock().remote_desc = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::negotiation(&self.remote, "connection closed"));
        }
        if state.remote_desc.is_none() {
            state.premature += 1;
            return Err(CallError::negotiation(&self.remote, "no remote description"));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Every fake peer created in a test, across participants
#[derive(Clone, Default)]
pub struct FakeNetwork {
    peers: Arc<Mutex<Vec<Arc<FakePeer>>>>,
}

impl FakeNetwork {
    pub fn factory(&self, local: &str) -> Arc<FakeFactory> {
        Arc::new(FakeFactory {
            local: UserId::from(local),
            network: self.clone(),
        })
    }

    /// Most recent connection `local` opened towards `remote`
    pub fn peer(&self, local: &str, remote: &str) -> Option<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|p| p.local.as_str() == local && p.remote.as_str() == remote)
            .cloned()
    }

    pub fn peers_of(&self, local: &str) -> Vec<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .filter(|p| p.local.as_str() == local)
            .cloned()
            .collect()
    }

    /// Offers `local` created towards `remote`, over all connection instances
    pub fn offers(&self, local: &str, remote: &str) -> usize {
        self.peers
            .lock()
            .iter()
            .filter(|p| p.local.as_str() == local && p.remote.as_str() == remote)
            .map(|p| p.state().offers)
            .sum()
    }
}

pub struct FakeFactory {
    local: UserId,
    network: FakeNetwork,
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
        let peer = Arc::new(FakePeer {
            local: self.local.clone(),
            remote: sink.remote().clone(),
            sink,
            state: Mutex::new(FakePeerState::default()),
        });
        self.network.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl CaptureTrack for FakeTrack {
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
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.stops() == 0
    }
}

/// Capture devices that can refuse permission and remember every track
#[derive(Default)]
pub struct FakeDevices {
    pub deny: AtomicBool,
    opened: Mutex<Vec<Arc<FakeTrack>>>,
    requests: AtomicUsize,
}

impl FakeDevices {
    pub fn denying() -> Self {
        let devices = Self::default();
        devices.deny.store(true, Ordering::SeqCst);
        devices
    }

    pub fn opened(&self) -> Vec<Arc<FakeTrack>> {
        self.opened.lock().clone()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn track(&self, id_prefix: &str) -> Option<Arc<FakeTrack>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|t| t.id.starts_with(id_prefix))
            .cloned()
    }

    fn open(&self, kind: TrackKind, label: &str) -> Arc<dyn CaptureTrack> {
        let mut opened = self.opened.lock();
        let track = Arc::new(FakeTrack {
            id: format!("{label}-{}", opened.len()),
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        });
        opened.push(track.clone());
        track
    }
}

#[async_trait]
impl MediaSource for FakeDevices {
    async fn open_devices(
        &self,
        request: CaptureRequest,
    ) -> std::result::Result<Vec<Arc<dyn CaptureTrack>>, DeviceError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied("camera and microphone".into()));
        }
        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(self.open(TrackKind::Audio, "mic"));
        }
        if request.video {
            tracks.push(self.open(TrackKind::Video, "camera"));
        }
        Ok(tracks)
    }

    async fn open_display(&self) -> std::result::Result<Vec<Arc<dyn CaptureTrack>>, DeviceError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied("display".into()));
        }
        Ok(vec![self.open(TrackKind::Video, "screen")])
    }
}

pub struct Participant {
    pub id: UserId,
    pub session: CallSession,
    pub devices: Arc<FakeDevices>,
}

impl Participant {
    pub fn new(hub: &MemoryHub, network: &FakeNetwork, id: &str) -> Self {
        Self::with_devices(hub, network, id, FakeDevices::default())
    }

    pub fn with_devices(
        hub: &MemoryHub,
        network: &FakeNetwork,
        id: &str,
        devices: FakeDevices,
    ) -> Self {
        let devices = Arc::new(devices);
        let session = CallSession::new(
            CallConfig::default(),
            MediaDeviceController::new(devices.clone()),
            hub.transport(),
            network.factory(id),
        )
        .unwrap();
        Self {
            id: UserId::from(id),
            session,
            devices,
        }
    }

    pub async fn join(&mut self) -> Result<()> {
        let display_name = Some(self.id.as_str().to_uppercase());
        self.session
            .start_call(ROOM, self.id.clone(), display_name)
            .await
    }
}

/// Pump every participant until nobody has anything left to process
pub async fn settle(participants: &mut [&mut Participant]) {
    for _ in 0..200 {
        let mut handled = 0;
        for p in participants.iter_mut() {
            handled += p.session.pump().await;
        }
        if handled == 0 {
            return;
        }
    }
    panic!("participants never went quiet");
}
