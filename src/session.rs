//! Call session controller.
//!
//! [`CallSession`] owns everything belonging to one call: local media, the
//! signaling channel, the peer connection manager and the roster. It is a
//! plain state machine; inputs are fed through [`CallSession::dispatch`]
//! one at a time, so no handler ever observes state changed underneath it.
//! [`crate::handle::CallHandle`] drives it from a task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::media::{CaptureRequest, CaptureTrack, LocalMedia, MediaDeviceController};
use crate::peer::{
    ConnectionState, PeerConnectionManager, PeerEvent, PeerFactory, PeerUpdate, RemoteTrackInfo,
    Role, TrackKind, UserId,
};
use crate::signaling::{
    BroadcastTransport, ChannelEvent, PresenceMember, SignalEvent, SignalingChannel,
    SignalingMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Active,
    Ended,
}

/// Local media flags. Only changed together with the device call that
/// makes them true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaState {
    pub muted: bool,
    pub video_off: bool,
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantInfo {
    pub id: UserId,
    pub display_name: Option<String>,
    pub status: ConnectionState,
}

/// Single status for the whole call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Ended,
}

/// Externally visible call state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub active: bool,
    pub room_id: Option<String>,
    pub local_user_id: Option<UserId>,
    pub started_at: Option<DateTime<Utc>>,
    pub participant_ids: Vec<UserId>,
    pub connection_status_by_peer: BTreeMap<UserId, ConnectionState>,
    pub participants: Vec<ParticipantInfo>,
    pub media: MediaState,
    /// Signaling lost mid-call; existing connections keep running
    pub degraded: bool,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            active: false,
            room_id: None,
            local_user_id: None,
            started_at: None,
            participant_ids: Vec::new(),
            connection_status_by_peer: BTreeMap::new(),
            participants: Vec::new(),
            media: MediaState::default(),
            degraded: false,
        }
    }

    pub fn aggregate(&self) -> AggregateStatus {
        match self.state {
            CallState::Idle => return AggregateStatus::Idle,
            CallState::Ended => return AggregateStatus::Ended,
            CallState::Active => {}
        }
        let statuses: Vec<ConnectionState> =
            self.connection_status_by_peer.values().copied().collect();
        if statuses.is_empty() {
            return AggregateStatus::Connecting;
        }
        if statuses.contains(&ConnectionState::Disconnected) {
            AggregateStatus::Reconnecting
        } else if statuses.iter().any(|s| !s.is_terminal() && *s != ConnectionState::Connected) {
            AggregateStatus::Connecting
        } else if statuses.contains(&ConnectionState::Connected) {
            AggregateStatus::Connected
        } else {
            AggregateStatus::Failed
        }
    }
}

/// Notification pushed to subscribers of a call
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    PeerConnected { peer: UserId, recovered: bool },
    PeerReconnecting { peer: UserId },
    /// Terminal for this peer until [`CallSession::retry_peer`]
    PeerFailed { peer: UserId, reason: String },
    PeerLeft { peer: UserId },
    RemoteTrack { peer: UserId, track: RemoteTrackInfo },
    ConnectionProblem { peer: UserId },
    SignalingLost { reason: String },
    CallEnded,
}

/// One input for the session state machine
#[derive(Debug)]
pub enum SessionInput {
    /// Raw channel event; `None` once the subscription stream ends
    Channel(Option<ChannelEvent>),
    Peer(PeerEvent),
}

struct ActiveCall {
    room_id: String,
    local: UserId,
    started_at: DateTime<Utc>,
    channel: SignalingChannel,
    channel_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    manager: PeerConnectionManager,
    devices: MediaDeviceController,
    local_media: LocalMedia,
    display_media: Option<LocalMedia>,
    media: MediaState,
    roster: BTreeMap<UserId, ParticipantInfo>,
    degraded: bool,
    events: broadcast::Sender<CallEvent>,
}

enum Phase {
    Idle,
    Active(Box<ActiveCall>),
    Ended,
}

pub struct CallSession {
    config: CallConfig,
    devices: MediaDeviceController,
    transport: Arc<dyn BroadcastTransport>,
    factory: Arc<dyn PeerFactory>,
    phase: Phase,
    snapshot_tx: watch::Sender<CallSnapshot>,
    events_tx: broadcast::Sender<CallEvent>,
}

const EVENT_CAPACITY: usize = 256;

impl CallSession {
    pub fn new(
        config: CallConfig,
        devices: MediaDeviceController,
        transport: Arc<dyn BroadcastTransport>,
        factory: Arc<dyn PeerFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let (snapshot_tx, _) = watch::channel(CallSnapshot::idle());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            config,
            devices,
            transport,
            factory,
            phase: Phase::Idle,
            snapshot_tx,
            events_tx,
        })
    }

    pub fn state(&self) -> CallState {
        match self.phase {
            Phase::Idle => CallState::Idle,
            Phase::Active(_) => CallState::Active,
            Phase::Ended => CallState::Ended,
        }
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<CallEvent> {
        self.events_tx.clone()
    }

    pub fn prune_interval(&self) -> Duration {
        self.config.prune_interval()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        match &self.phase {
            Phase::Idle => CallSnapshot::idle(),
            Phase::Ended => CallSnapshot {
                state: CallState::Ended,
                ..CallSnapshot::idle()
            },
            Phase::Active(call) => call.snapshot(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn active(&mut self) -> Result<&mut ActiveCall> {
        match &mut self.phase {
            Phase::Active(call) => Ok(call),
            _ => Err(CallError::InvalidState("no active call".into())),
        }
    }

    /// Acquire camera and microphone, then join the room. Any failure
    /// leaves the session where it was with nothing held.
    pub async fn start_call(
        &mut self,
        room_id: &str,
        local: UserId,
        display_name: Option<String>,
    ) -> Result<()> {
        if let Phase::Active(call) = &self.phase {
            return Err(CallError::InvalidState(format!(
                "already in room {}",
                call.room_id
            )));
        }
        info!(room = room_id, user = %local, "Starting call");

        let local_media = match self.devices.acquire(CaptureRequest::AUDIO_VIDEO).await {
            Ok(media) => media,
            Err(e) => {
                warn!(room = room_id, "Media acquisition failed, not joining: {}", e);
                return Err(e);
            }
        };

        let joined =
            SignalingChannel::join(self.transport.clone(), room_id, &local, display_name).await;
        let (channel, channel_rx) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                warn!(room = room_id, "Signaling join failed, releasing media: {}", e);
                self.devices.release(local_media);
                return Err(e);
            }
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let manager =
            PeerConnectionManager::new(local.clone(), self.factory.clone(), &self.config, peer_tx);

        self.phase = Phase::Active(Box::new(ActiveCall {
            room_id: room_id.to_string(),
            local,
            started_at: Utc::now(),
            channel,
            channel_rx: Some(channel_rx),
            peer_rx,
            manager,
            devices: self.devices.clone(),
            local_media,
            display_media: None,
            media: MediaState::default(),
            roster: BTreeMap::new(),
            degraded: false,
            events: self.events_tx.clone(),
        }));
        self.publish();
        info!(room = room_id, "Call active");
        Ok(())
    }

    /// Tear down every connection, free all media and leave the room.
    /// Calling it without an active call does nothing.
    pub async fn end_call(&mut self) -> Result<()> {
        let mut call = match std::mem::replace(&mut self.phase, Phase::Ended) {
            Phase::Active(call) => call,
            other => {
                self.phase = other;
                debug!("end_call without an active call");
                return Ok(());
            }
        };

        let closed = call.manager.close_all().await;
        if let Some(display) = call.display_media.take() {
            call.devices.release(display);
        }
        let ActiveCall {
            room_id,
            mut channel,
            devices,
            local_media,
            ..
        } = *call;
        devices.release(local_media);
        if let Err(e) = channel.leave().await {
            warn!(room = %room_id, "Error leaving signaling channel: {}", e);
        }

        info!(room = %room_id, connections = closed, "Call ended");
        let _ = self.events_tx.send(CallEvent::CallEnded);
        self.publish();
        Ok(())
    }

    pub async fn set_muted(&mut self, muted: bool) -> Result<()> {
        let call = self.active()?;
        call.devices
            .set_track_enabled(&call.local_media, TrackKind::Audio, !muted);
        call.media.muted = muted;
        self.publish();
        Ok(())
    }

    /// Applies to the camera and to a running screen share alike.
    pub async fn set_video_off(&mut self, video_off: bool) -> Result<()> {
        let call = self.active()?;
        call.devices
            .set_track_enabled(&call.local_media, TrackKind::Video, !video_off);
        if let Some(display) = &call.display_media {
            call.devices
                .set_track_enabled(display, TrackKind::Video, !video_off);
        }
        call.media.video_off = video_off;
        self.publish();
        Ok(())
    }

    /// Send a display capture instead of the camera on every connection
    pub async fn start_screen_share(&mut self) -> Result<()> {
        let call = self.active()?;
        if call.media.screen_sharing {
            return Ok(());
        }
        let display = call.devices.acquire_display().await?;
        if call.media.video_off {
            call.devices
                .set_track_enabled(&display, TrackKind::Video, false);
        }
        let video = display.track(TrackKind::Video).cloned();
        call.manager.replace_video_track(video).await;
        call.display_media = Some(display);
        call.media.screen_sharing = true;
        info!(room = %call.room_id, "Screen share started");
        self.publish();
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) -> Result<()> {
        let call = self.active()?;
        let Some(display) = call.display_media.take() else {
            return Ok(());
        };
        let camera = call.local_media.track(TrackKind::Video).cloned();
        call.manager.replace_video_track(camera).await;
        call.devices.release(display);
        call.media.screen_sharing = false;
        info!(room = %call.room_id, "Screen share stopped");
        self.publish();
        Ok(())
    }

    /// Manually retry a failed peer. The elected initiator re-offers; the
    /// responder resets the peer to connecting and waits for that offer.
    pub async fn retry_peer(&mut self, peer: &UserId) -> Result<()> {
        let call = self.active()?;
        let Some(info) = call.roster.get(peer) else {
            return Err(CallError::InvalidState(format!("{peer} is not in the call")));
        };
        if !info.status.is_terminal() {
            return Err(CallError::InvalidState(format!(
                "{peer} is {}, not failed",
                info.status
            )));
        }
        if call.degraded {
            return Err(CallError::ChannelUnavailable(
                "signaling lost, cannot renegotiate".into(),
            ));
        }
        info!(peer = %peer, "Retrying peer");
        call.manager.teardown(peer).await;
        call.set_status(peer, ConnectionState::New);
        if Role::elect(&call.local, peer) == Some(Role::Initiator) {
            call.initiate(peer).await;
        }
        self.publish();
        Ok(())
    }

    /// Drop orphan candidate buffers past their lifetime
    pub fn prune(&mut self, now: Instant) -> usize {
        match &mut self.phase {
            Phase::Active(call) => call.manager.prune_orphans(now),
            _ => 0,
        }
    }

    /// Wait for the next input. Pends forever while no call is active.
    pub async fn next_input(&mut self) -> SessionInput {
        let Phase::Active(call) = &mut self.phase else {
            return std::future::pending().await;
        };
        let channel_rx = &mut call.channel_rx;
        let peer_rx = &mut call.peer_rx;
        tokio::select! {
            ev = recv_channel(channel_rx) => SessionInput::Channel(ev),
            Some(ev) = peer_rx.recv() => SessionInput::Peer(ev),
            else => std::future::pending().await,
        }
    }

    fn try_next_input(&mut self) -> Option<SessionInput> {
        let Phase::Active(call) = &mut self.phase else {
            return None;
        };
        if let Ok(ev) = call.peer_rx.try_recv() {
            return Some(SessionInput::Peer(ev));
        }
        let rx = call.channel_rx.as_mut()?;
        match rx.try_recv() {
            Ok(ev) => Some(SessionInput::Channel(Some(ev))),
            Err(TryRecvError::Disconnected) => Some(SessionInput::Channel(None)),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Dispatch every input that is ready right now; returns how many ran
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(input) = self.try_next_input() {
            self.dispatch(input).await;
            handled += 1;
        }
        handled
    }

    /// Apply one input
    pub async fn dispatch(&mut self, input: SessionInput) {
        let Phase::Active(call) = &mut self.phase else {
            debug!("Input after call ended dropped");
            return;
        };
        match input {
            SessionInput::Channel(Some(event)) => {
                if let Some(signal) = call.channel.interpret(event) {
                    call.on_signal(signal).await;
                }
            }
            SessionInput::Channel(None) => {
                call.channel_rx = None;
                let closed = ChannelEvent::Closed {
                    reason: "subscription ended".into(),
                };
                if let Some(signal) = call.channel.interpret(closed) {
                    call.on_signal(signal).await;
                }
            }
            SessionInput::Peer(event) => call.on_peer_event(event).await,
        }
        self.publish();
    }
}

async fn recv_channel(
    rx: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ActiveCall {
    fn snapshot(&self) -> CallSnapshot {
        let participants: Vec<ParticipantInfo> = self.roster.values().cloned().collect();
        CallSnapshot {
            state: CallState::Active,
            active: true,
            room_id: Some(self.room_id.clone()),
            local_user_id: Some(self.local.clone()),
            started_at: Some(self.started_at),
            participant_ids: participants.iter().map(|p| p.id.clone()).collect(),
            connection_status_by_peer: participants
                .iter()
                .map(|p| (p.id.clone(), p.status))
                .collect(),
            participants,
            media: self.media,
            degraded: self.degraded,
        }
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            debug!("No call event subscribers");
        }
    }

    fn set_status(&mut self, peer: &UserId, status: ConnectionState) {
        if let Some(info) = self.roster.get_mut(peer) {
            info.status = status;
        }
    }

    /// Mirror the manager's view of `peer` into the roster
    fn sync_status(&mut self, peer: &UserId) {
        if let Some(state) = self.manager.state_of(peer) {
            self.set_status(peer, state);
        }
    }

    fn ensure_member(&mut self, peer: &UserId, display_name: Option<String>) {
        let info = self
            .roster
            .entry(peer.clone())
            .or_insert_with(|| ParticipantInfo {
                id: peer.clone(),
                display_name: None,
                status: ConnectionState::New,
            });
        if display_name.is_some() {
            info.display_name = display_name;
        }
    }

    /// Tracks a new connection should carry; the display capture stands
    /// in for the camera while sharing.
    fn outgoing_tracks(&self) -> Vec<Arc<dyn CaptureTrack>> {
        let mut tracks: Vec<Arc<dyn CaptureTrack>> = Vec::new();
        if let Some(audio) = self.local_media.track(TrackKind::Audio) {
            tracks.push(audio.clone());
        }
        let video = self
            .display_media
            .as_ref()
            .and_then(|d| d.track(TrackKind::Video))
            .or_else(|| self.local_media.track(TrackKind::Video));
        if let Some(video) = video {
            tracks.push(video.clone());
        }
        tracks
    }

    async fn send(&self, message: SignalingMessage) {
        if !self.channel.is_open() {
            debug!(kind = message.kind(), to = %message.to(), "Signaling closed, message not sent");
            return;
        }
        if let Err(e) = self.channel.send(&message).await {
            warn!(
                kind = message.kind(),
                to = %message.to(),
                "Failed to send signaling message: {}",
                e
            );
        }
    }

    fn peer_failed(&mut self, peer: &UserId, reason: String) {
        warn!(peer = %peer, "Peer failed: {}", reason);
        self.set_status(peer, ConnectionState::Failed);
        self.emit(CallEvent::PeerFailed {
            peer: peer.clone(),
            reason,
        });
    }

    async fn initiate(&mut self, peer: &UserId) {
        let tracks = self.outgoing_tracks();
        match self.manager.initiate(peer, &tracks).await {
            Ok(Some(offer)) => {
                self.sync_status(peer);
                self.send(offer).await;
            }
            Ok(None) => {}
            Err(e) => self.peer_failed(peer, e.to_string()),
        }
    }

    async fn on_signal(&mut self, signal: SignalEvent) {
        match signal {
            SignalEvent::Presence { joined, left } => {
                for peer in left {
                    self.on_peer_left(&peer).await;
                }
                for member in joined {
                    self.on_peer_joined(member).await;
                }
            }
            SignalEvent::Message(message) => self.on_message(message).await,
            SignalEvent::Lost(reason) => {
                warn!(room = %self.room_id, "Signaling lost, continuing degraded: {}", reason);
                self.degraded = true;
                self.emit(CallEvent::SignalingLost { reason });
            }
        }
    }

    async fn on_peer_joined(&mut self, member: PresenceMember) {
        let peer = member.user_id;
        if peer == self.local {
            return;
        }
        self.manager.mark_present(&peer);
        let rejoined = self
            .roster
            .get(&peer)
            .map(|p| p.status.is_terminal())
            .unwrap_or(false);
        self.ensure_member(&peer, member.display_name);
        if rejoined && !self.manager.contains(&peer) {
            self.set_status(&peer, ConnectionState::New);
        }
        info!(room = %self.room_id, peer = %peer, "Participant joined");

        match Role::elect(&self.local, &peer) {
            Some(Role::Initiator) => {
                if !self.manager.contains(&peer) {
                    self.initiate(&peer).await;
                }
            }
            Some(Role::Responder) => debug!(peer = %peer, "Waiting for offer"),
            None => warn!(peer = %peer, "Remote participant shares our id, ignoring"),
        }
    }

    async fn on_peer_left(&mut self, peer: &UserId) {
        let had_connection = self.manager.mark_departed(peer).await;
        let was_member = self.roster.remove(peer).is_some();
        if had_connection || was_member {
            info!(room = %self.room_id, peer = %peer, "Participant left");
            self.emit(CallEvent::PeerLeft { peer: peer.clone() });
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer { from, payload, .. } => {
                let listed = self.channel.members().any(|m| m.user_id == from);
                if self.manager.is_departed(&from) && !listed {
                    debug!(peer = %from, "Stale offer from departed peer discarded");
                    return;
                }
                self.manager.mark_present(&from);
                self.ensure_member(&from, None);
                let tracks = self.outgoing_tracks();
                match self.manager.handle_offer(&from, payload, &tracks).await {
                    Ok(Some(answer)) => {
                        self.sync_status(&from);
                        self.send(answer).await;
                    }
                    Ok(None) => {}
                    Err(e) => self.peer_failed(&from, e.to_string()),
                }
            }
            SignalingMessage::Answer { from, payload, .. } => {
                match self.manager.handle_answer(&from, payload).await {
                    Ok(()) => self.sync_status(&from),
                    Err(e) => self.peer_failed(&from, e.to_string()),
                }
            }
            SignalingMessage::IceCandidate { from, payload, .. } => {
                self.manager.handle_ice_candidate(&from, payload).await;
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let peer = event.remote.clone();
        let Some(update) = self.manager.handle_peer_event(event) else {
            return;
        };
        match update {
            PeerUpdate::Connected { recovered } => {
                self.sync_status(&peer);
                info!(peer = %peer, recovered, "Peer connected");
                self.emit(CallEvent::PeerConnected { peer, recovered });
            }
            PeerUpdate::Reconnecting => {
                self.sync_status(&peer);
                self.emit(CallEvent::PeerReconnecting { peer });
            }
            PeerUpdate::ConnectionProblem => {
                self.emit(CallEvent::ConnectionProblem { peer });
            }
            PeerUpdate::Failed => {
                self.manager.teardown(&peer).await;
                let failure = CallError::IceFailure { peer: peer.clone() };
                self.peer_failed(&peer, failure.to_string());
            }
            PeerUpdate::Closed => {
                self.manager.teardown(&peer).await;
                self.set_status(&peer, ConnectionState::Closed);
            }
            PeerUpdate::LocalCandidate(candidate) => {
                let message = SignalingMessage::IceCandidate {
                    from: self.local.clone(),
                    to: peer,
                    payload: candidate,
                };
                self.send(message).await;
            }
            PeerUpdate::RemoteTrack(track) => {
                self.emit(CallEvent::RemoteTrack { peer, track });
            }
        }
    }
}
