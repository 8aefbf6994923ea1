//! Per-participant connection lifecycle

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::ice::{apply_candidates, CandidateBuffer, OrphanCandidates};
use super::transport::{PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerTransport};
use super::types::{
    ConnectionState, IceCandidate, IceConnectionState, RemoteTrackInfo, Role, SessionDescription,
    UserId,
};
use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::media::CaptureTrack;
use crate::signaling::SignalingMessage;

/// Connection to one remote participant
pub struct ParticipantConnection {
    remote: UserId,
    id: u64,
    transport: Arc<dyn PeerTransport>,
    role: Role,
    state: ConnectionState,
    ice_state: IceConnectionState,
    candidates: CandidateBuffer,
    remote_description: Option<SessionDescription>,
    remote_tracks: Vec<RemoteTrackInfo>,
    grace_timer: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl ParticipantConnection {
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice_state
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrackInfo] {
        &self.remote_tracks
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn cancel_grace_timer(&mut self) {
        if let Some(handle) = self.grace_timer.take() {
            debug!(peer = %self.remote, "Aborting pending grace timer");
            handle.abort();
        }
    }
}

/// What a peer event means for the call
#[derive(Debug, Clone, PartialEq)]
pub enum PeerUpdate {
    Connected { recovered: bool },
    Reconnecting,
    /// Still disconnected after the grace period
    ConnectionProblem,
    Failed,
    Closed,
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrackInfo),
}

/// Owns every [`ParticipantConnection`] of a call, keyed by remote id.
pub struct PeerConnectionManager {
    local: UserId,
    factory: Arc<dyn PeerFactory>,
    connections: HashMap<UserId, ParticipantConnection>,
    orphans: OrphanCandidates,
    departed: HashSet<UserId>,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_connection_id: u64,
    max_buffered: usize,
    negotiation_timeout: Duration,
    grace_period: Duration,
}

impl PeerConnectionManager {
    pub fn new(
        local: UserId,
        factory: Arc<dyn PeerFactory>,
        config: &CallConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local,
            factory,
            connections: HashMap::new(),
            orphans: OrphanCandidates::new(
                config.max_buffered_candidates,
                config.orphan_candidate_ttl(),
            ),
            departed: HashSet::new(),
            events,
            next_connection_id: 1,
            max_buffered: config.max_buffered_candidates,
            negotiation_timeout: config.negotiation_timeout(),
            grace_period: config.grace_period(),
        }
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    pub fn get(&self, remote: &UserId) -> Option<&ParticipantConnection> {
        self.connections.get(remote)
    }

    pub fn state_of(&self, remote: &UserId) -> Option<ConnectionState> {
        self.connections.get(remote).map(|c| c.state)
    }

    pub fn contains(&self, remote: &UserId) -> bool {
        self.connections.contains_key(remote)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn remotes(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn orphan_candidates(&self, remote: &UserId) -> usize {
        self.orphans.pending(remote)
    }

    /// The peer is present again; its candidates are no longer stale.
    pub fn mark_present(&mut self, remote: &UserId) {
        self.departed.remove(remote);
    }

    pub fn is_departed(&self, remote: &UserId) -> bool {
        self.departed.contains(remote)
    }

    /// The peer left: tear down and treat late messages from it as stale.
    pub async fn mark_departed(&mut self, remote: &UserId) -> bool {
        self.departed.insert(remote.clone());
        self.teardown(remote).await
    }

    async fn timed<T, F>(&self, remote: &UserId, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.negotiation_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(CallError::Negotiation { reason, .. })) => {
                Err(CallError::negotiation(remote, format!("{what}: {reason}")))
            }
            Ok(Err(e)) => Err(CallError::negotiation(remote, format!("{what}: {e}"))),
            Err(_) => Err(CallError::negotiation(remote, format!("{what} timed out"))),
        }
    }

    async fn create_connection(
        &mut self,
        remote: &UserId,
        role: Role,
        tracks: &[Arc<dyn CaptureTrack>],
    ) -> Result<Arc<dyn PeerTransport>> {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let sink = PeerEventSink::new(remote.clone(), id, self.events.clone());
        let transport = self
            .timed(remote, "create peer connection", self.factory.create(sink))
            .await?;

        if let Err(e) = self
            .timed(remote, "attach local tracks", transport.add_tracks(tracks))
            .await
        {
            if let Err(close_err) = transport.close().await {
                debug!(peer = %remote, "Close after failed setup: {}", close_err);
            }
            return Err(e);
        }

        let mut candidates = CandidateBuffer::new(self.max_buffered);
        if let Some(early) = self.orphans.adopt(remote) {
            debug!(peer = %remote, "Adopting {} early candidates", early.len());
            candidates.extend(early);
        }
        self.departed.remove(remote);

        info!(peer = %remote, connection = id, ?role, "Created peer connection");
        self.connections.insert(
            remote.clone(),
            ParticipantConnection {
                remote: remote.clone(),
                id,
                transport: transport.clone(),
                role,
                state: ConnectionState::New,
                ice_state: IceConnectionState::New,
                candidates,
                remote_description: None,
                remote_tracks: Vec::new(),
                grace_timer: None,
                created_at: Instant::now(),
            },
        );
        Ok(transport)
    }

    fn set_state(&mut self, remote: &UserId, state: ConnectionState) {
        if let Some(conn) = self.connections.get_mut(remote) {
            debug!(peer = %remote, from = %conn.state, to = %state, "Connection state");
            conn.state = state;
        }
    }

    /// Record the remote description and flush buffered candidates, once.
    async fn remote_description_applied(&mut self, remote: &UserId, desc: SessionDescription) {
        let Some(conn) = self.connections.get_mut(remote) else {
            return;
        };
        conn.remote_description = Some(desc);
        let pending = conn.candidates.take();
        let transport = conn.transport.clone();
        apply_candidates(remote, transport.as_ref(), pending).await;
    }

    /// Create a connection as initiator and produce the offer to send.
    /// Returns `None` when a live connection to `remote` already exists.
    pub async fn initiate(
        &mut self,
        remote: &UserId,
        tracks: &[Arc<dyn CaptureTrack>],
    ) -> Result<Option<SignalingMessage>> {
        match self.state_of(remote) {
            Some(state) if !state.is_terminal() => {
                debug!(peer = %remote, state = %state, "Connection exists, not initiating");
                return Ok(None);
            }
            Some(_) => {
                self.teardown(remote).await;
            }
            None => {}
        }

        match self.negotiate_offer(remote, tracks).await {
            Ok(offer) => Ok(Some(SignalingMessage::Offer {
                from: self.local.clone(),
                to: remote.clone(),
                payload: offer,
            })),
            Err(e) => {
                warn!(peer = %remote, "Initiate failed: {}", e);
                self.teardown(remote).await;
                Err(e)
            }
        }
    }

    async fn negotiate_offer(
        &mut self,
        remote: &UserId,
        tracks: &[Arc<dyn CaptureTrack>],
    ) -> Result<SessionDescription> {
        let transport = self.create_connection(remote, Role::Initiator, tracks).await?;
        let offer = self
            .timed(remote, "create offer", transport.create_offer())
            .await?;
        self.timed(
            remote,
            "set local offer",
            transport.set_local_description(offer.clone()),
        )
        .await?;
        self.set_state(remote, ConnectionState::Offering);
        Ok(offer)
    }

    /// Answer an offer, creating a responder connection if needed.
    /// Returns `None` when the offer is a duplicate or arrives for a pair
    /// where we are the initiator.
    pub async fn handle_offer(
        &mut self,
        remote: &UserId,
        offer: SessionDescription,
        tracks: &[Arc<dyn CaptureTrack>],
    ) -> Result<Option<SignalingMessage>> {
        let existing = self
            .connections
            .get(remote)
            .map(|c| (c.state, c.role, c.remote_description.clone()));
        if let Some((state, role, applied)) = existing {
            if state.is_terminal() {
                self.teardown(remote).await;
            } else if role == Role::Initiator {
                warn!(peer = %remote, "Ignoring offer from peer we are offering to");
                return Ok(None);
            } else if applied.as_ref() == Some(&offer) {
                debug!(peer = %remote, "Duplicate offer ignored");
                return Ok(None);
            } else if applied.is_some() {
                info!(peer = %remote, "New offer from peer, rebuilding connection");
                self.teardown(remote).await;
            }
        }

        match self.negotiate_answer(remote, offer, tracks).await {
            Ok(answer) => Ok(Some(SignalingMessage::Answer {
                from: self.local.clone(),
                to: remote.clone(),
                payload: answer,
            })),
            Err(e) => {
                warn!(peer = %remote, "Answering offer failed: {}", e);
                self.teardown(remote).await;
                Err(e)
            }
        }
    }

    async fn negotiate_answer(
        &mut self,
        remote: &UserId,
        offer: SessionDescription,
        tracks: &[Arc<dyn CaptureTrack>],
    ) -> Result<SessionDescription> {
        let existing = self.connections.get(remote).map(|c| c.transport.clone());
        let transport = match existing {
            Some(transport) => transport,
            None => {
                self.create_connection(remote, Role::Responder, tracks)
                    .await?
            }
        };
        self.set_state(remote, ConnectionState::Answering);

        self.timed(
            remote,
            "set remote offer",
            transport.set_remote_description(offer.clone()),
        )
        .await?;
        self.remote_description_applied(remote, offer).await;

        let answer = self
            .timed(remote, "create answer", transport.create_answer())
            .await?;
        self.timed(
            remote,
            "set local answer",
            transport.set_local_description(answer.clone()),
        )
        .await?;
        self.set_state(remote, ConnectionState::Negotiating);
        Ok(answer)
    }

    /// Apply an answer to our offer. Answers with no matching offering
    /// connection are stale and dropped.
    pub async fn handle_answer(
        &mut self,
        remote: &UserId,
        answer: SessionDescription,
    ) -> Result<()> {
        let transport = match self.connections.get(remote) {
            None => {
                debug!(peer = %remote, "Stale answer for unknown peer discarded");
                return Ok(());
            }
            Some(conn) if conn.state != ConnectionState::Offering => {
                debug!(peer = %remote, state = %conn.state, "Unexpected answer discarded");
                return Ok(());
            }
            Some(conn) => conn.transport.clone(),
        };

        let applied = self
            .timed(
                remote,
                "set remote answer",
                transport.set_remote_description(answer.clone()),
            )
            .await;
        match applied {
            Ok(()) => {
                self.set_state(remote, ConnectionState::Negotiating);
                self.remote_description_applied(remote, answer).await;
                Ok(())
            }
            Err(e) => {
                warn!(peer = %remote, "Applying answer failed: {}", e);
                self.teardown(remote).await;
                Err(e)
            }
        }
    }

    /// Apply the candidate now if the connection has a remote description,
    /// otherwise queue it.
    pub async fn handle_ice_candidate(&mut self, remote: &UserId, candidate: IceCandidate) {
        let Some(conn) = self.connections.get_mut(remote) else {
            if self.departed.contains(remote) {
                debug!(peer = %remote, "Stale candidate from departed peer discarded");
            } else {
                debug!(peer = %remote, "Candidate before connection, holding");
                self.orphans.push(remote, candidate);
            }
            return;
        };

        if conn.remote_description.is_none() {
            if conn.candidates.push(candidate) {
                debug!(peer = %remote, "Remote description not set yet, queuing candidate");
            } else {
                warn!(peer = %remote, "Candidate buffer full, dropping candidate");
            }
            return;
        }

        let transport = conn.transport.clone();
        apply_candidates(remote, transport.as_ref(), vec![candidate]).await;
    }

    /// Close and forget the connection to `remote`. Safe to call repeatedly
    /// or for peers that never had a connection.
    pub async fn teardown(&mut self, remote: &UserId) -> bool {
        self.orphans.discard(remote);
        let Some(mut conn) = self.connections.remove(remote) else {
            return false;
        };
        conn.cancel_grace_timer();
        conn.candidates.clear();
        conn.remote_tracks.clear();
        if let Err(e) = conn.transport.close().await {
            debug!(peer = %remote, "Error closing peer connection: {}", e);
        }
        info!(peer = %remote, connection = conn.id, "Peer connection torn down");
        true
    }

    /// Tear down everything; returns how many connections were closed
    pub async fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for remote in self.remotes() {
            if self.teardown(&remote).await {
                closed += 1;
            }
        }
        self.orphans.clear();
        self.departed.clear();
        closed
    }

    /// Swap outgoing video on every connection; per-peer failures are logged
    pub async fn replace_video_track(&self, track: Option<Arc<dyn CaptureTrack>>) {
        for (remote, conn) in &self.connections {
            if let Err(e) = conn.transport.replace_video_track(track.clone()).await {
                warn!(peer = %remote, "Failed to replace video track: {}", e);
            }
        }
    }

    pub fn prune_orphans(&mut self, now: Instant) -> usize {
        self.orphans.prune(now)
    }

    fn arm_grace_timer(
        conn: &mut ParticipantConnection,
        grace: Duration,
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) {
        if conn.grace_timer.is_some() {
            debug!(peer = %conn.remote, "Grace timer already pending");
            return;
        }
        let sink = PeerEventSink::new(conn.remote.clone(), conn.id, events.clone());
        conn.grace_timer = Some(tokio::spawn(async move {
            sleep(grace).await;
            sink.emit(PeerEventKind::GracePeriodElapsed);
        }));
    }

    /// Fold a peer event into connection state. Events from connections
    /// that no longer exist are dropped.
    pub fn handle_peer_event(&mut self, event: PeerEvent) -> Option<PeerUpdate> {
        let remote = event.remote;
        let Some(conn) = self.connections.get_mut(&remote) else {
            debug!(peer = %remote, "Event for closed connection dropped");
            return None;
        };
        if conn.id != event.connection_id {
            debug!(
                peer = %remote,
                stale = event.connection_id,
                current = conn.id,
                "Event from replaced connection dropped"
            );
            return None;
        }

        match event.kind {
            PeerEventKind::IceState(ice) => {
                conn.ice_state = ice;
                let previous = conn.state;
                let next = previous.on_ice(ice);
                if next == previous {
                    return None;
                }
                info!(
                    peer = %remote,
                    ice = %ice,
                    from = %previous,
                    to = %next,
                    "Peer connection state changed"
                );
                conn.state = next;
                match next {
                    ConnectionState::Connected => {
                        conn.cancel_grace_timer();
                        Some(PeerUpdate::Connected {
                            recovered: previous == ConnectionState::Disconnected,
                        })
                    }
                    ConnectionState::Disconnected => {
                        Self::arm_grace_timer(conn, self.grace_period, &self.events);
                        Some(PeerUpdate::Reconnecting)
                    }
                    ConnectionState::Failed => {
                        conn.cancel_grace_timer();
                        Some(PeerUpdate::Failed)
                    }
                    ConnectionState::Closed => {
                        conn.cancel_grace_timer();
                        Some(PeerUpdate::Closed)
                    }
                    _ => None,
                }
            }
            PeerEventKind::LocalCandidate(candidate) => Some(PeerUpdate::LocalCandidate(candidate)),
            PeerEventKind::GatheringComplete => {
                debug!(peer = %remote, "ICE gathering complete");
                None
            }
            PeerEventKind::RemoteTrack(info) => {
                conn.remote_tracks.push(info.clone());
                Some(PeerUpdate::RemoteTrack(info))
            }
            PeerEventKind::GracePeriodElapsed => {
                conn.grace_timer = None;
                if conn.state == ConnectionState::Disconnected {
                    warn!(peer = %remote, "Still disconnected after grace period");
                    Some(PeerUpdate::ConnectionProblem)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::TrackKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Calls {
        applied: Vec<IceCandidate>,
        closed: usize,
        remote_set: usize,
    }

    struct FakeTransport {
        calls: Arc<Mutex<Calls>>,
        fail_answer: bool,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn add_tracks(&self, _tracks: &[Arc<dyn CaptureTrack>]) -> Result<()> {
            Ok(())
        }
        async fn replace_video_track(&self, _track: Option<Arc<dyn CaptureTrack>>) -> Result<()> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("offer-sdp"))
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            if self.fail_answer {
                return Err(CallError::negotiation(&UserId::from("x"), "no codecs"));
            }
            Ok(SessionDescription::answer("answer-sdp"))
        }
        async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
            self.calls.lock().remote_set += 1;
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if candidate.candidate.contains("bad") {
                return Err(CallError::negotiation(&UserId::from("x"), "malformed"));
            }
            self.calls.lock().applied.push(candidate);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.calls.lock().closed += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        calls: Arc<Mutex<Calls>>,
        fail_answer: bool,
    }

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn create(&self, _sink: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
            Ok(Arc::new(FakeTransport {
                calls: self.calls.clone(),
                fail_answer: self.fail_answer,
            }))
        }
    }

    fn manager(
        factory: FakeFactory,
    ) -> (PeerConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = CallConfig::default();
        (
            PeerConnectionManager::new(UserId::from("a"), Arc::new(factory), &config, tx),
            rx,
        )
    }

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn test_initiator_buffers_until_answer() {
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let (mut mgr, _rx) = manager(factory);
        let b = UserId::from("b");

        let offer = mgr.initiate(&b, &[]).await.unwrap().unwrap();
        assert_eq!(offer.kind(), "offer");
        assert_eq!(mgr.state_of(&b), Some(ConnectionState::Offering));

        for n in 1..=3 {
            mgr.handle_ice_candidate(&b, cand(n)).await;
        }
        assert!(calls.lock().applied.is_empty());
        assert_eq!(mgr.get(&b).unwrap().buffered_candidates(), 3);

        mgr.handle_answer(&b, SessionDescription::answer("answer-sdp"))
            .await
            .unwrap();
        assert_eq!(calls.lock().applied, vec![cand(1), cand(2), cand(3)]);
        assert_eq!(mgr.get(&b).unwrap().buffered_candidates(), 0);

        // Later candidates go straight through
        mgr.handle_ice_candidate(&b, cand(4)).await;
        assert_eq!(calls.lock().applied.len(), 4);
    }

    #[tokio::test]
    async fn test_second_initiate_is_noop() {
        let (mut mgr, _rx) = manager(FakeFactory::default());
        let b = UserId::from("b");
        assert!(mgr.initiate(&b, &[]).await.unwrap().is_some());
        assert!(mgr.initiate(&b, &[]).await.unwrap().is_none());
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_candidate_does_not_stop_drain() {
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let (mut mgr, _rx) = manager(factory);
        let b = UserId::from("b");
        mgr.initiate(&b, &[]).await.unwrap();
        mgr.handle_ice_candidate(&b, cand(1)).await;
        mgr.handle_ice_candidate(&b, IceCandidate::new("bad")).await;
        mgr.handle_ice_candidate(&b, cand(3)).await;
        mgr.handle_answer(&b, SessionDescription::answer("x"))
            .await
            .unwrap();
        assert_eq!(calls.lock().applied, vec![cand(1), cand(3)]);
    }

    #[tokio::test]
    async fn test_orphan_candidates_adopted_by_offer() {
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let (mut mgr, _rx) = manager(factory);
        let z = UserId::from("z");

        mgr.handle_ice_candidate(&z, cand(1)).await;
        mgr.handle_ice_candidate(&z, cand(2)).await;
        assert!(!mgr.contains(&z));
        assert_eq!(mgr.orphan_candidates(&z), 2);

        let answer = mgr
            .handle_offer(&z, SessionDescription::offer("remote-offer"), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.kind(), "answer");
        assert_eq!(answer.to(), &z);
        assert_eq!(calls.lock().applied, vec![cand(1), cand(2)]);
        assert_eq!(mgr.get(&z).unwrap().role(), Role::Responder);
        assert_eq!(mgr.state_of(&z), Some(ConnectionState::Negotiating));
    }

    #[tokio::test]
    async fn test_stale_messages_create_nothing() {
        let (mut mgr, _rx) = manager(FakeFactory::default());
        let c = UserId::from("c");
        mgr.handle_answer(&c, SessionDescription::answer("x"))
            .await
            .unwrap();
        assert!(!mgr.contains(&c));

        mgr.mark_departed(&c).await;
        mgr.handle_ice_candidate(&c, cand(1)).await;
        assert!(!mgr.contains(&c));
        assert_eq!(mgr.orphan_candidates(&c), 0);
    }

    #[tokio::test]
    async fn test_teardown_idempotent() {
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let (mut mgr, _rx) = manager(factory);
        let b = UserId::from("b");
        assert!(!mgr.teardown(&b).await);
        mgr.initiate(&b, &[]).await.unwrap();
        mgr.handle_ice_candidate(&b, cand(1)).await;
        assert!(mgr.teardown(&b).await);
        assert!(!mgr.teardown(&b).await);
        assert_eq!(calls.lock().closed, 1);
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_failed_answer_tears_down() {
        let factory = FakeFactory {
            fail_answer: true,
            ..Default::default()
        };
        let calls = factory.calls.clone();
        let (mut mgr, _rx) = manager(factory);
        let z = UserId::from("z");
        let err = mgr
            .handle_offer(&z, SessionDescription::offer("o"), &[])
            .await
            .unwrap_err();
        assert!(err.is_peer_scoped());
        assert!(!mgr.contains(&z));
        assert_eq!(calls.lock().closed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_offer_ignored_new_offer_rebuilds() {
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let (mut mgr, _rx) = manager(factory);
        let z = UserId::from("z");
        let offer = SessionDescription::offer("o1");
        assert!(mgr.handle_offer(&z, offer.clone(), &[]).await.unwrap().is_some());
        let first_id = mgr.get(&z).unwrap().id();
        assert!(mgr.handle_offer(&z, offer, &[]).await.unwrap().is_none());
        assert_eq!(mgr.get(&z).unwrap().id(), first_id);

        assert!(mgr
            .handle_offer(&z, SessionDescription::offer("o2"), &[])
            .await
            .unwrap()
            .is_some());
        assert_ne!(mgr.get(&z).unwrap().id(), first_id);
        assert_eq!(calls.lock().closed, 1);
    }

    #[tokio::test]
    async fn test_offer_to_initiator_ignored() {
        let (mut mgr, _rx) = manager(FakeFactory::default());
        let b = UserId::from("b");
        mgr.initiate(&b, &[]).await.unwrap();
        assert!(mgr
            .handle_offer(&b, SessionDescription::offer("glare"), &[])
            .await
            .unwrap()
            .is_none());
        assert_eq!(mgr.get(&b).unwrap().role(), Role::Initiator);
    }

    fn ice(mgr: &PeerConnectionManager, remote: &UserId, state: IceConnectionState) -> PeerEvent {
        PeerEvent {
            remote: remote.clone(),
            connection_id: mgr.get(remote).unwrap().id(),
            kind: PeerEventKind::IceState(state),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions_and_grace() {
        let (mut mgr, mut rx) = manager(FakeFactory::default());
        let b = UserId::from("b");
        mgr.initiate(&b, &[]).await.unwrap();
        mgr.handle_answer(&b, SessionDescription::answer("x"))
            .await
            .unwrap();

        let ev = ice(&mgr, &b, IceConnectionState::Checking);
        assert_eq!(mgr.handle_peer_event(ev), None);
        let ev = ice(&mgr, &b, IceConnectionState::Connected);
        assert_eq!(
            mgr.handle_peer_event(ev),
            Some(PeerUpdate::Connected { recovered: false })
        );
        let ev = ice(&mgr, &b, IceConnectionState::Disconnected);
        assert_eq!(mgr.handle_peer_event(ev), Some(PeerUpdate::Reconnecting));

        tokio::time::advance(CallConfig::default().grace_period() + Duration::from_millis(1)).await;
        let timer_event = rx.recv().await.unwrap();
        assert_eq!(timer_event.kind, PeerEventKind::GracePeriodElapsed);
        assert_eq!(
            mgr.handle_peer_event(timer_event),
            Some(PeerUpdate::ConnectionProblem)
        );
        assert!(mgr.contains(&b));

        let ev = ice(&mgr, &b, IceConnectionState::Connected);
        assert_eq!(
            mgr.handle_peer_event(ev),
            Some(PeerUpdate::Connected { recovered: true })
        );
        let ev = ice(&mgr, &b, IceConnectionState::Failed);
        assert_eq!(mgr.handle_peer_event(ev), Some(PeerUpdate::Failed));
        assert_eq!(mgr.state_of(&b), Some(ConnectionState::Failed));
    }

    #[tokio::test]
    async fn test_events_from_replaced_connection_dropped() {
        let (mut mgr, _rx) = manager(FakeFactory::default());
        let b = UserId::from("b");
        mgr.initiate(&b, &[]).await.unwrap();
        let old = ice(&mgr, &b, IceConnectionState::Connected);
        mgr.teardown(&b).await;
        mgr.initiate(&b, &[]).await.unwrap();
        assert_eq!(mgr.handle_peer_event(old), None);
        assert_eq!(mgr.state_of(&b), Some(ConnectionState::Offering));

        let track = RemoteTrackInfo {
            track_id: "t".into(),
            stream_id: "s".into(),
            kind: TrackKind::Audio,
        };
        let ev = PeerEvent {
            remote: b.clone(),
            connection_id: mgr.get(&b).unwrap().id(),
            kind: PeerEventKind::RemoteTrack(track.clone()),
        };
        assert_eq!(mgr.handle_peer_event(ev), Some(PeerUpdate::RemoteTrack(track)));
        assert_eq!(mgr.get(&b).unwrap().remote_tracks().len(), 1);
    }
}
