//! Seam over the peer-connection primitive

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use super::types::{IceCandidate, IceConnectionState, RemoteTrackInfo, SessionDescription, UserId};
use crate::error::Result;
use crate::media::CaptureTrack;

/// Something a peer connection reported
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    IceState(IceConnectionState),
    LocalCandidate(IceCandidate),
    GatheringComplete,
    RemoteTrack(RemoteTrackInfo),
    /// Raised by the connection manager's disconnect timer, not by transports
    GracePeriodElapsed,
}

/// Event tagged with the connection instance that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub remote: UserId,
    pub connection_id: u64,
    pub kind: PeerEventKind,
}

/// Where a peer connection pushes its events. Bound to a single
/// connection instance so late events from a replaced instance are
/// recognisable.
#[derive(Clone)]
pub struct PeerEventSink {
    remote: UserId,
    connection_id: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(remote: UserId, connection_id: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            connection_id,
            tx,
        }
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            remote: self.remote.clone(),
            connection_id: self.connection_id,
            kind,
        };
        if self.tx.send(event).is_err() {
            trace!(peer = %self.remote, "Peer event dropped, session gone");
        }
    }
}

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_tracks(&self, tracks: &[Arc<dyn CaptureTrack>]) -> Result<()>;

    /// Swap the outgoing video without renegotiation. `None` sends nothing.
    async fn replace_video_track(&self, track: Option<Arc<dyn CaptureTrack>>) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerTransport>>;
}
