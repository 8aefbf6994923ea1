pub mod connection;
pub mod ice;
pub mod rtc;
pub mod transport;
pub mod types;

pub use connection::{ParticipantConnection, PeerConnectionManager, PeerUpdate};
pub use ice::{CandidateBuffer, OrphanCandidates};
pub use rtc::{RemoteMedia, RtcPeer, RtcPeerFactory};
pub use transport::{PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerTransport};
pub use types::{
    ConnectionState, IceCandidate, IceConnectionState, RemoteTrackInfo, Role, SdpType,
    SessionDescription, TrackKind, UserId,
};
