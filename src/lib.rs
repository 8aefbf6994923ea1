//! Signaling and connection lifecycle core for multi-party WebRTC calls.
//!
//! Participants meet on a broadcast room topic, elect an offerer per pair
//! and negotiate one peer connection per remote participant. Hosts build a
//! [`CallSession`] from a [`MediaSource`], a [`BroadcastTransport`] and a
//! [`PeerFactory`], then drive it through a [`CallHandle`].

pub mod config;
pub mod error;
pub mod handle;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{CallConfig, IceServerConfig};
pub use error::{CallError, DeviceError, Result};
pub use handle::CallHandle;
pub use media::{CaptureRequest, CaptureTrack, LocalMedia, MediaDeviceController, MediaSource};
pub use peer::{
    ConnectionState, IceCandidate, PeerFactory, PeerTransport, RtcPeerFactory, SessionDescription,
    UserId,
};
pub use session::{AggregateStatus, CallEvent, CallSession, CallSnapshot, MediaState};
pub use signaling::{BroadcastTransport, MemoryHub, SignalingMessage};
