//! Signaling over a broadcast channel

pub mod channel;
pub mod memory;
pub mod message;

pub use channel::{
    room_topic, BroadcastTransport, ChannelEvent, PresenceMember, SignalEvent, SignalingChannel,
};
pub use memory::{MemoryHub, MemoryTransport};
pub use message::SignalingMessage;
