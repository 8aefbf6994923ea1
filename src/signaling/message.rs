//! Signaling wire format

use serde::{Deserialize, Serialize};

use crate::peer::types::{IceCandidate, SessionDescription, UserId};

/// Message exchanged between two participants over the room topic.
///
/// Serialized as `{ "kind": "offer"|"answer"|"ice-candidate", "from", "to", "payload" }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer {
        from: UserId,
        to: UserId,
        payload: SessionDescription,
    },
    Answer {
        from: UserId,
        to: UserId,
        payload: SessionDescription,
    },
    IceCandidate {
        from: UserId,
        to: UserId,
        payload: IceCandidate,
    },
}

impl SignalingMessage {
    pub const OFFER: &'static str = "offer";
    pub const ANSWER: &'static str = "answer";
    pub const ICE_CANDIDATE: &'static str = "ice-candidate";

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => Self::OFFER,
            SignalingMessage::Answer { .. } => Self::ANSWER,
            SignalingMessage::IceCandidate { .. } => Self::ICE_CANDIDATE,
        }
    }

    pub fn from(&self) -> &UserId {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. } => from,
        }
    }

    pub fn to(&self) -> &UserId {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. } => to,
        }
    }
}
