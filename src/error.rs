use thiserror::Error;

use crate::peer::types::UserId;

/// Capture device failures. Fatal to whatever asked for the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Capture not supported: {0}")]
    Unsupported(String),

    #[error("Device error: {0}")]
    Other(String),
}

/// Call-wide error type
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Negotiation with {peer} failed: {reason}")]
    Negotiation { peer: UserId, reason: String },

    #[error("ICE failed for {peer}")]
    IceFailure { peer: UserId },

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Call task is gone")]
    Closed,
}

impl CallError {
    pub fn negotiation(peer: &UserId, reason: impl std::fmt::Display) -> Self {
        CallError::Negotiation {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure only concerns a single remote peer.
    pub fn is_peer_scoped(&self) -> bool {
        matches!(
            self,
            CallError::Negotiation { .. } | CallError::IceFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
