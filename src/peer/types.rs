use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant identifier as handed out by the host application.
///
/// Ordering is plain byte-wise string ordering with no normalisation, so
/// every client computes the same result for the same pair of ids.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SDP type carried in a session description
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged over signaling (`{ type, sdp }`)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate descriptor, field names as browsers serialize them
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    /// Candidate type token (`host`, `srflx`, `prflx`, `relay`) if present.
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

/// ICE connection state reported by the peer-connection primitive
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side of a pair sends the offer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Initiator election: the lexicographically smaller id offers.
    ///
    /// Returns `None` for identical ids; a participant never connects to itself.
    pub fn elect(local: &UserId, remote: &UserId) -> Option<Role> {
        match local.cmp(remote) {
            std::cmp::Ordering::Less => Some(Role::Initiator),
            std::cmp::Ordering::Greater => Some(Role::Responder),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Per-peer connection lifecycle, the state exposed in the call snapshot
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Offering,
    Answering,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Next state after an ICE state report. Terminal states never move.
    pub fn on_ice(self, ice: IceConnectionState) -> ConnectionState {
        if self.is_terminal() {
            return self;
        }
        match ice {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                ConnectionState::Connected
            }
            IceConnectionState::Disconnected => ConnectionState::Disconnected,
            IceConnectionState::Failed => ConnectionState::Failed,
            IceConnectionState::Closed => ConnectionState::Closed,
            IceConnectionState::New | IceConnectionState::Checking => self,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Offering => "offering",
            ConnectionState::Answering => "answering",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Kind of media carried by a track
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Remote media announced by a peer connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_is_antisymmetric() {
        let ids = ["alice", "bob", "Carol", "dave-2", "dave-10", ""];
        for a in ids {
            for b in ids {
                let (a, b) = (UserId::from(a), UserId::from(b));
                let ab = Role::elect(&a, &b);
                let ba = Role::elect(&b, &a);
                if a == b {
                    assert_eq!(ab, None);
                    assert_eq!(ba, None);
                } else {
                    let initiators = [ab, ba]
                        .iter()
                        .filter(|r| **r == Some(Role::Initiator))
                        .count();
                    assert_eq!(initiators, 1, "pair {a}/{b}");
                }
            }
        }
    }

    #[test]
    fn test_candidate_kind() {
        let c = IceCandidate::new(
            "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host generation 0",
        );
        assert_eq!(c.kind(), Some("host"));
        assert_eq!(IceCandidate::new("garbage").kind(), None);
    }

    #[test]
    fn test_candidate_wire_names() {
        let c = IceCandidate::new("candidate:1").with_mid("0", 0);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        assert_eq!(
            ConnectionState::Failed.on_ice(IceConnectionState::Connected),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::Negotiating.on_ice(IceConnectionState::Completed),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::Connected.on_ice(IceConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::Disconnected.on_ice(IceConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::Offering.on_ice(IceConnectionState::Checking),
            ConnectionState::Offering
        );
    }
}
