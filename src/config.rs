// Call configuration
// Timings are kept in milliseconds so host settings stay plain JSON numbers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{CallError, Result};
use crate::utils::add_ice_url_scheme;

/// ICE server entry as supplied by the host application
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        id: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            r#type: "turn".into(),
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(CallError::Config(format!(
                "ICE server '{}' has an empty URL",
                self.id
            )));
        }
        if self.r#type != "stun" && self.r#type != "turn" {
            return Err(CallError::Config(format!(
                "ICE server '{}' has unknown type '{}'",
                self.id, self.r#type
            )));
        }
        if self.r#type == "turn" && (self.username.is_none() || self.credential.is_none()) {
            return Err(CallError::Config(format!(
                "TURN server '{}' requires username and credential",
                self.id
            )));
        }
        Ok(())
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: vec![add_ice_url_scheme(self)],
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
        }
    }
}

/// Call configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// How long a disconnected peer may stay disconnected before a
    /// connection-problem notification
    pub grace_period_ms: u64,
    /// Per-peer cap on not-yet-applicable remote candidates
    pub max_buffered_candidates: usize,
    /// Lifetime of candidates buffered for a peer with no connection
    pub orphan_candidate_ttl_ms: u64,
    /// Upper bound on a single SDP create/set call
    pub negotiation_timeout_ms: u64,
    /// Cadence of the orphan buffer sweep
    pub prune_interval_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
                IceServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
            ],
            grace_period_ms: 10_000,
            max_buffered_candidates: 64,
            orphan_candidate_ttl_ms: 30_000,
            negotiation_timeout_ms: 10_000,
            prune_interval_ms: 5_000,
        }
    }
}

impl CallConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: CallConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            server.validate()?;
        }
        if self.max_buffered_candidates == 0 {
            return Err(CallError::Config(
                "max_buffered_candidates must be at least 1".into(),
            ));
        }
        if self.negotiation_timeout_ms == 0 || self.prune_interval_ms == 0 {
            return Err(CallError::Config(
                "negotiation_timeout_ms and prune_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(IceServerConfig::to_rtc).collect()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn orphan_candidate_ttl(&self) -> Duration {
        Duration::from_millis(self.orphan_candidate_ttl_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}
