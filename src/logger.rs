//! Logging setup and ICE diagnostics

use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::peer::types::IceCandidate;

/// Log verbosity for [`init`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            LogLevel::Error => "roomcall=error,webrtc=error",
            LogLevel::Warn => "roomcall=warn,webrtc=error",
            LogLevel::Info => "roomcall=info,webrtc=warn",
            LogLevel::Debug => "roomcall=debug,webrtc=warn",
            LogLevel::Trace => "roomcall=trace,webrtc=info",
        }
    }
}

/// Level used when the host does not pick one: chattier in debug builds.
pub fn default_level() -> LogLevel {
    if cfg!(debug_assertions) {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Install a global tracing subscriber. `RUST_LOG` takes priority over `level`.
/// Safe to call more than once; later calls are ignored.
pub fn init(level: LogLevel) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.filter().into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        debug!("tracing already initialized: {}", err);
    }
}

/// Trickle-ICE trace line for a gathered or received candidate
pub fn log_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Snapshot of the nominated candidate pair from getStats
pub async fn log_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Count gathered candidates by type: (host, srflx, relay)
pub fn summarize_candidates(candidates: &[IceCandidate]) -> (usize, usize, usize) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        match candidate.kind() {
            Some("host") => host_count += 1,
            Some("srflx") | Some("prflx") => srflx_count += 1,
            Some("relay") => relay_count += 1,
            _ => {}
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    );

    if relay_count == 0 {
        warn!("No TURN relay candidates found, connection through symmetric NAT may fail");
    }

    (host_count, srflx_count, relay_count)
}
