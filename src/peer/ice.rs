//! Remote ICE candidates that arrived before they could be applied

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::transport::PeerTransport;
use super::types::{IceCandidate, UserId};
use crate::logger::log_candidate;

/// FIFO of candidates waiting for a remote description
#[derive(Debug)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
    capacity: usize,
    created: Instant,
    dropped: usize,
}

impl CandidateBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            created: Instant::now(),
            dropped: 0,
        }
    }

    /// Append in arrival order. When full the new candidate is dropped and
    /// `false` returned.
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.queue.push_back(candidate);
        true
    }

    /// Take everything, oldest first, leaving the buffer empty
    pub fn take(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    /// Merge `other` behind whatever is already queued
    pub fn extend(&mut self, mut other: CandidateBuffer) {
        for candidate in other.take() {
            self.push(candidate);
        }
        self.dropped += other.dropped;
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }
}

/// Apply candidates in order. Failures are logged and skipped; returns how
/// many were applied.
pub async fn apply_candidates(
    peer: &UserId,
    transport: &dyn PeerTransport,
    candidates: Vec<IceCandidate>,
) -> usize {
    let total = candidates.len();
    let mut applied = 0;
    for candidate in candidates {
        log_candidate("REMOTE", &candidate);
        match transport.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => warn!(peer = %peer, "Failed to apply ICE candidate: {}", e),
        }
    }
    if total > 0 {
        debug!(peer = %peer, "Applied {}/{} ICE candidates", applied, total);
    }
    applied
}

/// Candidates from peers that have no connection yet
#[derive(Debug)]
pub struct OrphanCandidates {
    buffers: HashMap<UserId, CandidateBuffer>,
    capacity: usize,
    ttl: Duration,
}

impl OrphanCandidates {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            capacity,
            ttl,
        }
    }

    pub fn push(&mut self, peer: &UserId, candidate: IceCandidate) -> bool {
        let capacity = self.capacity;
        let accepted = self
            .buffers
            .entry(peer.clone())
            .or_insert_with(|| CandidateBuffer::new(capacity))
            .push(candidate);
        if !accepted {
            warn!(peer = %peer, "Orphan candidate buffer full, dropping candidate");
        }
        accepted
    }

    /// Hand the buffer for `peer` to a newly created connection
    pub fn adopt(&mut self, peer: &UserId) -> Option<CandidateBuffer> {
        self.buffers.remove(peer)
    }

    pub fn discard(&mut self, peer: &UserId) -> usize {
        self.buffers.remove(peer).map(|b| b.len()).unwrap_or(0)
    }

    /// Drop buffers older than the TTL; returns how many candidates went
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut discarded = 0;
        self.buffers.retain(|peer, buffer| {
            if buffer.age(now) >= ttl {
                debug!(peer = %peer, "Discarding {} stale orphan candidates", buffer.len());
                discarded += buffer.len();
                false
            } else {
                true
            }
        });
        discarded
    }

    pub fn pending(&self, peer: &UserId) -> usize {
        self.buffers.get(peer).map(|b| b.len()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
