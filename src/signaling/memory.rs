//! In-process broadcast hub.
//!
//! Every [`MemoryTransport`] handed out by one [`MemoryHub`] sees the same
//! topics, which makes multi-party calls inside one process possible.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::channel::{BroadcastTransport, ChannelEvent, PresenceMember};
use crate::error::{CallError, Result};

struct Subscriber {
    client: u64,
    member: PresenceMember,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, Vec<Subscriber>>,
    failing_subscribes: usize,
}

/// Shared topic registry
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    next_client: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// New client endpoint on this hub
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            hub: self.clone(),
            client: self.next_client.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Make the next `n` subscribe attempts fail
    pub fn fail_next_subscribes(&self, n: usize) {
        self.state.lock().failing_subscribes = n;
    }

    /// Drop every subscription on `topic`, notifying subscribers
    pub fn close_topic(&self, topic: &str, reason: &str) {
        let subscribers = self.state.lock().topics.remove(topic).unwrap_or_default();
        for sub in subscribers {
            let _ = sub.tx.send(ChannelEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Members currently subscribed to `topic`
    pub fn members(&self, topic: &str) -> Vec<PresenceMember> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.member.clone()).collect())
            .unwrap_or_default()
    }
}

/// One client's view of a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    client: u64,
}

#[async_trait]
impl BroadcastTransport for MemoryTransport {
    async fn subscribe(
        &self,
        topic: &str,
        member: PresenceMember,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>> {
        let mut state = self.hub.state.lock();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(CallError::ChannelUnavailable(format!(
                "subscribe to {topic} refused"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let subs = state.topics.entry(topic.to_string()).or_default();
        if subs.iter().any(|s| s.client == self.client) {
            return Err(CallError::ChannelUnavailable(format!(
                "client already subscribed to {topic}"
            )));
        }

        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            let _ = sub.tx.send(ChannelEvent::PresenceJoin(vec![member.clone()]));
        }
        subs.push(Subscriber {
            client: self.client,
            member,
            tx: tx.clone(),
        });
        let snapshot = subs.iter().map(|s| s.member.clone()).collect();
        let _ = tx.send(ChannelEvent::PresenceSync(snapshot));
        debug!(topic, client = self.client, "Memory hub subscribe");
        Ok(rx)
    }

    async fn publish(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        let state = self.hub.state.lock();
        let subs = state.topics.get(topic).ok_or_else(|| {
            CallError::ChannelUnavailable(format!("topic {topic} has no subscribers"))
        })?;
        if !subs.iter().any(|s| s.client == self.client) {
            return Err(CallError::ChannelUnavailable(format!(
                "not subscribed to {topic}"
            )));
        }
        for sub in subs.iter().filter(|s| s.client != self.client) {
            if sub
                .tx
                .send(ChannelEvent::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                })
                .is_err()
            {
                warn!(topic, client = sub.client, "Dropping broadcast for gone subscriber");
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut state = self.hub.state.lock();
        let Some(subs) = state.topics.get_mut(topic) else {
            return Ok(());
        };
        let Some(pos) = subs.iter().position(|s| s.client == self.client) else {
            return Ok(());
        };
        let gone = subs.remove(pos);
        for sub in subs.iter() {
            let _ = sub
                .tx
                .send(ChannelEvent::PresenceLeave(vec![gone.member.clone()]));
        }
        if subs.is_empty() {
            state.topics.remove(topic);
        }
        debug!(topic, client = self.client, "Memory hub unsubscribe");
        Ok(())
    }
}
