//! Signaling channel adapter over a pub/sub topic with presence

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::message::SignalingMessage;
use crate::error::{CallError, Result};
use crate::peer::types::UserId;

/// A member as reported by channel presence
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PresenceMember {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl PresenceMember {
    pub fn new(user_id: impl Into<UserId>, display_name: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name,
        }
    }
}

/// Raw event delivered by a broadcast transport subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Full membership snapshot
    PresenceSync(Vec<PresenceMember>),
    PresenceJoin(Vec<PresenceMember>),
    PresenceLeave(Vec<PresenceMember>),
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// Subscription dropped by the transport
    Closed { reason: String },
}

/// Publish/subscribe transport with membership presence.
///
/// Delivery is at-most-once and unordered; subscribers do not receive their
/// own broadcasts.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Join `topic` as `member`. Fails with [`CallError::ChannelUnavailable`].
    async fn subscribe(
        &self,
        topic: &str,
        member: PresenceMember,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn publish(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}

/// Event produced by [`SignalingChannel::interpret`]
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Presence {
        joined: Vec<PresenceMember>,
        left: Vec<UserId>,
    },
    Message(SignalingMessage),
    Lost(String),
}

/// Topic name for a call room
pub fn room_topic(room_id: &str) -> String {
    format!("call-room:{room_id}")
}

/// One open subscription to a call room.
pub struct SignalingChannel {
    transport: Arc<dyn BroadcastTransport>,
    topic: String,
    local: UserId,
    members: HashMap<UserId, PresenceMember>,
    open: bool,
}

impl SignalingChannel {
    /// Subscribe to the room topic. The returned receiver carries raw
    /// transport events; feed them through [`SignalingChannel::interpret`].
    pub async fn join(
        transport: Arc<dyn BroadcastTransport>,
        room_id: &str,
        local: &UserId,
        display_name: Option<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let topic = room_topic(room_id);
        let member = PresenceMember {
            user_id: local.clone(),
            display_name,
        };
        let events = transport.subscribe(&topic, member).await?;
        info!(topic = %topic, user = %local, "Joined signaling channel");

        Ok((
            Self {
                transport,
                topic,
                local: local.clone(),
                members: HashMap::new(),
                open: true,
            },
            events,
        ))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Remote members currently believed present
    pub fn members(&self) -> impl Iterator<Item = &PresenceMember> {
        self.members.values()
    }

    /// Turn a raw transport event into presence deltas or an addressed
    /// message. Self-echoes, messages for other participants, duplicate
    /// joins and undecodable payloads yield `None`.
    pub fn interpret(&mut self, event: ChannelEvent) -> Option<SignalEvent> {
        match event {
            ChannelEvent::PresenceSync(snapshot) => {
                let mut current: HashMap<UserId, PresenceMember> = HashMap::new();
                for member in snapshot {
                    if member.user_id != self.local {
                        current.insert(member.user_id.clone(), member);
                    }
                }
                let mut left: Vec<UserId> = self
                    .members
                    .keys()
                    .filter(|id| !current.contains_key(*id))
                    .cloned()
                    .collect();
                let mut joined: Vec<PresenceMember> = current
                    .values()
                    .filter(|m| !self.members.contains_key(&m.user_id))
                    .cloned()
                    .collect();
                left.sort();
                joined.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                self.members = current;
                Self::presence(joined, left)
            }
            ChannelEvent::PresenceJoin(members) => {
                let mut joined = Vec::new();
                for member in members {
                    if member.user_id == self.local {
                        continue;
                    }
                    if self.members.contains_key(&member.user_id) {
                        trace!(peer = %member.user_id, "Duplicate presence join");
                        continue;
                    }
                    self.members.insert(member.user_id.clone(), member.clone());
                    joined.push(member);
                }
                Self::presence(joined, Vec::new())
            }
            ChannelEvent::PresenceLeave(members) => {
                // Leaves are reported even for members we never saw join: a
                // connection may exist from an offer that outran presence.
                let mut left = Vec::new();
                for member in members {
                    if member.user_id == self.local {
                        continue;
                    }
                    self.members.remove(&member.user_id);
                    left.push(member.user_id);
                }
                Self::presence(Vec::new(), left)
            }
            ChannelEvent::Broadcast { event, payload } => {
                let message: SignalingMessage = match serde_json::from_value(payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(
                            topic = %self.topic,
                            event = %event,
                            "Dropping undecodable signaling payload: {}",
                            e
                        );
                        return None;
                    }
                };
                if message.kind() != event {
                    debug!(
                        "Broadcast event '{}' carries '{}' message",
                        event,
                        message.kind()
                    );
                }
                if message.from() == &self.local {
                    return None;
                }
                if message.to() != &self.local {
                    trace!(
                        to = %message.to(),
                        kind = message.kind(),
                        "Message for another participant"
                    );
                    return None;
                }
                Some(SignalEvent::Message(message))
            }
            ChannelEvent::Closed { reason } => {
                if !self.open {
                    return None;
                }
                self.open = false;
                warn!(topic = %self.topic, "Signaling channel lost: {}", reason);
                Some(SignalEvent::Lost(reason))
            }
        }
    }

    fn presence(joined: Vec<PresenceMember>, left: Vec<UserId>) -> Option<SignalEvent> {
        if joined.is_empty() && left.is_empty() {
            None
        } else {
            Some(SignalEvent::Presence { joined, left })
        }
    }

    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        if !self.open {
            return Err(CallError::ChannelUnavailable(format!(
                "{} is closed",
                self.topic
            )));
        }
        let payload = serde_json::to_value(message)?;
        self.transport
            .publish(&self.topic, message.kind(), payload)
            .await
    }

    /// Unsubscribe. Idempotent.
    pub async fn leave(&mut self) -> Result<()> {
        self.members.clear();
        if !self.open {
            return Ok(());
        }
        self.open = false;
        info!(topic = %self.topic, user = %self.local, "Leaving signaling channel");
        self.transport.unsubscribe(&self.topic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{IceCandidate, SessionDescription};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        published: Mutex<Vec<(String, String, serde_json::Value)>>,
        unsubscribed: Mutex<usize>,
    }

    #[async_trait]
    impl BroadcastTransport for RecordingTransport {
        async fn subscribe(
            &self,
            _topic: &str,
            _member: PresenceMember,
        ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn publish(
            &self,
            topic: &str,
            event: &str,
            payload: serde_json::Value,
        ) -> Result<()> {
            self.published
                .lock()
                .push((topic.to_string(), event.to_string(), payload));
            Ok(())
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<()> {
            *self.unsubscribed.lock() += 1;
            Ok(())
        }
    }

    async fn channel_for(local: &str) -> (SignalingChannel, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, _rx) =
            SignalingChannel::join(transport.clone(), "R1", &UserId::from(local), None)
                .await
                .unwrap();
        (channel, transport)
    }

    fn member(id: &str) -> PresenceMember {
        PresenceMember::new(id, None)
    }

    #[tokio::test]
    async fn test_sync_produces_deltas() {
        let (mut ch, _) = channel_for("a").await;

        let ev = ch.interpret(ChannelEvent::PresenceSync(vec![
            member("a"),
            member("b"),
            member("c"),
        ]));
        assert_eq!(
            ev,
            Some(SignalEvent::Presence {
                joined: vec![member("b"), member("c")],
                left: vec![]
            })
        );

        let snapshot = vec![member("a"), member("c"), member("d")];
        let ev = ch.interpret(ChannelEvent::PresenceSync(snapshot.clone()));
        assert_eq!(
            ev,
            Some(SignalEvent::Presence {
                joined: vec![member("d")],
                left: vec![UserId::from("b")]
            })
        );

        // Same snapshot again is a no-op
        let ev = ch.interpret(ChannelEvent::PresenceSync(snapshot));
        assert_eq!(ev, None);
    }

    #[tokio::test]
    async fn test_duplicate_join_and_self_ignored() {
        let (mut ch, _) = channel_for("a").await;
        assert!(ch.interpret(ChannelEvent::PresenceJoin(vec![member("b")])).is_some());
        assert_eq!(ch.interpret(ChannelEvent::PresenceJoin(vec![member("b")])), None);
        assert_eq!(ch.interpret(ChannelEvent::PresenceJoin(vec![member("a")])), None);

        // leave then rejoin reports again
        assert!(ch.interpret(ChannelEvent::PresenceLeave(vec![member("b")])).is_some());
        assert!(ch.interpret(ChannelEvent::PresenceJoin(vec![member("b")])).is_some());
    }

    #[tokio::test]
    async fn test_message_addressing() {
        let (mut ch, _) = channel_for("a").await;
        let to_me = SignalingMessage::IceCandidate {
            from: "b".into(),
            to: "a".into(),
            payload: IceCandidate::new("candidate:1"),
        };
        let to_other = SignalingMessage::IceCandidate {
            from: "b".into(),
            to: "c".into(),
            payload: IceCandidate::new("candidate:1"),
        };
        let echo = SignalingMessage::Offer {
            from: "a".into(),
            to: "a".into(),
            payload: SessionDescription::offer("v=0"),
        };

        let wrap = |m: &SignalingMessage| ChannelEvent::Broadcast {
            event: m.kind().to_string(),
            payload: serde_json::to_value(m).unwrap(),
        };

        assert_eq!(ch.interpret(wrap(&to_me)), Some(SignalEvent::Message(to_me.clone())));
        assert_eq!(ch.interpret(wrap(&to_other)), None);
        assert_eq!(ch.interpret(wrap(&echo)), None);
        assert_eq!(
            ch.interpret(ChannelEvent::Broadcast {
                event: "offer".into(),
                payload: serde_json::json!({ "nonsense": true }),
            }),
            None
        );
    }

    #[tokio::test]
    async fn test_send_and_leave() {
        let (mut ch, transport) = channel_for("a").await;
        let msg = SignalingMessage::Answer {
            from: "a".into(),
            to: "b".into(),
            payload: SessionDescription::answer("v=0"),
        };
        ch.send(&msg).await.unwrap();
        {
            let published = transport.published.lock();
            assert_eq!(published.len(), 1);
            assert_eq!(published[0].0, "call-room:R1");
            assert_eq!(published[0].1, "answer");
        }

        ch.leave().await.unwrap();
        ch.leave().await.unwrap();
        assert_eq!(*transport.unsubscribed.lock(), 1);
        assert!(matches!(
            ch.send(&msg).await,
            Err(CallError::ChannelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_reported_once() {
        let (mut ch, _) = channel_for("a").await;
        let closed = || ChannelEvent::Closed {
            reason: "socket reset".into(),
        };
        assert_eq!(
            ch.interpret(closed()),
            Some(SignalEvent::Lost("socket reset".into()))
        );
        assert_eq!(ch.interpret(closed()), None);
        assert!(!ch.is_open());
    }
}
