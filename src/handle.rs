//! Task driving a [`CallSession`]: host commands, channel events, peer
//! events and the orphan sweep all go through one loop.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{CallError, Result};
use crate::peer::UserId;
use crate::session::{CallEvent, CallSession, CallSnapshot};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    StartCall {
        room_id: String,
        local: UserId,
        display_name: Option<String>,
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    SetMuted {
        muted: bool,
        reply: Reply<()>,
    },
    SetVideoOff {
        video_off: bool,
        reply: Reply<()>,
    },
    StartScreenShare {
        reply: Reply<()>,
    },
    StopScreenShare {
        reply: Reply<()>,
    },
    RetryPeer {
        peer: UserId,
        reply: Reply<()>,
    },
}

/// Cloneable handle to a running call task
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    /// Move `session` onto its own task. The task ends when every handle
    /// is dropped, ending the call first if one is active.
    pub fn spawn(session: CallSession) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let snapshot = session.watch();
        let events = session.event_sender();
        let task = tokio::spawn(run(session, rx));
        (
            Self {
                commands: tx,
                snapshot,
                events,
            },
            task,
        )
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }

    pub async fn start_call(
        &self,
        room_id: impl Into<String>,
        local: impl Into<UserId>,
        display_name: Option<String>,
    ) -> Result<()> {
        let room_id = room_id.into();
        let local = local.into();
        self.request(|reply| Command::StartCall {
            room_id,
            local,
            display_name,
            reply,
        })
        .await
    }

    pub async fn end_call(&self) -> Result<()> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| Command::SetMuted { muted, reply })
            .await
    }

    pub async fn set_video_off(&self, video_off: bool) -> Result<()> {
        self.request(|reply| Command::SetVideoOff { video_off, reply })
            .await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await
    }

    pub async fn retry_peer(&self, peer: impl Into<UserId>) -> Result<()> {
        let peer = peer.into();
        self.request(|reply| Command::RetryPeer { peer, reply })
            .await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

async fn run(mut session: CallSession, mut commands: mpsc::Receiver<Command>) {
    let mut prune = interval(session.prune_interval());
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => execute(&mut session, cmd).await,
                None => break,
            },
            input = session.next_input() => session.dispatch(input).await,
            _ = prune.tick() => {
                let dropped = session.prune(Instant::now());
                if dropped > 0 {
                    debug!("Pruned {} orphan candidates", dropped);
                }
            }
        }
    }

    if let Err(e) = session.end_call().await {
        debug!("Error ending call on shutdown: {}", e);
    }
    info!("Call task finished");
}

async fn execute(session: &mut CallSession, cmd: Command) {
    // A dropped reply receiver only means the caller stopped waiting
    match cmd {
        Command::StartCall {
            room_id,
            local,
            display_name,
            reply,
        } => {
            let _ = reply.send(session.start_call(&room_id, local, display_name).await);
        }
        Command::EndCall { reply } => {
            let _ = reply.send(session.end_call().await);
        }
        Command::SetMuted { muted, reply } => {
            let _ = reply.send(session.set_muted(muted).await);
        }
        Command::SetVideoOff { video_off, reply } => {
            let _ = reply.send(session.set_video_off(video_off).await);
        }
        Command::StartScreenShare { reply } => {
            let _ = reply.send(session.start_screen_share().await);
        }
        Command::StopScreenShare { reply } => {
            let _ = reply.send(session.stop_screen_share().await);
        }
        Command::RetryPeer { peer, reply } => {
            let _ = reply.send(session.retry_peer(&peer).await);
        }
    }
}
