use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, pin::Pin, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::AbortHandle,
};

use crate::{
    config::{Common, Roster},
    wire, PeerId,
};

mod listener;
use listener::ListenerProc;

mod peer;
use peer::PeerProc;

mod swarm;
use swarm::{FrameTiming, SwarmCmd, SwarmState};

type Sender<T> = UnboundedSender<T>;
type Receiver<T> = UnboundedReceiver<T>;
type SessionSender = Sender<SessionMsg>;
type SessionReceiver = Receiver<SessionMsg>;

type PeerReader = Pin<Box<dyn AsyncRead + Send + 'static>>;
type PeerWriter = Pin<Box<dyn AsyncWrite + Send + 'static>>;

struct PeerIo {
    reader: PeerReader,
    writer: PeerWriter,
}

impl PeerIo {
    fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }
}

enum SessionMsg {
    ListenerIncoming {
        peer_id: PeerId,
        peer_addr: SocketAddr,
        peer_io: PeerIo,
    },
    PeerHandshake {
        peer_id: PeerId,
    },
    PeerMessage {
        peer_id: PeerId,
        message: wire::Message,
        timing: FrameTiming,
    },
    PeerFailure {
        peer_id: PeerId,
        error: wire::WireError,
    },
    PreferredTick,
    OptimisticTick,
    Shutdown,
}

/// Where the run ended up. `Running` until every roster peer holds the
/// complete file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Finished,
    Failed(String),
}

/// One running peer: TCP listener, the two choking timers, and the state
/// machine thread. Dropping the session tears all of them down.
pub struct Session {
    sender: SessionSender,
    status: watch::Receiver<SessionStatus>,
    tick_handles: Vec<AbortHandle>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in &self.tick_handles {
            handle.abort();
        }
        let _ = self.sender.send(SessionMsg::Shutdown);
    }
}

impl Session {
    /// Spawn the whole peer. Must be called from within a tokio runtime.
    pub fn start(
        common: Common,
        roster: Roster,
        local_id: PeerId,
        workdir: PathBuf,
    ) -> std::io::Result<Self> {
        let port = roster.get(local_id).map(|entry| entry.port).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("peer {local_id} is not in the roster"),
            )
        })?;
        let swarm = SwarmState::new(common.clone(), roster, local_id, workdir)?;

        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let (status_sender, status) = watch::channel(SessionStatus::Running);
        let listener = ListenerProc::spawn(sender.clone(), port);
        let state = SessionState {
            sender: sender.clone(),
            local_id,
            swarm,
            peers: Default::default(),
            status: status_sender,
            _listener: listener,
        };
        tokio::task::spawn_blocking(move || session_run(state, receiver));

        let tick_handles = vec![
            spawn_ticker(sender.clone(), common.unchoking_interval, || {
                SessionMsg::PreferredTick
            }),
            spawn_ticker(sender.clone(), common.optimistic_unchoking_interval, || {
                SessionMsg::OptimisticTick
            }),
        ];

        Ok(Self {
            sender,
            status,
            tick_handles,
        })
    }

    /// Wait for the run to end: every peer in the roster holds the complete
    /// file, or the state machine hit an unrecoverable error.
    pub async fn wait(&mut self) -> SessionStatus {
        while *self.status.borrow() == SessionStatus::Running {
            if self.status.changed().await.is_err() {
                break;
            }
        }
        // leave the writer tasks a moment to flush their last broadcasts
        // before the caller tears the runtime down
        tokio::time::sleep(Duration::from_millis(250)).await;
        self.status.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }
}

fn spawn_ticker(sender: SessionSender, interval: Duration, message: fn() -> SessionMsg) -> AbortHandle {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if sender.send(message()).is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

struct SessionState {
    sender: SessionSender,
    local_id: PeerId,
    swarm: SwarmState,
    peers: BTreeMap<PeerId, PeerProc>,
    status: watch::Sender<SessionStatus>,
    _listener: ListenerProc,
}

fn session_run(mut state: SessionState, mut receiver: SessionReceiver) {
    state.swarm.init();
    if drain_and_execute(&mut state) {
        return;
    }
    while let Some(msg) = receiver.blocking_recv() {
        if session_process(&mut state, msg) {
            break;
        }
    }
}

fn session_process(state: &mut SessionState, msg: SessionMsg) -> bool {
    match msg {
        SessionMsg::ListenerIncoming {
            peer_id,
            peer_addr,
            peer_io,
        } => {
            if state.swarm.on_peer_accepted(peer_id) {
                let proc = PeerProc::accept(state.sender.clone(), peer_id, state.local_id, peer_io);
                state.peers.insert(peer_id, proc);
            } else {
                tracing::debug!("dropping connection from {peer_addr}");
            }
        }
        SessionMsg::PeerHandshake { peer_id } => state.swarm.on_peer_connected(peer_id),
        SessionMsg::PeerMessage {
            peer_id,
            message,
            timing,
        } => state.swarm.on_peer_message(peer_id, message, timing),
        SessionMsg::PeerFailure { peer_id, error } => state.swarm.on_peer_failure(peer_id, &error),
        SessionMsg::PreferredTick => state.swarm.on_preferred_tick(),
        SessionMsg::OptimisticTick => state.swarm.on_optimistic_tick(),
        SessionMsg::Shutdown => return true,
    }
    drain_and_execute(state)
}

/// Apply every command the state machine queued. Returns true once it asked
/// to shut down.
fn drain_and_execute(state: &mut SessionState) -> bool {
    loop {
        let commands = state.swarm.drain().collect::<Vec<_>>();
        if commands.is_empty() {
            return false;
        }
        for command in commands {
            match command {
                SwarmCmd::Connect { peer, host, port } => {
                    let proc =
                        PeerProc::connect(state.sender.clone(), peer, state.local_id, host, port);
                    state.peers.insert(peer, proc);
                }
                SwarmCmd::Send { peer, message } => {
                    if let Some(proc) = state.peers.get(&peer) {
                        proc.send(message);
                    }
                }
                SwarmCmd::Disconnect { peer } => {
                    state.peers.remove(&peer);
                }
                SwarmCmd::Shutdown { error } => {
                    // dropping the procs closes the writer channels; frames
                    // already queued still flush on the runtime
                    state.peers.clear();
                    let status = match error {
                        None => SessionStatus::Finished,
                        Some(error) => SessionStatus::Failed(error.to_string()),
                    };
                    let _ = state.status.send(status);
                    return true;
                }
            }
        }
    }
}
