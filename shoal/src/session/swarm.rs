use std::{
    collections::{BTreeMap, VecDeque},
    io,
    path::PathBuf,
    time::Duration,
};

use bytes::Bytes;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    config::{Common, Roster},
    store::PieceStore,
    wire::{Message, WireError},
    PeerId, PieceBitfield, PieceIdx,
};

/// Download-speed sentinel: the neighbor already has the complete file and is
/// never a preferred-neighbor candidate while we are still downloading.
const SPEED_INELIGIBLE: f64 = -1.0;

/// Wall-clock span of one framed read, measured by the reader task. `bytes`
/// counts the whole frame, length prefix included.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    pub bytes: u32,
    pub elapsed: Duration,
}

impl FrameTiming {
    fn throughput(&self) -> f64 {
        // bytes per second; only the ordering matters downstream
        f64::from(self.bytes) / self.elapsed.as_secs_f64().max(1e-9)
    }
}

#[derive(Debug)]
pub enum SwarmCmd {
    Connect {
        peer: PeerId,
        host: String,
        port: u16,
    },
    Send {
        peer: PeerId,
        message: Message,
    },
    Disconnect {
        peer: PeerId,
    },
    Shutdown {
        error: Option<io::Error>,
    },
}

#[derive(Debug, Default)]
struct CommandQueue(VecDeque<SwarmCmd>);

impl CommandQueue {
    fn connect(&mut self, peer: PeerId, host: String, port: u16) {
        self.push(SwarmCmd::Connect { peer, host, port });
    }

    fn send(&mut self, peer: PeerId, message: Message) {
        self.push(SwarmCmd::Send { peer, message });
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.push(SwarmCmd::Disconnect { peer });
    }

    fn shutdown(&mut self, error: Option<io::Error>) {
        self.push(SwarmCmd::Shutdown { error });
    }

    fn push(&mut self, command: SwarmCmd) {
        self.0.push_back(command);
    }
}

/// Our view of one connected remote peer.
#[derive(Debug)]
struct NeighborState {
    /// Last-known remote bitfield; all-zero until BITFIELD arrives.
    bitfield: PieceBitfield,
    /// Has the remote declared interest in us?
    remote_interested: bool,
    /// Are we choking the remote?
    choked_by_us: bool,
    /// Is the remote choking us?
    choked_by_remote: bool,
    /// Holder of the optimistic-unchoke slot this interval.
    optimistic: bool,
    /// Measured throughput of the last PIECE transfer from this neighbor,
    /// bytes/sec; negative means "not a download candidate".
    download_speed: f64,
    /// Monotonic: set once the remote bitfield is all-ones.
    complete: bool,
}

impl NeighborState {
    fn new(total_pieces: u32) -> Self {
        Self {
            bitfield: PieceBitfield::with_size(total_pieces),
            remote_interested: false,
            choked_by_us: true,
            choked_by_remote: true,
            optimistic: false,
            download_speed: 0.0,
            complete: false,
        }
    }
}

/// The protocol state machine for one local peer: session registry, local
/// bitfield and piece store, the per-message transitions, and the two choking
/// controllers. Single-owner; mutations leave as [`SwarmCmd`]s through
/// [`drain`](Self::drain).
#[derive(Debug)]
pub struct SwarmState {
    local_id: PeerId,
    common: Common,
    roster: Roster,
    workdir: PathBuf,
    queue: CommandQueue,
    bitfield: PieceBitfield,
    store: PieceStore,
    neighbors: BTreeMap<PeerId, NeighborState>,
    /// Current holder of the optimistic-unchoke slot.
    optimistic: Option<PeerId>,
    /// Peers known to hold the complete file, self included. Each peer is
    /// counted exactly once; the run ends when this reaches the roster size.
    completed_peers: usize,
    local_complete: bool,
    finished: bool,
    rng: StdRng,
}

impl SwarmState {
    pub fn new(
        common: Common,
        roster: Roster,
        local_id: PeerId,
        workdir: PathBuf,
    ) -> io::Result<Self> {
        let entry = roster.get(local_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("peer {local_id} is not in the roster"),
            )
        })?;

        let mut bitfield = PieceBitfield::with_size(common.total_pieces());
        let (store, local_complete) = if entry.has_file {
            let store = PieceStore::from_file(workdir.join(&common.file_name), &common)?;
            bitfield.fill();
            (store, true)
        } else {
            (PieceStore::empty(&common), false)
        };

        Ok(Self {
            local_id,
            common,
            roster,
            workdir,
            queue: Default::default(),
            bitfield,
            store,
            neighbors: Default::default(),
            optimistic: None,
            completed_peers: usize::from(local_complete),
            local_complete,
            finished: false,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SwarmCmd> + '_ {
        self.queue.0.drain(..)
    }

    /// Queue dials to every roster peer that precedes us in roster order.
    pub fn init(&mut self) {
        let targets = self
            .roster
            .preceding(self.local_id)
            .map(|e| (e.id, e.host.clone(), e.port))
            .collect::<Vec<_>>();
        for (id, host, port) in targets {
            self.queue.connect(id, host, port);
        }
        self.check_done();
    }

    /// Outbound handshake exchange succeeded with a peer we dialed.
    pub fn on_peer_connected(&mut self, peer_id: PeerId) {
        if !self.register(peer_id) {
            self.queue.disconnect(peer_id);
            return;
        }
        tracing::info!(
            "Peer {} makes a connection to Peer {}.",
            self.local_id,
            peer_id
        );
    }

    /// An inbound connection presented a handshake claiming `peer_id`.
    /// Returns false when the claim fails authentication (unknown peer, wrong
    /// dial direction, or duplicate session); the caller closes the socket.
    pub fn on_peer_accepted(&mut self, peer_id: PeerId) -> bool {
        if !self.roster.follows(self.local_id, peer_id) {
            tracing::warn!(
                "Peer {}: rejecting handshake from unexpected peer {}",
                self.local_id,
                peer_id
            );
            return false;
        }
        if !self.register(peer_id) {
            return false;
        }
        tracing::info!("Peer {} is connected from Peer {}.", self.local_id, peer_id);
        true
    }

    pub fn on_peer_failure(&mut self, peer_id: PeerId, error: &WireError) {
        tracing::warn!(
            "Peer {}: session with {} failed: {error}",
            self.local_id,
            peer_id
        );
        self.drop_neighbor(peer_id);
    }

    pub fn on_peer_message(&mut self, peer_id: PeerId, message: Message, timing: FrameTiming) {
        if !self.neighbors.contains_key(&peer_id) {
            return;
        }
        match message {
            Message::Bitfield { bitfield } => self.process_bitfield(peer_id, bitfield),
            Message::Interested => {
                if let Some(neighbor) = self.neighbors.get_mut(&peer_id) {
                    neighbor.remote_interested = true;
                }
                tracing::info!(
                    "Peer {} received the 'interested' message from {}.",
                    self.local_id,
                    peer_id
                );
            }
            Message::NotInterested => {
                tracing::info!(
                    "Peer {} received the 'not interested' message from {}.",
                    self.local_id,
                    peer_id
                );
                if let Some(neighbor) = self.neighbors.get_mut(&peer_id) {
                    neighbor.remote_interested = false;
                    if !neighbor.choked_by_us {
                        neighbor.choked_by_us = true;
                        self.queue.send(peer_id, Message::Choke);
                    }
                }
            }
            Message::Unchoke => {
                if let Some(neighbor) = self.neighbors.get_mut(&peer_id) {
                    neighbor.choked_by_remote = false;
                }
                tracing::info!("Peer {} is unchoked by {}.", self.local_id, peer_id);
                self.request_random_piece(peer_id);
            }
            Message::Choke => {
                // outstanding requests are implicitly abandoned
                if let Some(neighbor) = self.neighbors.get_mut(&peer_id) {
                    neighbor.choked_by_remote = true;
                }
                tracing::info!("Peer {} is choked by {}.", self.local_id, peer_id);
            }
            Message::Request { index } => self.process_request(peer_id, index),
            Message::Piece { index, data } => self.process_piece(peer_id, index, data, timing),
            Message::Have { index } => self.process_have(peer_id, index),
        }
        self.check_done();
    }

    /// Preferred-neighbors pass, once per unchoking interval.
    pub fn on_preferred_tick(&mut self) {
        let interested = self
            .neighbors
            .iter()
            .filter(|(_, n)| n.remote_interested)
            .map(|(&id, n)| (id, n.download_speed))
            .collect::<Vec<_>>();
        if interested.is_empty() {
            return;
        }

        let k = self.common.preferred_neighbors;
        let (pool, chosen) = if self.local_complete {
            // random selection once we have nothing left to download for
            let pool = interested.iter().map(|&(id, _)| id).collect::<Vec<_>>();
            let chosen = pool
                .choose_multiple(&mut self.rng, k)
                .copied()
                .collect::<Vec<_>>();
            (pool, chosen)
        } else {
            let mut candidates = interested
                .iter()
                .copied()
                .filter(|&(_, speed)| speed >= 0.0)
                .collect::<Vec<_>>();
            let pool = candidates.iter().map(|&(id, _)| id).collect::<Vec<_>>();
            let chosen = if candidates.len() <= k {
                pool.clone()
            } else {
                // fastest first; ties resolve to the lower peer id so one
                // cycle's choice is reproducible
                candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                candidates[..k].iter().map(|&(id, _)| id).collect()
            };
            (pool, chosen)
        };

        for &id in &chosen {
            self.unchoke(id);
        }
        for &id in &pool {
            if !chosen.contains(&id) {
                self.choke_unless_optimistic(id);
            }
        }

        if !chosen.is_empty() {
            tracing::info!(
                "Peer {} has the preferred neighbors {:?}.",
                self.local_id,
                chosen.iter().map(|&id| u32::from(id)).collect::<Vec<_>>()
            );
        }
    }

    /// Optimistic-unchoke pass, once per optimistic interval. The previous
    /// holder loses the flag here and is re-choked by the next preferred pass
    /// unless it earned a slot on its own.
    pub fn on_optimistic_tick(&mut self) {
        if let Some(previous) = self.optimistic.take() {
            if let Some(neighbor) = self.neighbors.get_mut(&previous) {
                neighbor.optimistic = false;
            }
        }

        let interested = self
            .neighbors
            .iter()
            .filter(|(_, n)| n.remote_interested)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        let Some(&pick) = interested.choose(&mut self.rng) else {
            return;
        };

        self.optimistic = Some(pick);
        if let Some(neighbor) = self.neighbors.get_mut(&pick) {
            neighbor.optimistic = true;
            if neighbor.choked_by_us {
                neighbor.choked_by_us = false;
                self.queue.send(pick, Message::Unchoke);
            }
        }
        tracing::info!(
            "Peer {} has the optimistically unchoked neighbor {}.",
            self.local_id,
            pick
        );
    }
}

impl SwarmState {
    fn register(&mut self, peer_id: PeerId) -> bool {
        if self.neighbors.contains_key(&peer_id) {
            tracing::warn!(
                "Peer {}: duplicate session for peer {}, dropping it",
                self.local_id,
                peer_id
            );
            return false;
        }
        self.neighbors
            .insert(peer_id, NeighborState::new(self.common.total_pieces()));
        // the bitfield always opens the conversation
        self.queue.send(
            peer_id,
            Message::Bitfield {
                bitfield: self.bitfield.clone(),
            },
        );
        true
    }

    fn drop_neighbor(&mut self, peer_id: PeerId) {
        self.neighbors.remove(&peer_id);
        if self.optimistic == Some(peer_id) {
            self.optimistic = None;
        }
        self.queue.disconnect(peer_id);
    }

    fn process_bitfield(&mut self, peer_id: PeerId, bitfield: PieceBitfield) {
        if bitfield.len() != self.common.total_pieces() {
            tracing::warn!(
                "Peer {}: peer {} sent a bitfield for {} pieces, expected {}",
                self.local_id,
                peer_id,
                bitfield.len(),
                self.common.total_pieces()
            );
            self.drop_neighbor(peer_id);
            return;
        }

        let interested = self.bitfield.interested_in(&bitfield);
        let remote_complete = bitfield.complete();
        match self.neighbors.get_mut(&peer_id) {
            Some(neighbor) => neighbor.bitfield = bitfield,
            None => return,
        }
        if remote_complete {
            self.mark_remote_complete(peer_id);
        }
        self.queue.send(
            peer_id,
            if interested {
                Message::Interested
            } else {
                Message::NotInterested
            },
        );
    }

    fn process_request(&mut self, peer_id: PeerId, index: PieceIdx) {
        // a request for a piece we do not hold is dropped on the floor
        if let Some(data) = self.store.get(index) {
            self.queue.send(peer_id, Message::Piece { index, data });
        }
    }

    fn process_piece(&mut self, peer_id: PeerId, index: PieceIdx, data: Bytes, timing: FrameTiming) {
        if u32::from(index) >= self.common.total_pieces() {
            tracing::warn!(
                "Peer {}: peer {} sent piece {} outside the piece space",
                self.local_id,
                peer_id,
                index
            );
            self.drop_neighbor(peer_id);
            return;
        }

        self.store.insert_if_absent(index, data);
        self.bitfield.set_piece(index);

        let still_unchoked = match self.neighbors.get_mut(&peer_id) {
            Some(neighbor) => {
                neighbor.download_speed = if neighbor.complete {
                    SPEED_INELIGIBLE
                } else {
                    timing.throughput()
                };
                !neighbor.choked_by_remote
            }
            None => return,
        };

        tracing::info!(
            "Peer {} has downloaded the piece {} from {}. Now has {}/{} pieces.",
            self.local_id,
            index,
            peer_id,
            self.bitfield.num_set(),
            self.common.total_pieces()
        );

        if still_unchoked {
            self.request_random_piece(peer_id);
        }

        let connected = self.neighbors.keys().copied().collect::<Vec<_>>();
        for id in connected {
            self.queue.send(id, Message::Have { index });
        }

        if !self.local_complete && self.bitfield.complete() {
            self.finish_download();
        }
    }

    fn process_have(&mut self, peer_id: PeerId, index: PieceIdx) {
        if u32::from(index) >= self.common.total_pieces() {
            tracing::warn!(
                "Peer {}: peer {} sent have for piece {} outside the piece space",
                self.local_id,
                peer_id,
                index
            );
            self.drop_neighbor(peer_id);
            return;
        }

        let (interested, remote_complete) = match self.neighbors.get_mut(&peer_id) {
            Some(neighbor) => {
                neighbor.bitfield.set_piece(index);
                (
                    self.bitfield.interested_in(&neighbor.bitfield),
                    neighbor.bitfield.complete(),
                )
            }
            None => return,
        };

        tracing::info!(
            "Peer {} received the 'have' message from {} for the piece {}.",
            self.local_id,
            peer_id,
            index
        );

        if remote_complete {
            self.mark_remote_complete(peer_id);
        }
        self.queue.send(
            peer_id,
            if interested {
                Message::Interested
            } else {
                Message::NotInterested
            },
        );
    }

    fn request_random_piece(&mut self, peer_id: PeerId) {
        let Some(neighbor) = self.neighbors.get(&peer_id) else {
            return;
        };
        if let Some(index) = self
            .bitfield
            .random_missing_in(&neighbor.bitfield, &mut self.rng)
        {
            self.queue.send(peer_id, Message::Request { index });
        }
    }

    fn unchoke(&mut self, peer_id: PeerId) {
        if let Some(neighbor) = self.neighbors.get_mut(&peer_id) {
            if neighbor.choked_by_us {
                neighbor.choked_by_us = false;
                self.queue.send(peer_id, Message::Unchoke);
            }
        }
    }

    fn choke_unless_optimistic(&mut self, peer_id: PeerId) {
        if let Some(neighbor) = self.neighbors.get_mut(&peer_id) {
            if !neighbor.choked_by_us && !neighbor.optimistic {
                neighbor.choked_by_us = true;
                self.queue.send(peer_id, Message::Choke);
            }
        }
    }

    fn mark_remote_complete(&mut self, peer_id: PeerId) {
        let Some(neighbor) = self.neighbors.get_mut(&peer_id) else {
            return;
        };
        if neighbor.complete {
            return;
        }
        neighbor.complete = true;
        neighbor.download_speed = SPEED_INELIGIBLE;
        self.completed_peers += 1;
        tracing::info!(
            "Peer {}: neighbor {} now has the complete file.",
            self.local_id,
            peer_id
        );
    }

    fn finish_download(&mut self) {
        let path = self.workdir.join(&self.common.file_name);
        match self.store.write_assembled(&path) {
            Ok(()) => {
                self.local_complete = true;
                self.completed_peers += 1;
                tracing::info!("Peer {} has downloaded the complete file.", self.local_id);
            }
            Err(error) => {
                tracing::error!(
                    "Peer {} failed to write {}: {error}",
                    self.local_id,
                    path.display()
                );
                self.finished = true;
                self.queue.shutdown(Some(error));
            }
        }
    }

    fn check_done(&mut self) {
        if !self.finished && self.completed_peers == self.roster.len() {
            self.finished = true;
            tracing::info!(
                "Peer {}: every peer in the roster has the complete file, shutting down.",
                self.local_id
            );
            self.queue.shutdown(None);
        }
    }
}
