//! Concurrent block download over a round range.
//!
//! A fetcher task partitions `[round_from, round_to]` into fixed-width
//! chunks and keeps every registered peer busy up to its in-flight cap.
//! Chunks whose peers miss their deadline are reassigned; a peer missing
//! two deadlines in a row has its cap halved, and a peer serving blocks
//! outside the requested range is dropped. Accepted blocks flow into a
//! bounded channel, so a slow consumer throttles the whole task.

use crate::chain::{Chain, ChainError, Packer};
use crate::config::SyncConfig;
use crate::peer::{DropPeerFn, PeerError, PeerId, SyncPeer};
use crate::protocol::SyncStage;
use crate::NodeTypes;
use fnv::FnvHashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use slog::{debug, info, warn, Logger};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use types::{Block, Hash256};

/// Consecutive deadline misses before a peer's in-flight cap is halved.
const MISSES_BEFORE_DEMOTION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No usable peers were registered, or every peer was dropped.
    NoPeers,
    /// A chunk exhausted its retry budget.
    FailedGetBlock { round_from: u64, round_to: u64 },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NoPeers => write!(f, "no peers available for block fetch"),
            FetchError::FailedGetBlock {
                round_from,
                round_to,
            } => write!(
                f,
                "failed to get blocks for rounds [{}, {}]",
                round_from, round_to
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Pending,
    InFlight,
    Complete,
}

struct Chunk {
    round_from: u64,
    round_to: u64,
    state: ChunkState,
    retries: u8,
    attempted: SmallVec<[PeerId; 4]>,
}

struct FetcherPeer<P> {
    peer: Arc<P>,
    in_flight: usize,
    cap: usize,
    misses: u8,
}

/// Peer registry scoped to one fetcher task.
pub(crate) struct PeersManager<P: SyncPeer> {
    peers: FnvHashMap<PeerId, FetcherPeer<P>>,
    rotation: Vec<PeerId>,
    next: usize,
    initial_cap: usize,
    drop_peer: DropPeerFn,
}

impl<P: SyncPeer> PeersManager<P> {
    fn new(drop_peer: DropPeerFn, initial_cap: usize) -> Self {
        PeersManager {
            peers: FnvHashMap::default(),
            rotation: Vec::new(),
            next: 0,
            initial_cap: initial_cap.max(1),
            drop_peer,
        }
    }

    fn register(&mut self, peer: Arc<P>) -> bool {
        if peer.is_closed() {
            return false;
        }
        let id = peer.id();
        if self.peers.contains_key(&id) {
            return true;
        }
        self.rotation.push(id.clone());
        self.peers.insert(
            id,
            FetcherPeer {
                peer,
                in_flight: 0,
                cap: self.initial_cap,
                misses: 0,
            },
        );
        true
    }

    fn len(&self) -> usize {
        self.peers.len()
    }

    fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn get(&self, id: &PeerId) -> Option<Arc<P>> {
        self.peers.get(id).map(|entry| entry.peer.clone())
    }

    /// Peers in round-robin order starting at the rotation pointer.
    fn rotation_order(&self) -> Vec<Arc<P>> {
        let n = self.rotation.len();
        (0..n)
            .filter_map(|step| {
                let id = &self.rotation[(self.next + step) % n];
                self.get(id)
            })
            .collect()
    }

    /// Picks an idle peer for the chunk: first a fresh peer whose head
    /// covers the chunk, then any fresh peer, then anyone with capacity.
    fn idle_peer(&mut self, chunk: &Chunk) -> Option<Arc<P>> {
        let n = self.rotation.len();
        if n == 0 {
            return None;
        }
        for pass in 0..3 {
            for step in 0..n {
                let index = (self.next + step) % n;
                let id = self.rotation[index].clone();
                let entry = match self.peers.get(&id) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.in_flight >= entry.cap {
                    continue;
                }
                let fresh = !chunk.attempted.contains(&id);
                let covers = entry.peer.head().round >= chunk.round_to;
                let eligible = match pass {
                    0 => fresh && covers,
                    1 => fresh,
                    _ => true,
                };
                if eligible {
                    self.next = (index + 1) % n;
                    return Some(entry.peer.clone());
                }
            }
        }
        None
    }

    fn start_request(&mut self, id: &PeerId) {
        if let Some(entry) = self.peers.get_mut(id) {
            entry.in_flight += 1;
        }
    }

    fn on_delivered(&mut self, id: &PeerId) {
        if let Some(entry) = self.peers.get_mut(id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.misses = 0;
        }
    }

    /// Records a missed deadline. Returns true if the peer was demoted.
    fn on_missed(&mut self, id: &PeerId) -> bool {
        if let Some(entry) = self.peers.get_mut(id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.misses += 1;
            if entry.misses >= MISSES_BEFORE_DEMOTION {
                entry.misses = 0;
                entry.cap = (entry.cap / 2).max(1);
                return true;
            }
        }
        false
    }

    fn drop_peer(&mut self, id: &PeerId, blacklist: bool) {
        // Late responses from an already dropped peer must not notify the
        // network layer twice.
        if self.peers.remove(id).is_some() {
            self.rotation.retain(|other| other != id);
            (self.drop_peer)(id, blacklist);
        }
    }
}

type ChunkResponse = (u64, PeerId, Result<Vec<Block>, PeerError>);

pub struct BlockFetcher<T: NodeTypes> {
    chain: Arc<T::Chain>,
    packer: Arc<T::Packer>,
    peers: PeersManager<T::Peer>,
    stage: SyncStage,
    round_from: u64,
    round_to: u64,
    auto_stop: bool,
    /// With `auto_stop`, the task only completes once this hash has been
    /// delivered (or is already local).
    target_head: Option<Hash256>,
    config: SyncConfig,
    block_tx: mpsc::Sender<Block>,
    quit: watch::Receiver<bool>,
    delivered: HashSet<Hash256>,
    head_seen: bool,
    consumer_gone: bool,
    log: Logger,
}

impl<T: NodeTypes> BlockFetcher<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<T::Chain>,
        packer: Arc<T::Packer>,
        peers: Vec<Arc<T::Peer>>,
        drop_peer: DropPeerFn,
        config: SyncConfig,
        stage: SyncStage,
        round_from: u64,
        round_to: u64,
        auto_stop: bool,
        target_head: Option<Hash256>,
        block_tx: mpsc::Sender<Block>,
        quit: watch::Receiver<bool>,
        log: Logger,
    ) -> Result<Self, FetchError> {
        let mut manager = PeersManager::new(drop_peer, config.max_requests_per_peer);
        for peer in peers {
            if !manager.register(peer.clone()) {
                debug!(log, "Skipping closed peer"; "peer" => %peer.id());
            }
        }
        if manager.is_empty() {
            return Err(FetchError::NoPeers);
        }
        info!(
            log, "Starting block fetch";
            "round_from" => round_from,
            "round_to" => round_to,
            "peers" => manager.len(),
            "auto_stop" => auto_stop,
            "stage" => %stage,
        );
        Ok(BlockFetcher {
            chain,
            packer,
            peers: manager,
            stage,
            round_from,
            round_to,
            auto_stop,
            target_head,
            config,
            block_tx,
            quit,
            delivered: HashSet::new(),
            head_seen: false,
            consumer_gone: false,
            log,
        })
    }

    pub async fn run(mut self) -> Result<(), FetchError> {
        // Blocks the chain already holds flow to the consumer first; peers
        // only re-deliver what is genuinely missing.
        let local = self
            .chain
            .blocks_in_round_range(self.round_from, self.round_to);
        for block in local {
            self.note_delivered(block.full_hash());
            if self.block_tx.send(block).await.is_err() {
                return Ok(());
            }
        }

        let mut chunks = self.partition();
        let mut requests: FuturesUnordered<BoxFuture<'static, ChunkResponse>> =
            FuturesUnordered::new();

        loop {
            if *self.quit.borrow() || self.consumer_gone {
                return Ok(());
            }
            self.assign(&mut chunks, &mut requests);

            if requests.is_empty() {
                let all_complete = chunks
                    .values()
                    .all(|chunk| chunk.state == ChunkState::Complete);
                if all_complete {
                    if !self.auto_stop {
                        // Range exhausted; park until told to stop.
                        let _ = self.quit.changed().await;
                        return Ok(());
                    }
                    if self.target_satisfied() {
                        info!(self.log, "Block fetch complete"; "rounds" => self.round_to - self.round_from + 1);
                        return Ok(());
                    }
                    // Every round is filled yet the target head never
                    // arrived: retry the final chunk with fresh peers.
                    match chunks.values_mut().next_back() {
                        Some(chunk) => {
                            self.repend(chunk)?;
                            chunk.attempted.clear();
                            continue;
                        }
                        None => {
                            return Err(FetchError::FailedGetBlock {
                                round_from: self.round_from,
                                round_to: self.round_to,
                            })
                        }
                    }
                }
                if self.peers.is_empty() {
                    return Err(FetchError::NoPeers);
                }
                // Nothing in flight, peers available, and still nobody was
                // assignable: every pending chunk has tried everyone.
                for chunk in chunks.values_mut() {
                    if chunk.state == ChunkState::Pending {
                        self.repend(chunk)?;
                        chunk.attempted.clear();
                    }
                }
                continue;
            }

            tokio::select! {
                Some(response) = requests.next() => {
                    self.handle_response(response, &mut chunks).await?;
                }
                _ = self.quit.changed() => return Ok(()),
            }
        }
    }

    fn partition(&self) -> BTreeMap<u64, Chunk> {
        let mut chunks = BTreeMap::new();
        if self.round_from > self.round_to {
            return chunks;
        }
        let width = self.config.rounds_per_chunk.max(1);
        let mut id = 0u64;
        let mut start = self.round_from;
        loop {
            let end = std::cmp::min(start.saturating_add(width - 1), self.round_to);
            chunks.insert(
                id,
                Chunk {
                    round_from: start,
                    round_to: end,
                    state: ChunkState::Pending,
                    retries: 0,
                    attempted: SmallVec::new(),
                },
            );
            if end == self.round_to {
                break;
            }
            id += 1;
            start = end + 1;
        }
        chunks
    }

    fn assign(
        &mut self,
        chunks: &mut BTreeMap<u64, Chunk>,
        requests: &mut FuturesUnordered<BoxFuture<'static, ChunkResponse>>,
    ) {
        for (&chunk_id, chunk) in chunks.iter_mut() {
            if chunk.state != ChunkState::Pending {
                continue;
            }
            let peer = match self.peers.idle_peer(chunk) {
                Some(peer) => peer,
                None => continue,
            };
            let peer_id = peer.id();
            chunk.state = ChunkState::InFlight;
            chunk.attempted.push(peer_id.clone());
            self.peers.start_request(&peer_id);
            debug!(
                self.log, "Requesting chunk";
                "chunk" => chunk_id,
                "round_from" => chunk.round_from,
                "round_to" => chunk.round_to,
                "peer" => %peer_id,
            );
            let stage = self.stage;
            let (from, to) = (chunk.round_from, chunk.round_to);
            let deadline = self.config.chunk_timeout();
            requests.push(Box::pin(async move {
                let result = match timeout(deadline, peer.blocks_by_round_range(stage, from, to))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(PeerError::Timeout),
                };
                (chunk_id, peer_id, result)
            }));
        }
    }

    async fn handle_response(
        &mut self,
        (chunk_id, peer_id, result): ChunkResponse,
        chunks: &mut BTreeMap<u64, Chunk>,
    ) -> Result<(), FetchError> {
        let chunk = chunks.get_mut(&chunk_id).expect("responses match a chunk");
        let blocks = match result {
            Ok(blocks) => blocks,
            Err(e) => {
                debug!(
                    self.log, "Chunk request failed";
                    "chunk" => chunk_id, "peer" => %peer_id, "error" => %e,
                );
                if let PeerError::Malformed(_) = e {
                    self.peers.drop_peer(&peer_id, false);
                } else if self.peers.on_missed(&peer_id) {
                    debug!(self.log, "Peer demoted"; "peer" => %peer_id);
                }
                return self.repend(chunk);
            }
        };

        let out_of_range = blocks
            .iter()
            .any(|block| block.round() < chunk.round_from || block.round() > chunk.round_to);
        if out_of_range {
            warn!(
                self.log, "Peer served blocks outside the requested rounds";
                "chunk" => chunk_id, "peer" => %peer_id,
            );
            self.peers.drop_peer(&peer_id, false);
            return self.repend(chunk);
        }

        if blocks.is_empty() {
            debug!(
                self.log, "Empty chunk response counts as a miss";
                "chunk" => chunk_id, "peer" => %peer_id,
            );
            if self.peers.on_missed(&peer_id) {
                debug!(self.log, "Peer demoted"; "peer" => %peer_id);
            }
            return self.repend(chunk);
        }

        self.peers.on_delivered(&peer_id);
        chunk.state = ChunkState::Complete;
        let delivering_peer = self.peers.get(&peer_id);

        for block in blocks {
            let hash = block.full_hash();
            if self.delivered.contains(&hash) {
                // A chunk already satisfied elsewhere; duplicates are fine.
                continue;
            }
            if self.chain.has_block(&hash) {
                self.note_delivered(hash);
                continue;
            }
            self.fulfil_packages(&block, delivering_peer.as_ref()).await;
            self.note_delivered(hash);
            if self.block_tx.send(block).await.is_err() {
                self.consumer_gone = true;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Fetches the tx packages a block references but the node lacks: the
    /// delivering peer first, then round-robin over the rest.
    async fn fulfil_packages(&mut self, block: &Block, from: Option<&Arc<T::Peer>>) {
        let mut remaining: Vec<Hash256> = block
            .header
            .tx_package_hashes
            .iter()
            .filter(|hash| {
                !self.chain.has_tx_package(hash) && !self.chain.is_tx_package_in_future(hash)
            })
            .copied()
            .collect();
        if remaining.is_empty() {
            return;
        }
        debug!(
            self.log, "Fetching referenced tx packages";
            "block" => ?block.full_hash(), "missing" => remaining.len(),
        );

        let mut candidates: Vec<Arc<T::Peer>> = Vec::new();
        if let Some(peer) = from {
            candidates.push(peer.clone());
        }
        for peer in self.peers.rotation_order() {
            if from.map(|p| p.id()) != Some(peer.id()) {
                candidates.push(peer);
            }
        }

        for peer in candidates {
            let result = timeout(
                self.config.chunk_timeout(),
                peer.tx_packages(self.stage, remaining.clone()),
            )
            .await;
            match result {
                Ok(Ok(pkgs)) => {
                    for pkg in pkgs {
                        if !remaining.contains(&pkg.hash()) {
                            continue;
                        }
                        match self.chain.verify_tx_package(&pkg) {
                            Ok(()) => {
                                let _ = self.packer.insert_remote_tx_package(pkg.clone());
                                remaining.retain(|hash| *hash != pkg.hash());
                            }
                            Err(ChainError::PackageRelatedBlockNotFound(related)) => {
                                // Parked until the related block arrives.
                                debug!(
                                    self.log, "Tx package relates to a future block";
                                    "pkg" => ?pkg.hash(), "related" => ?related,
                                );
                                remaining.retain(|hash| *hash != pkg.hash());
                            }
                            Err(e) => {
                                warn!(
                                    self.log, "Fetched tx package failed verification";
                                    "pkg" => ?pkg.hash(), "peer" => %peer.id(), "error" => %e,
                                );
                            }
                        }
                    }
                    if remaining.is_empty() {
                        return;
                    }
                }
                _ => {
                    debug!(
                        self.log, "Tx package request failed, trying next peer";
                        "peer" => %peer.id(),
                    );
                }
            }
        }
        if !remaining.is_empty() {
            warn!(
                self.log, "Tx packages still missing after asking every peer";
                "block" => ?block.full_hash(), "missing" => remaining.len(),
            );
        }
    }

    fn repend(&self, chunk: &mut Chunk) -> Result<(), FetchError> {
        chunk.retries += 1;
        if chunk.retries > self.config.chunk_retry_limit {
            return Err(FetchError::FailedGetBlock {
                round_from: chunk.round_from,
                round_to: chunk.round_to,
            });
        }
        chunk.state = ChunkState::Pending;
        Ok(())
    }

    fn note_delivered(&mut self, hash: Hash256) {
        if self.target_head == Some(hash) {
            self.head_seen = true;
        }
        self.delivered.insert(hash);
    }

    fn target_satisfied(&self) -> bool {
        match self.target_head {
            None => true,
            Some(hash) => self.head_seen || self.chain.has_block(&hash),
        }
    }
}
