//! The synchronizer: a single-owner event loop over the four sync states.
//!
//! All state transitions happen on this loop. Sub-sync drivers (fast sync,
//! peer sync, background catch-up) run as separate tasks and report back
//! exclusively through [`SyncMessage`]s; rollback and peer discipline
//! never race with a driver.

use crate::chain::{Chain, Miner};
use crate::config::SyncConfig;
use crate::cp2fp;
use crate::fast_sync;
use crate::peer::{DependResolvedFn, DropPeerFn, PeerId, PeerPool, SyncPeer};
use crate::peer_sync;
use crate::state_sync::Hasher;
use crate::status::{FastSyncMode, FastSyncStatus, SyncGlobals, SyncStatus};
use crate::NodeTypes;
use fnv::FnvHashMap;
use rand::rngs::StdRng;
use slog::{debug, error, info, o, warn, Logger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use types::Block;

/// Capacity of the event channel. Senders block when it is full; events
/// are never dropped.
const EVENT_CHANNEL_CAPACITY: usize = 20;

/// Events multiplexed by the synchronizer loop.
pub enum SyncMessage<T: NodeTypes> {
    AddPeer(Arc<T::Peer>),
    RemovePeer(PeerId),
    /// The host saw a deep dependency failure on a block from this peer.
    DependencyMissing(Arc<T::Peer>),
    FastSyncFinished,
    FastSyncFailed,
    PeerSyncFinished(PeerId),
    PeerSyncFailed(PeerId),
    /// A failed peer's cooldown ran out; it may be peer-synced again.
    PeerSyncCooldownElapsed(PeerId),
}

impl<T: NodeTypes> SyncMessage<T> {
    fn kind(&self) -> &'static str {
        match self {
            SyncMessage::AddPeer(_) => "add_peer",
            SyncMessage::RemovePeer(_) => "remove_peer",
            SyncMessage::DependencyMissing(_) => "dependency_missing",
            SyncMessage::FastSyncFinished => "fast_sync_finished",
            SyncMessage::FastSyncFailed => "fast_sync_failed",
            SyncMessage::PeerSyncFinished(_) => "peer_sync_finished",
            SyncMessage::PeerSyncFailed(_) => "peer_sync_failed",
            SyncMessage::PeerSyncCooldownElapsed(_) => "peer_sync_cooldown_elapsed",
        }
    }
}

/// Front door to a running [`Synchronizer`].
pub struct SyncHandle<T: NodeTypes> {
    event_tx: mpsc::Sender<SyncMessage<T>>,
    pool: Arc<PeerPool<T::Peer>>,
    globals: Arc<SyncGlobals>,
    quit_tx: watch::Sender<bool>,
}

impl<T: NodeTypes> SyncHandle<T> {
    /// Registers a connected peer and wakes the loop. Blocks when the
    /// event channel is full.
    pub async fn add_peer(&self, peer: Arc<T::Peer>) {
        self.pool.insert(peer.clone());
        let _ = self.event_tx.send(SyncMessage::AddPeer(peer)).await;
    }

    pub async fn remove_peer(&self, id: PeerId) {
        self.pool.remove(&id);
        let _ = self.event_tx.send(SyncMessage::RemovePeer(id)).await;
    }

    /// Reports a dependency-missing verification failure on a block
    /// received from `peer`.
    pub async fn dependency_missing(&self, peer: Arc<T::Peer>) {
        let _ = self
            .event_tx
            .send(SyncMessage::DependencyMissing(peer))
            .await;
    }

    pub fn status(&self) -> SyncStatus {
        self.globals.status()
    }

    pub fn fast_sync_mode(&self) -> FastSyncMode {
        self.globals.fast_sync_mode()
    }

    pub fn fast_sync_status(&self) -> FastSyncStatus {
        self.globals.fast_sync_status()
    }

    pub fn globals(&self) -> Arc<SyncGlobals> {
        self.globals.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.pool.len()
    }

    /// Stops the loop and every sub-sync task.
    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }
}

pub struct Synchronizer<T: NodeTypes> {
    chain: Arc<T::Chain>,
    packer: Arc<T::Packer>,
    miner: Option<Arc<T::Miner>>,
    pool: Arc<PeerPool<T::Peer>>,
    drop_peer: DropPeerFn,
    depend_resolved: DependResolvedFn,
    hasher: Hasher,
    config: SyncConfig,
    globals: Arc<SyncGlobals>,

    /// Head at the start of the current attempt; restored on failure.
    last_head_block: Option<Block>,
    /// Peers with a peer sync in progress or cooling down.
    peer_sync_started: FnvHashMap<PeerId, bool>,

    /// Quit signal of the background catch-up task, if one is running.
    cp2fp_quit: Option<watch::Sender<bool>>,
    /// Quit signal of the fast-sync or peer-sync driver, if one is running.
    sub_sync_quit: Option<watch::Sender<bool>>,

    event_tx: mpsc::Sender<SyncMessage<T>>,
    quit_rx: watch::Receiver<bool>,
    /// Diagnostic ids for sub-tasks (fetchers, cursors, downloads).
    task_ids: Arc<AtomicUsize>,
    log: Logger,
}

impl<T: NodeTypes> Synchronizer<T> {
    /// Builds a synchronizer, spawns its loop onto the runtime and returns
    /// the handle the host talks to.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        chain: Arc<T::Chain>,
        packer: Arc<T::Packer>,
        miner: Option<Arc<T::Miner>>,
        drop_peer: DropPeerFn,
        depend_resolved: DependResolvedFn,
        hasher: Hasher,
        config: SyncConfig,
        log: Logger,
    ) -> SyncHandle<T> {
        Self::spawn_with_rng(
            chain,
            packer,
            miner,
            drop_peer,
            depend_resolved,
            hasher,
            config,
            log,
            rand::SeedableRng::from_entropy(),
        )
    }

    /// As [`Self::spawn`], with the sampling RNG injected.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_with_rng(
        chain: Arc<T::Chain>,
        packer: Arc<T::Packer>,
        miner: Option<Arc<T::Miner>>,
        drop_peer: DropPeerFn,
        depend_resolved: DependResolvedFn,
        hasher: Hasher,
        config: SyncConfig,
        log: Logger,
        rng: StdRng,
    ) -> SyncHandle<T> {
        let log = log.new(o!("service" => "sync"));
        let pool = Arc::new(PeerPool::with_rng(drop_peer.clone(), rng));
        let globals = Arc::new(SyncGlobals::new());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (quit_tx, quit_rx) = watch::channel(false);

        // Dropping a peer always goes through the pool so the registry and
        // the network layer stay consistent.
        let pool_for_drop = pool.clone();
        let drop_peer: DropPeerFn = Arc::new(move |id: &PeerId, blacklist| {
            pool_for_drop.drop_peer(id, blacklist);
        });

        let synchronizer = Synchronizer {
            chain,
            packer,
            miner,
            pool: pool.clone(),
            drop_peer,
            depend_resolved,
            hasher,
            config,
            globals: globals.clone(),
            last_head_block: None,
            peer_sync_started: FnvHashMap::default(),
            cp2fp_quit: None,
            sub_sync_quit: None,
            event_tx: event_tx.clone(),
            quit_rx: quit_rx.clone(),
            task_ids: Arc::new(AtomicUsize::new(0)),
            log,
        };
        tokio::spawn(synchronizer.main_loop(event_rx));

        SyncHandle {
            event_tx,
            pool,
            globals,
            quit_tx,
        }
    }

    async fn main_loop(mut self, mut event_rx: mpsc::Receiver<SyncMessage<T>>) {
        info!(self.log, "Synchronizer started"; "status" => %self.globals.status());
        loop {
            tokio::select! {
                message = event_rx.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
                _ = self.quit_rx.changed() => break,
            }
        }
        error!(self.log, "Synchronizer stopped"; "status" => %self.globals.status());
        self.kill_cp2fp();
        self.kill_sub_sync();
    }

    async fn handle_message(&mut self, message: SyncMessage<T>) {
        let status = self.globals.status();
        debug!(self.log, "Sync event"; "event" => message.kind(), "status" => %status);
        match message {
            SyncMessage::AddPeer(peer) => {
                info!(
                    self.log, "New peer";
                    "peer" => %peer.id(), "peers" => self.pool.len(), "status" => %status,
                );
                match status {
                    SyncStatus::Init => self.do_init(),
                    SyncStatus::Normal => self.check_peer(peer),
                    SyncStatus::FastSync | SyncStatus::PeerSync => {}
                }
            }
            SyncMessage::RemovePeer(id) => {
                info!(self.log, "Peer removed"; "peer" => %id, "peers" => self.pool.len());
            }
            SyncMessage::DependencyMissing(peer) => {
                if status == SyncStatus::Normal {
                    self.check_peer(peer);
                }
            }
            SyncMessage::FastSyncFinished => {
                info!(self.log, "Fast sync finished"; "status" => %status);
                if status == SyncStatus::FastSync {
                    if let Some(miner) = &self.miner {
                        miner.start();
                    }
                    self.globals.set_status(SyncStatus::Normal);
                    self.last_head_block = None;
                    self.sub_sync_quit = None;
                }
            }
            SyncMessage::FastSyncFailed => {
                error!(self.log, "Fast sync failed"; "status" => %status);
                if status == SyncStatus::FastSync {
                    self.globals.set_status(SyncStatus::Init);
                    self.globals.set_fast_sync_mode(FastSyncMode::None);
                    self.globals.set_fast_sync_status(FastSyncStatus::None);
                    self.rollback();
                    self.sub_sync_quit = None;
                    self.do_init();
                }
            }
            SyncMessage::PeerSyncFinished(id) => {
                info!(self.log, "Peer sync finished"; "peer" => %id, "status" => %status);
                if status == SyncStatus::PeerSync {
                    if let Some(miner) = &self.miner {
                        miner.start();
                    }
                    self.globals.set_status(SyncStatus::Normal);
                    self.last_head_block = None;
                    self.sub_sync_quit = None;
                    self.peer_sync_started.insert(id.clone(), false);
                    (self.depend_resolved)(&id);
                    self.start_cp2fp();
                }
            }
            SyncMessage::PeerSyncFailed(id) => {
                error!(self.log, "Peer sync failed"; "peer" => %id, "status" => %status);
                if status == SyncStatus::PeerSync {
                    if let Some(miner) = &self.miner {
                        miner.start();
                    }
                    self.globals.set_status(SyncStatus::Normal);
                    self.rollback();
                    self.sub_sync_quit = None;
                    // The cooldown expiry is routed back through the loop;
                    // no state is touched from the timer task.
                    let cooldown = self.config.finish_depend_err_time();
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(cooldown).await;
                        let _ = event_tx
                            .send(SyncMessage::PeerSyncCooldownElapsed(id))
                            .await;
                    });
                    self.start_cp2fp();
                }
            }
            SyncMessage::PeerSyncCooldownElapsed(id) => {
                debug!(self.log, "Peer sync cooldown elapsed"; "peer" => %id);
                self.peer_sync_started.insert(id.clone(), false);
                (self.depend_resolved)(&id);
            }
        }
    }

    /// Decides between fast sync and background catch-up once enough peers
    /// are connected.
    fn do_init(&mut self) {
        if self.pool.len() < self.config.min_regular_peer_count {
            info!(
                self.log, "Not enough peers for sync";
                "peers" => self.pool.len(),
                "required" => self.config.min_regular_peer_count,
            );
            return;
        }

        let diff = self.height_diff_from_regular_peers();
        if diff < self.config.height_diff as i64 {
            self.start_cp2fp();
            self.globals.set_status(SyncStatus::Normal);
            return;
        }

        if self.pool.len() >= self.config.min_fast_sync_peer_count {
            self.start_fast_sync();
        } else {
            info!(
                self.log, "Not enough peers for fast sync";
                "peers" => self.pool.len(),
                "required" => self.config.min_fast_sync_peer_count,
            );
        }
    }

    /// Height lag behind a random regular-peer sample; negative when the
    /// local chain is ahead.
    fn height_diff_from_regular_peers(&self) -> i64 {
        let current_height = self.chain.current_block().height();
        let sample = self
            .pool
            .random_sample(self.config.min_regular_peer_count);
        let highest = sample
            .iter()
            .map(|peer| peer.head().height)
            .max()
            .unwrap_or(0);
        if current_height >= highest {
            return -1;
        }
        let diff = (highest - current_height) as i64;
        debug!(
            self.log, "Height diff from sampled peers";
            "diff" => diff, "highest" => highest, "current" => current_height,
        );
        diff
    }

    /// Starts a peer sync against `peer` if its head is far enough ahead
    /// and it is not cooling down.
    fn check_peer(&mut self, peer: Arc<T::Peer>) {
        let peer_height = peer.head().height;
        let current_height = self.chain.current_block().height();
        if current_height + self.config.peer_sync_threshold >= peer_height {
            return;
        }
        let id = peer.id();
        if *self.peer_sync_started.get(&id).unwrap_or(&false) {
            debug!(self.log, "Peer sync already started or cooling down"; "peer" => %id);
            return;
        }
        info!(
            self.log, "Starting peer sync";
            "peer" => %id, "peer_height" => peer_height, "current_height" => current_height,
        );
        self.peer_sync_started.insert(id.clone(), true);
        self.globals.set_status(SyncStatus::PeerSync);
        self.last_head_block = Some(self.chain.current_block());
        if let Some(miner) = &self.miner {
            miner.stop();
        }
        self.kill_cp2fp();

        let (quit_tx, quit_rx) = watch::channel(false);
        self.sub_sync_quit = Some(quit_tx);
        let chain = self.chain.clone();
        let packer = self.packer.clone();
        let drop_peer = self.drop_peer.clone();
        let config = self.config.clone();
        let globals = self.globals.clone();
        let event_tx = self.event_tx.clone();
        let task = self.task_ids.fetch_add(1, Ordering::Relaxed);
        let log = self.log.new(o!("driver" => "peer_sync", "task" => task));
        tokio::spawn(async move {
            let result = peer_sync::run::<T>(
                chain,
                packer,
                peer,
                drop_peer,
                config,
                globals,
                quit_rx,
                log.clone(),
            )
            .await;
            let message = match result {
                Ok(()) => SyncMessage::PeerSyncFinished(id),
                Err(e) => {
                    warn!(log, "Peer sync attempt failed"; "error" => %e);
                    SyncMessage::PeerSyncFailed(id)
                }
            };
            let _ = event_tx.send(message).await;
        });
    }

    fn start_fast_sync(&mut self) {
        info!(self.log, "Starting fast sync"; "peers" => self.pool.len());
        self.globals.set_status(SyncStatus::FastSync);
        self.last_head_block = Some(self.chain.current_block());
        if let Some(miner) = &self.miner {
            miner.stop();
        }
        self.kill_cp2fp();

        let (quit_tx, quit_rx) = watch::channel(false);
        self.sub_sync_quit = Some(quit_tx);
        let chain = self.chain.clone();
        let packer = self.packer.clone();
        let peers = self.pool.all();
        let drop_peer = self.drop_peer.clone();
        let hasher = self.hasher.clone();
        let config = self.config.clone();
        let globals = self.globals.clone();
        let event_tx = self.event_tx.clone();
        let task = self.task_ids.fetch_add(1, Ordering::Relaxed);
        let log = self.log.new(o!("driver" => "fast_sync", "task" => task));
        tokio::spawn(async move {
            let attempt = fast_sync::run::<T>(
                chain,
                packer,
                peers.clone(),
                drop_peer.clone(),
                hasher,
                config.clone(),
                globals,
                quit_rx,
                log.clone(),
            );
            let message = match timeout(config.long_timeout(), attempt).await {
                Ok(Ok(())) => SyncMessage::FastSyncFinished,
                Ok(Err(e)) => {
                    warn!(log, "Fast sync attempt failed"; "error" => %e);
                    if let fast_sync::FastSyncError::Consensus(_) = e {
                        // Peers implicated in a failed consensus are
                        // dropped together.
                        for peer in &peers {
                            drop_peer(&peer.id(), false);
                        }
                    }
                    SyncMessage::FastSyncFailed
                }
                Err(_) => {
                    warn!(log, "Fast sync timed out");
                    SyncMessage::FastSyncFailed
                }
            };
            let _ = event_tx.send(message).await;
        });
    }

    /// (Re)starts the background catch-up task over the current peer set.
    fn start_cp2fp(&mut self) {
        self.kill_cp2fp();
        let (quit_tx, quit_rx) = watch::channel(false);
        self.cp2fp_quit = Some(quit_tx);
        let chain = self.chain.clone();
        let packer = self.packer.clone();
        let peers = self.pool.all();
        let drop_peer = self.drop_peer.clone();
        let config = self.config.clone();
        let globals = self.globals.clone();
        let task = self.task_ids.fetch_add(1, Ordering::Relaxed);
        let log = self.log.new(o!("driver" => "cp2fp", "task" => task));
        tokio::spawn(cp2fp::run_contained::<T>(
            chain, packer, peers, drop_peer, config, globals, quit_rx, log,
        ));
    }

    fn kill_cp2fp(&mut self) {
        if let Some(quit) = self.cp2fp_quit.take() {
            let _ = quit.send(true);
        }
    }

    fn kill_sub_sync(&mut self) {
        if let Some(quit) = self.sub_sync_quit.take() {
            let _ = quit.send(true);
        }
    }

    /// Restores the head recorded at attempt start.
    fn rollback(&mut self) {
        if let Some(block) = self.last_head_block.take() {
            warn!(
                self.log, "Rolling back to the pre-attempt head";
                "height" => block.height(), "hash" => ?block.full_hash(),
            );
            self.chain.set_current_block(&block);
        }
    }
}
