//! The peer capability and the shared peer registry.

use crate::protocol::{HashElem, HashListBounds, SyncStage};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use types::{Block, Hash256, TxPackage};

/// Network-level peer identity. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A peer's advertised chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerHead {
    pub full_hash: Hash256,
    pub simple_hash: Hash256,
    pub height: u64,
    pub round: u64,
}

/// Why a request to a peer produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    Timeout,
    Disconnected,
    Malformed(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Timeout => write!(f, "request timed out"),
            PeerError::Disconnected => write!(f, "peer disconnected"),
            PeerError::Malformed(reason) => write!(f, "malformed response: {}", reason),
        }
    }
}

/// Request capabilities of a connected peer.
///
/// The transport performs each request on its own wire protocol; from this
/// crate's perspective a request is an awaitable call that either yields
/// the response payload or a [`PeerError`].
#[async_trait]
pub trait SyncPeer: Send + Sync + 'static {
    fn id(&self) -> PeerId;
    fn name(&self) -> String;
    fn is_closed(&self) -> bool;
    fn head(&self) -> PeerHead;

    /// Compares this peer's head to another head description.
    fn compare_to(&self, simple_hash: Hash256, height: u64, round: u64) -> Ordering {
        let head = self.head();
        head.height
            .cmp(&height)
            .then_with(|| head.round.cmp(&round))
            .then_with(|| head.simple_hash.cmp(&simple_hash))
    }

    async fn sync_hash_list(
        &self,
        stage: SyncStage,
        bounds: HashListBounds,
    ) -> Result<Vec<HashElem>, PeerError>;

    async fn blocks_by_round_range(
        &self,
        stage: SyncStage,
        round_from: u64,
        round_to: u64,
    ) -> Result<Vec<Block>, PeerError>;

    async fn tx_packages(
        &self,
        stage: SyncStage,
        hashes: Vec<Hash256>,
    ) -> Result<Vec<TxPackage>, PeerError>;

    /// State trie nodes (and raw code entries) by hash.
    async fn node_data(&self, hashes: Vec<Hash256>) -> Result<Vec<Vec<u8>>, PeerError>;

    /// The blocks and packages a state snapshot at `block_full_hash`
    /// depends on.
    async fn pre_blocks_for_state(
        &self,
        block_full_hash: Hash256,
    ) -> Result<(Vec<Block>, Vec<TxPackage>), PeerError>;

    async fn post_blocks_for_state(
        &self,
        from: HashElem,
        to: HashElem,
    ) -> Result<Vec<Block>, PeerError>;
}

/// Callback dropping a peer at the network layer, optionally blacklisting.
pub type DropPeerFn = Arc<dyn Fn(&PeerId, bool) + Send + Sync>;

/// Callback telling the host a peer's dependency error has been resolved
/// (or its cooldown has elapsed).
pub type DependResolvedFn = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Registry of live peers.
///
/// Shared between the synchronizer loop and the host's connection handler;
/// reads vastly outnumber writes. The RNG behind `random_sample` is
/// injected so tests can seed it.
pub struct PeerPool<P: SyncPeer> {
    peers: RwLock<FnvHashMap<PeerId, Arc<P>>>,
    rng: Mutex<StdRng>,
    drop_peer: DropPeerFn,
}

impl<P: SyncPeer> PeerPool<P> {
    pub fn new(drop_peer: DropPeerFn) -> Self {
        Self::with_rng(drop_peer, StdRng::from_entropy())
    }

    pub fn with_rng(drop_peer: DropPeerFn, rng: StdRng) -> Self {
        PeerPool {
            peers: RwLock::new(FnvHashMap::default()),
            rng: Mutex::new(rng),
            drop_peer,
        }
    }

    pub fn insert(&self, peer: Arc<P>) {
        self.peers.write().insert(peer.id(), peer);
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<P>> {
        self.peers.write().remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<P>> {
        self.peers.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// All live peers, in identity order (stable for callers that iterate).
    pub fn all(&self) -> Vec<Arc<P>> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_unstable_by_key(|p| p.id());
        peers
    }

    /// Samples up to `count` distinct peers; everyone when the pool is
    /// smaller than the sample.
    pub fn random_sample(&self, count: usize) -> Vec<Arc<P>> {
        let peers = self.all();
        if peers.len() <= count {
            return peers;
        }
        let mut rng = self.rng.lock();
        peers.choose_multiple(&mut *rng, count).cloned().collect()
    }

    /// Removes the peer and notifies the network layer.
    pub fn drop_peer(&self, id: &PeerId, blacklist: bool) {
        self.remove(id);
        (self.drop_peer)(id, blacklist);
    }
}

/// The peer with the best head: higher height, then higher round, then
/// lexicographically smaller full hash.
pub fn best_by_head<P: SyncPeer>(peers: &[Arc<P>]) -> Option<Arc<P>> {
    peers
        .iter()
        .max_by(|a, b| cmp_heads(&a.head(), &b.head()))
        .cloned()
}

/// Head ordering used for best-peer selection; `Greater` means better.
pub(crate) fn cmp_heads(a: &PeerHead, b: &PeerHead) -> Ordering {
    a.height
        .cmp(&b.height)
        .then_with(|| a.round.cmp(&b.round))
        .then_with(|| b.full_hash.cmp(&a.full_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mocks::MockPeer;

    fn pool_with(peers: Vec<Arc<MockPeer>>, seed: u64) -> PeerPool<MockPeer> {
        let pool =
            PeerPool::with_rng(Arc::new(|_: &PeerId, _: bool| {}), StdRng::seed_from_u64(seed));
        for peer in peers {
            pool.insert(peer);
        }
        pool
    }

    fn peer(id: &str, height: u64, round: u64, hash_byte: u8) -> Arc<MockPeer> {
        Arc::new(MockPeer::new(
            id,
            PeerHead {
                full_hash: Hash256::repeat_byte(hash_byte),
                simple_hash: Hash256::repeat_byte(hash_byte),
                height,
                round,
            },
        ))
    }

    #[test]
    fn sample_is_smaller_than_pool_and_distinct() {
        let pool = pool_with(
            (0..10)
                .map(|i| peer(&format!("p{}", i), 100 + i, 300, i as u8))
                .collect(),
            7,
        );
        let sample = pool.random_sample(4);
        assert_eq!(sample.len(), 4);
        let mut ids: Vec<_> = sample.iter().map(|p| p.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn sample_returns_everyone_when_pool_is_small() {
        let pool = pool_with(vec![peer("a", 1, 1, 1), peer("b", 2, 2, 2)], 7);
        assert_eq!(pool.random_sample(5).len(), 2);
    }

    #[test]
    fn sampling_is_deterministic_for_a_fixed_seed() {
        let peers: Vec<_> = (0..10)
            .map(|i| peer(&format!("p{}", i), 100, 300, i as u8))
            .collect();
        let first: Vec<_> = pool_with(peers.clone(), 42)
            .random_sample(3)
            .iter()
            .map(|p| p.id())
            .collect();
        let second: Vec<_> = pool_with(peers, 42)
            .random_sample(3)
            .iter()
            .map(|p| p.id())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn best_by_head_breaks_ties_toward_smaller_hash() {
        let peers = vec![
            peer("low", 99, 300, 0x01),
            peer("tie_big_hash", 100, 300, 0x0f),
            peer("tie_small_hash", 100, 300, 0x02),
            peer("low_round", 100, 299, 0x00),
        ];
        let best = best_by_head(&peers).expect("non-empty");
        assert_eq!(best.id(), PeerId::new("tie_small_hash"));
    }

    #[test]
    fn drop_peer_removes_and_notifies() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped_clone = dropped.clone();
        let pool: PeerPool<MockPeer> = PeerPool::with_rng(
            Arc::new(move |_: &PeerId, _| {
                dropped_clone.fetch_add(1, Ordering::SeqCst);
            }),
            StdRng::seed_from_u64(0),
        );
        pool.insert(peer("a", 1, 1, 1));
        pool.drop_peer(&PeerId::new("a"), false);
        assert_eq!(pool.len(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
