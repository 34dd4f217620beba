//! Shared fixtures and the synchronizer-level scenarios.
//!
//! Component behaviour is tested next to each module; the tests here drive
//! a spawned [`Synchronizer`] through its states with mock collaborators.


use crate::chain::Chain;
use crate::cursor::Cursor;
use crate::manager::{SyncHandle, Synchronizer};
use crate::peer::{DropPeerFn, PeerId};
use crate::protocol::{HashElem, SyncStage};
use crate::state_sync::{encode_branch, encode_leaf};
use crate::status::{FastSyncMode, SyncStatus};
use crate::SyncConfig;
use mocks::{
    test_hasher, test_logger, ChainCall, MockChain, MockMiner, MockPacker, MockPeer, TestTypes,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use types::{Account, Address, Block, BlockHeader, ChainConfig, Hash256, TxPackage, U256};

/// A linked chain of blocks: height `i`, round `3 i`, parents chained.
pub(crate) fn block_chain(len: usize) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut parent = Hash256::zero();
    for i in 0..len as u64 {
        let header = BlockHeader {
            height: i,
            round: i * 3,
            parent_full_hash: parent,
            state_root: Hash256::zero(),
            confirmed_hashes: Vec::new(),
            tx_package_hashes: Vec::new(),
        };
        let full_hash = Hash256::from_low_u64_be(0x1000_0000 + i + 1);
        let simple_hash = Hash256::from_low_u64_be(0x2000_0000 + i + 1);
        parent = full_hash;
        blocks.push(Block::new(header, full_hash, simple_hash));
    }
    blocks
}

pub(crate) fn to_hash_list(blocks: &[Block]) -> Vec<HashElem> {
    blocks.iter().map(HashElem::from_block).collect()
}

/// Replaces the block's identities with tagged variants (a fork).
pub(crate) fn rehash(block: &mut Block, tag: u8) {
    let mut bytes = block.full_hash().to_fixed_bytes();
    bytes[0] ^= tag;
    let full_hash = Hash256::from(bytes);
    *block = Block::new(block.header.clone(), full_hash, block.simple_hash());
}

pub(crate) fn set_state_root(block: &mut Block, root: Hash256) {
    block.header.state_root = root;
}

pub(crate) fn tx_package(tag: u8, related_block_hash: Hash256) -> TxPackage {
    TxPackage::new(
        Address::repeat_byte(tag),
        1,
        Hash256::repeat_byte(tag),
        related_block_hash,
    )
}

pub(crate) fn attach_package(block: &mut Block, pkg: &TxPackage) {
    block.header.tx_package_hashes.push(pkg.hash());
}

pub(crate) fn noop_drop_peer() -> DropPeerFn {
    Arc::new(|_: &PeerId, _: bool| {})
}

pub(crate) struct StateFixture {
    pub root: Hash256,
    pub nodes: HashMap<Hash256, Vec<u8>>,
}

/// A two-account trie: one account with a storage trie and code, one
/// empty.
pub(crate) fn state_fixture() -> StateFixture {
    let hasher = test_hasher();
    let mut nodes = HashMap::new();

    let code = vec![0xc0, 0xde, 0xc0, 0xde];
    let code_hash = hasher(&code);
    nodes.insert(code_hash, code);

    let storage = encode_branch(&[]);
    let storage_hash = hasher(&storage);
    nodes.insert(storage_hash, storage);

    let rich = Account {
        nonce: 1,
        balance: U256::from(7u64),
        storage_root: storage_hash,
        code_hash,
    };
    let rich_leaf = encode_leaf(&rich);
    let rich_hash = hasher(&rich_leaf);
    nodes.insert(rich_hash, rich_leaf);

    let empty_leaf = encode_leaf(&Account::default());
    let empty_hash = hasher(&empty_leaf);
    nodes.insert(empty_hash, empty_leaf);

    let root_node = encode_branch(&[rich_hash, empty_hash]);
    let root = hasher(&root_node);
    nodes.insert(root, root_node);

    StateFixture { root, nodes }
}

#[test]
fn cursor_drains_future_packages_after_execution() {
    let blocks = block_chain(2);
    let chain = MockChain::with_blocks(&blocks[..1]);
    let pkg = tx_package(0x44, blocks[0].full_hash());
    chain.park_future_package(blocks[1].full_hash(), pkg.clone());
    let packer = Arc::new(MockPacker::default());

    let mut cursor = Cursor::<TestTypes>::new(
        to_hash_list(&blocks[1..]),
        chain.clone(),
        packer.clone(),
        true,
        10,
        test_logger(),
    );
    cursor.start();
    cursor.process_block(blocks[1].clone()).unwrap();

    assert!(cursor.is_finished());
    assert_eq!(packer.inserted(), vec![pkg.hash()]);
    assert!(chain
        .future_block_tx_packages(&blocks[1].full_hash())
        .is_empty());
}

// ---- Synchronizer scenarios ------------------------------------------------

struct Rig {
    handle: SyncHandle<TestTypes>,
    chain: Arc<MockChain>,
    miner: Arc<MockMiner>,
    resolved: Arc<Mutex<Vec<PeerId>>>,
}

fn scenario_config() -> SyncConfig {
    SyncConfig {
        min_regular_peer_count: 3,
        min_fast_sync_peer_count: 4,
        height_diff: 10,
        short_timeout_secs: 1,
        chunk_timeout_secs: 1,
        long_timeout_secs: 30,
        finish_depend_err_secs: 1,
        rounds_per_chunk: 16,
        ..SyncConfig::default()
    }
}

fn spawn_rig(chain: Arc<MockChain>, config: SyncConfig) -> Rig {
    let miner = Arc::new(MockMiner::default());
    let resolved = Arc::new(Mutex::new(Vec::new()));
    let resolved_in_callback = resolved.clone();
    let handle = Synchronizer::<TestTypes>::spawn_with_rng(
        chain.clone(),
        Arc::new(MockPacker::default()),
        Some(miner.clone()),
        noop_drop_peer(),
        Arc::new(move |id: &PeerId| resolved_in_callback.lock().push(id.clone())),
        test_hasher(),
        config,
        test_logger(),
        StdRng::seed_from_u64(1),
    );
    Rig {
        handle,
        chain,
        miner,
        resolved,
    }
}

pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let poll = async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .is_err()
    {
        panic!("timed out waiting for {}", what);
    }
}

/// Spec scenario: empty chain, five agreeing peers far ahead. The path is
/// `Init → FastSync → Normal` and the head lands on the agreed tip.
#[tokio::test]
async fn far_behind_node_fast_syncs_to_the_network_head() {
    let blocks = block_chain(101);
    let chain = MockChain::with_blocks(&blocks[..1]);
    let rig = spawn_rig(chain, scenario_config());

    for id in ["a", "b", "c", "d", "e"] {
        let peer = MockPeer::serving_with_hash_list(id, &blocks, to_hash_list(&blocks));
        rig.handle.add_peer(peer).await;
    }

    wait_until("fast sync to finish", || {
        rig.handle.status() == SyncStatus::Normal
            && rig.chain.current_block().height() == 100
    })
    .await;
    assert!(rig.miner.is_started());
    rig.handle.stop();
}

/// Spec scenario: small lag goes through CP2FP in `Normal`, never fast
/// sync.
#[tokio::test]
async fn small_lag_catches_up_in_normal_state() {
    let blocks = block_chain(101);
    let chain = MockChain::with_blocks(&blocks[..96]);
    let rig = spawn_rig(chain, scenario_config());

    for id in ["a", "b", "c"] {
        let peer = MockPeer::serving_with_hash_list(id, &blocks, to_hash_list(&blocks[95..]));
        rig.handle.add_peer(peer).await;
    }

    wait_until("status to reach normal", || {
        rig.handle.status() == SyncStatus::Normal
    })
    .await;
    wait_until("catch-up to the peers' head", || {
        rig.chain.current_block().height() == 100
    })
    .await;
    // Fast sync never ran.
    assert_eq!(rig.handle.fast_sync_mode(), FastSyncMode::None);
    rig.handle.stop();
}

/// Spec scenario: a peer far ahead in `Normal` triggers peer sync, and the
/// head advances to its chain.
#[tokio::test]
async fn far_ahead_peer_triggers_peer_sync() {
    let blocks = block_chain(61);
    let chain = MockChain::with_blocks(&blocks[..51]);
    let rig = spawn_rig(chain, scenario_config());

    // Three peers at our height put us in Normal.
    for id in ["r1", "r2", "r3"] {
        let peer =
            MockPeer::serving_with_hash_list(id, &blocks[..51], to_hash_list(&blocks[50..51]));
        rig.handle.add_peer(peer).await;
    }
    wait_until("status to reach normal", || {
        rig.handle.status() == SyncStatus::Normal
    })
    .await;

    // Peer a sits 10 heights ahead, beyond the peer-sync threshold.
    let ahead = MockPeer::serving_with_hash_list("a", &blocks, to_hash_list(&blocks[50..]));
    rig.handle.add_peer(ahead).await;

    wait_until("peer sync to advance the head", || {
        rig.handle.status() == SyncStatus::Normal
            && rig.chain.current_block().height() == 60
    })
    .await;
    assert!(rig.miner.is_started());
    assert!(rig.resolved.lock().contains(&PeerId::new("a")));
    rig.handle.stop();
}

/// Spec scenario: the state download dies mid-way; the head rolls back to
/// the pre-attempt block and no fixed point is ever installed.
#[tokio::test]
async fn failed_state_download_rolls_back_the_attempt() {
    let mut blocks = block_chain(20);
    set_state_root(&mut blocks[15], Hash256::repeat_byte(0x5a));
    let chain = MockChain::with_blocks(&blocks[..1]);
    chain.set_chain_config(ChainConfig {
        greedy: 1,
        confirm_height_distance: 2,
        stake_register_height_distance: 2,
        max_package_height_delay: 0,
        ..ChainConfig::default()
    });
    let genesis_hash = blocks[0].full_hash();
    let rig = spawn_rig(
        chain,
        SyncConfig {
            state_max_retry: 1,
            ..scenario_config()
        },
    );

    for id in ["a", "b", "c", "d"] {
        let peer = MockPeer::serving_with_hash_list(id, &blocks, to_hash_list(&blocks));
        // Pre-state is served, node data is not: state download starves.
        peer.hold_pre_state(blocks[15].full_hash(), blocks[10..16].to_vec(), Vec::new());
        rig.handle.add_peer(peer).await;
    }

    wait_until("the attempt to roll back", || {
        !rig.chain.calls_of(ChainCall::SetCurrentBlock).is_empty()
    })
    .await;

    // Only the rollback target was ever installed, never the fixed point.
    for hash in rig.chain.calls_of(ChainCall::SetCurrentBlock) {
        assert_eq!(hash, genesis_hash);
    }
    assert_eq!(rig.chain.current_block().height(), 0);
    rig.handle.stop();
}

/// Spec property: after a failed peer sync the peer cools down for
/// `finish_depend_err_time` before another attempt may start.
#[tokio::test]
async fn failed_peer_sync_enforces_a_cooldown() {
    let blocks = block_chain(61);
    let chain = MockChain::with_blocks(&blocks[..51]);
    let rig = spawn_rig(chain, scenario_config());

    for id in ["r1", "r2", "r3"] {
        let peer =
            MockPeer::serving_with_hash_list(id, &blocks[..51], to_hash_list(&blocks[50..51]));
        rig.handle.add_peer(peer).await;
    }
    wait_until("status to reach normal", || {
        rig.handle.status() == SyncStatus::Normal
    })
    .await;

    // The liar advertises a head and a list but serves no blocks, so the
    // peer sync attempt fails.
    let liar = MockPeer::serving_with_hash_list("liar", &[], to_hash_list(&blocks[50..]));
    liar.set_head(crate::peer::PeerHead {
        height: 60,
        round: 180,
        ..Default::default()
    });
    rig.handle.add_peer(liar.clone()).await;

    wait_until("the first peer sync attempt to fail", || {
        liar.hash_list_request_count(SyncStage::PeerSync) == 1
            && rig.handle.status() == SyncStatus::Normal
    })
    .await;

    // Within the cooldown a new trigger must not start another attempt.
    rig.handle.dependency_missing(liar.clone()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(liar.hash_list_request_count(SyncStage::PeerSync), 1);
    assert_eq!(rig.handle.status(), SyncStatus::Normal);

    // Once the cooldown elapses the host is told and a retry is allowed.
    wait_until("the cooldown to elapse", || {
        rig.resolved.lock().contains(&PeerId::new("liar"))
    })
    .await;
    rig.handle.dependency_missing(liar.clone()).await;
    wait_until("a second peer sync attempt", || {
        liar.hash_list_request_count(SyncStage::PeerSync) == 2
    })
    .await;
    rig.handle.stop();
}

/// The head never moved during any of the failed attempts above; spelled
/// out here as its own property for the liar scenario.
#[tokio::test]
async fn failed_peer_sync_restores_the_head() {
    let blocks = block_chain(61);
    let chain = MockChain::with_blocks(&blocks[..51]);
    let head_before = chain.current_block().full_hash();
    let rig = spawn_rig(chain, scenario_config());

    for id in ["r1", "r2", "r3"] {
        let peer =
            MockPeer::serving_with_hash_list(id, &blocks[..51], to_hash_list(&blocks[50..51]));
        rig.handle.add_peer(peer).await;
    }
    wait_until("status to reach normal", || {
        rig.handle.status() == SyncStatus::Normal
    })
    .await;

    let liar = MockPeer::serving_with_hash_list("liar", &[], to_hash_list(&blocks[50..]));
    liar.set_head(crate::peer::PeerHead {
        height: 60,
        round: 180,
        ..Default::default()
    });
    rig.handle.add_peer(liar.clone()).await;

    wait_until("the peer sync attempt to fail", || {
        liar.hash_list_request_count(SyncStage::PeerSync) >= 1
            && rig.handle.status() == SyncStatus::Normal
    })
    .await;
    assert_eq!(rig.chain.current_block().full_hash(), head_before);
    rig.handle.stop();
}
