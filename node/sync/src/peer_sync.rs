//! Single-peer dependency recovery.
//!
//! When a block from peer `p` fails its dependency check and `p` claims a
//! head far beyond ours, the missing subgraph lives on `p`'s chain and
//! nobody else is obliged to have it. Peer sync runs the catch-up pipeline
//! bilaterally: hash list from `p` alone, blocks from `p` alone, head
//! moving once the agreed suffix executes.

use crate::chain::Chain;
use crate::config::SyncConfig;
use crate::cp2fp::{run_catch_up, CatchUpError};
use crate::peer::{DropPeerFn, SyncPeer};
use crate::protocol::SyncStage;
use crate::status::SyncGlobals;
use crate::NodeTypes;
use slog::{info, Logger};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;

/// Runs one peer-sync attempt against `peer`. The caller owns peer
/// discipline (cooldown on failure).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run<T: NodeTypes>(
    chain: Arc<T::Chain>,
    packer: Arc<T::Packer>,
    peer: Arc<T::Peer>,
    drop_peer: DropPeerFn,
    config: SyncConfig,
    globals: Arc<SyncGlobals>,
    quit: watch::Receiver<bool>,
    log: Logger,
) -> Result<(), CatchUpError> {
    let head = peer.head();
    info!(
        log, "Starting peer sync";
        "peer" => %peer.id(),
        "peer_height" => head.height,
        "local_height" => chain.current_block().height(),
    );

    let attempt = run_catch_up::<T>(
        &chain,
        &packer,
        vec![peer],
        &drop_peer,
        &config,
        SyncStage::PeerSync,
        1,
        &globals,
        &quit,
        &log,
    );
    match timeout(config.long_timeout(), attempt).await {
        Ok(result) => result,
        Err(_) => Err(CatchUpError::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mocks::{test_logger, MockChain, MockPacker, MockPeer, TestTypes};
    use crate::tests::{block_chain, noop_drop_peer, to_hash_list};

    #[tokio::test]
    async fn bilateral_sync_advances_to_the_peer_head() {
        let blocks = block_chain(16);
        let chain = MockChain::with_blocks(&blocks[..8]);
        let packer = Arc::new(MockPacker::default());
        let peer = MockPeer::serving_with_hash_list("a", &blocks, to_hash_list(&blocks[7..]));
        let (_quit_tx, quit_rx) = watch::channel(false);

        run::<TestTypes>(
            chain.clone(),
            packer,
            peer,
            noop_drop_peer(),
            SyncConfig {
                short_timeout_secs: 1,
                chunk_timeout_secs: 1,
                ..SyncConfig::default()
            },
            Arc::new(SyncGlobals::new()),
            quit_rx,
            test_logger(),
        )
        .await
        .expect("peer sync succeeds");

        assert_eq!(chain.current_block().height(), 15);
    }

    #[tokio::test]
    async fn a_peer_without_the_blocks_fails_the_attempt() {
        let blocks = block_chain(12);
        let chain = MockChain::with_blocks(&blocks[..4]);
        let packer = Arc::new(MockPacker::default());
        // The peer advertises a list but serves no blocks.
        let peer = MockPeer::serving_with_hash_list("a", &blocks[..4], to_hash_list(&blocks[3..]));
        let (_quit_tx, quit_rx) = watch::channel(false);

        let result = run::<TestTypes>(
            chain.clone(),
            packer,
            peer,
            noop_drop_peer(),
            SyncConfig {
                short_timeout_secs: 1,
                chunk_timeout_secs: 1,
                chunk_retry_limit: 2,
                ..SyncConfig::default()
            },
            Arc::new(SyncGlobals::new()),
            quit_rx,
            test_logger(),
        )
        .await;
        assert!(result.is_err(), "expected failure, got {:?}", result);
        // The head never moved.
        assert_eq!(chain.current_block().height(), 3);
    }
}
