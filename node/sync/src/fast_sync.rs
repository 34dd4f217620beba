//! Fast sync: blocks plus a world-state snapshot at a fixed point.
//!
//! The driver walks `HashList → PreState → State → PostState → Done`.
//! After consensus, the fixed point is elected far enough below the agreed
//! tail to leave a window of blocks whose execution context the state
//! snapshot must cover. When the agreed list is too short for a window the
//! run degrades to incremental mode and executes block-by-block instead of
//! downloading state.

use crate::chain::{Chain, Packer};
use crate::config::SyncConfig;
use crate::consensus::{self, ConsensusError};
use crate::cp2fp::{execute_agreed_list, latest_check_point_block, CatchUpError};
use crate::peer::{DropPeerFn, PeerError, SyncPeer};
use crate::protocol::{HashElem, HashListBounds, SyncStage};
use crate::state_sync::{download_state, Hasher, StateSync, StateSyncError};
use crate::status::{FastSyncMode, FastSyncStatus, SyncGlobals};
use crate::NodeTypes;
use slog::{info, o, warn, Logger};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use types::ChainConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastSyncError {
    Consensus(ConsensusError),
    CatchUp(CatchUpError),
    State(StateSyncError),
    Request(PeerError),
    /// The pre-state response did not contain the fixed-point block.
    MissingFixPointBlock,
    Cancelled,
}

impl fmt::Display for FastSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastSyncError::Consensus(e) => write!(f, "consensus failed: {}", e),
            FastSyncError::CatchUp(e) => write!(f, "block execution failed: {}", e),
            FastSyncError::State(e) => write!(f, "state download failed: {}", e),
            FastSyncError::Request(e) => write!(f, "request failed: {}", e),
            FastSyncError::MissingFixPointBlock => {
                write!(f, "fixed-point block missing from pre-state response")
            }
            FastSyncError::Cancelled => write!(f, "fast sync cancelled"),
        }
    }
}

/// How many blocks below the fixed point must stay executable: the deeper
/// of the confirmation and stake-registration distances, plus greedy
/// sibling room on both sides and the package height delay.
fn state_window(config: &ChainConfig) -> usize {
    (config
        .confirm_height_distance
        .max(config.stake_register_height_distance)
        + 2 * config.greedy
        + config.max_package_height_delay) as usize
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run<T: NodeTypes>(
    chain: Arc<T::Chain>,
    packer: Arc<T::Packer>,
    peers: Vec<Arc<T::Peer>>,
    drop_peer: DropPeerFn,
    hasher: Hasher,
    config: SyncConfig,
    globals: Arc<SyncGlobals>,
    quit: watch::Receiver<bool>,
    log: Logger,
) -> Result<(), FastSyncError> {
    globals.set_fast_sync_status(FastSyncStatus::HashList);

    let check_point_block = latest_check_point_block(chain.as_ref());
    let bounds = HashListBounds::open_from(HashElem::from_block(&check_point_block));
    let responses = consensus::request_hash_lists(
        &peers,
        SyncStage::FastSync,
        bounds,
        config.short_timeout(),
        &log,
    )
    .await;
    let com_pre_count = consensus::common_prefix_count(&responses);
    let agreement =
        consensus::find_main_chain(responses, com_pre_count, config.min_regular_peer_count)
            .map_err(FastSyncError::Consensus)?;
    let best = consensus::best_of_class(&agreement).expect("winning class is non-empty");
    let fail_budget = peers.len().saturating_sub(config.min_regular_peer_count);
    consensus::check_main_chain(
        &best,
        &agreement.agreed,
        chain.as_ref(),
        SyncStage::FastSync,
        fail_budget,
        config.short_timeout(),
        &log,
    )
    .await
    .map_err(FastSyncError::Consensus)?;

    let agreed = agreement.agreed;
    let class = agreement.class;
    let window = state_window(&chain.chain_config());

    if agreed.len() > window + 1 {
        let fix_index = agreed.len() - 1 - window;
        let fix_elem = agreed[fix_index];
        globals.set_fast_sync_mode(FastSyncMode::Full);
        info!(
            log, "Fast syncing with a state snapshot";
            "fix_height" => fix_elem.height,
            "fix_round" => fix_elem.round,
            "agreed" => agreed.len(),
        );

        // Pre-state: the blocks and packages execution context below the
        // fixed point depends on. They are staged without verification;
        // the main-chain check above vouched for the list they belong to.
        globals.set_fast_sync_status(FastSyncStatus::PreState);
        let (pre_blocks, pre_pkgs) = timeout(
            config.short_timeout(),
            best.pre_blocks_for_state(fix_elem.full_hash),
        )
        .await
        .map_err(|_| FastSyncError::Request(PeerError::Timeout))?
        .map_err(FastSyncError::Request)?;
        let fix_block = pre_blocks
            .iter()
            .find(|block| block.full_hash() == fix_elem.full_hash)
            .cloned()
            .ok_or(FastSyncError::MissingFixPointBlock)?;
        for block in &pre_blocks {
            chain.insert_block_no_check(block);
        }
        for pkg in pre_pkgs {
            let _ = packer.insert_remote_tx_package(pkg);
        }

        // State: every trie node reachable from the fixed point's root.
        globals.set_fast_sync_status(FastSyncStatus::State);
        let state = StateSync::new(
            fix_block.header.state_root,
            chain.database(),
            hasher,
            log.new(o!("task" => "state")),
        );
        download_state(
            state,
            &class,
            config.node_fetch_batch,
            config.max_outstanding_node_batches,
            config.state_max_retry,
            config.short_timeout(),
            quit.clone(),
        )
        .await
        .map_err(FastSyncError::State)?;
        if *quit.borrow() {
            return Err(FastSyncError::Cancelled);
        }

        // Post-state: only now may the fixed point become the head. The
        // best peer's dedicated post-block lane seeds the store; the
        // fetcher fills whatever it misses.
        globals.set_fast_sync_status(FastSyncStatus::PostState);
        let tail = *agreed.last().expect("agreed list is non-empty");
        match timeout(
            config.short_timeout(),
            best.post_blocks_for_state(fix_elem, tail),
        )
        .await
        {
            Ok(Ok(post_blocks)) => {
                for block in &post_blocks {
                    chain.insert_block_no_check(block);
                }
            }
            _ => warn!(log, "Post-block prefetch failed, relying on the fetcher"),
        }
        chain.set_current_block(&fix_block);
        execute_agreed_list::<T>(
            &chain,
            &packer,
            class,
            &drop_peer,
            &config,
            SyncStage::FastSync,
            agreed[fix_index..].to_vec(),
            &globals,
            &quit,
            &log,
        )
        .await
        .map_err(FastSyncError::CatchUp)?;
    } else {
        globals.set_fast_sync_mode(FastSyncMode::Incremental);
        info!(
            log, "Agreed list too short for a state window, syncing incrementally";
            "agreed" => agreed.len(), "window" => window,
        );
        globals.set_fast_sync_status(FastSyncStatus::PostState);
        execute_agreed_list::<T>(
            &chain,
            &packer,
            class,
            &drop_peer,
            &config,
            SyncStage::FastSync,
            agreed,
            &globals,
            &quit,
            &log,
        )
        .await
        .map_err(FastSyncError::CatchUp)?;
    }

    globals.set_fast_sync_status(FastSyncStatus::Done);
    Ok(())
}
