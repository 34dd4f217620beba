//! Checkpoint-to-fixed-point catch-up.
//!
//! The catch-up pipeline is shared by three callers: the background CP2FP
//! task that runs during `Normal`, the peer-sync sub-protocol (same
//! pipeline against a single peer) and the incremental flavour of fast
//! sync. It reaches consensus on a hash list starting at the break point
//! above the latest trusted checkpoint, then streams blocks through a
//! fetcher into a cursor: `set_head` stays off for the segment at or below
//! the local head and on above it.

use crate::chain::{Chain, ChainError};
use crate::config::SyncConfig;
use crate::consensus::{self, ConsensusError};
use crate::cursor::Cursor;
use crate::fetcher::{BlockFetcher, FetchError};
use crate::peer::{DropPeerFn, SyncPeer};
use crate::protocol::{HashElem, HashListBounds, SyncStage};
use crate::status::SyncGlobals;
use crate::NodeTypes;
use slog::{debug, info, o, warn, Logger};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use types::{latest_check_point, Block};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpError {
    Consensus(ConsensusError),
    Fetch(FetchError),
    Chain(ChainError),
    /// The fetcher finished but the cursor never reached the end of the
    /// agreed list.
    Incomplete,
    Cancelled,
    TimedOut,
}

impl fmt::Display for CatchUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatchUpError::Consensus(e) => write!(f, "consensus failed: {}", e),
            CatchUpError::Fetch(e) => write!(f, "block fetch failed: {}", e),
            CatchUpError::Chain(e) => write!(f, "chain error: {}", e),
            CatchUpError::Incomplete => write!(f, "agreed hash list was not fully executed"),
            CatchUpError::Cancelled => write!(f, "catch-up cancelled"),
            CatchUpError::TimedOut => write!(f, "catch-up timed out"),
        }
    }
}

/// The block carrying the latest enabled checkpoint, falling back to
/// genesis.
pub(crate) fn latest_check_point_block<C: Chain>(chain: &C) -> Block {
    let config = chain.chain_config();
    if config.check_point_enable {
        if let Some(check_point) = latest_check_point(&chain.check_points()) {
            if let Some(block) = chain.get_block(&check_point.hash) {
                return block;
            }
        }
    }
    chain.genesis()
}

/// Streams the blocks for `hash_list` from `peers` through a cursor until
/// every element has been executed.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn fetch_into_cursor<T: NodeTypes>(
    chain: Arc<T::Chain>,
    packer: Arc<T::Packer>,
    peers: Vec<Arc<T::Peer>>,
    drop_peer: DropPeerFn,
    config: &SyncConfig,
    stage: SyncStage,
    hash_list: Vec<HashElem>,
    set_head: bool,
    globals: &Arc<SyncGlobals>,
    quit: &watch::Receiver<bool>,
    log: &Logger,
) -> Result<(), CatchUpError> {
    if hash_list.is_empty() {
        return Ok(());
    }
    let first = hash_list[0];
    let last = *hash_list.last().expect("list is non-empty");

    let (block_tx, mut block_rx) = mpsc::channel(config.block_channel_capacity);
    let (fetch_quit_tx, fetch_quit_rx) = watch::channel(false);
    let fetcher = BlockFetcher::<T>::new(
        chain.clone(),
        packer.clone(),
        peers,
        drop_peer,
        config.clone(),
        stage,
        first.round,
        last.round,
        true,
        Some(last.full_hash),
        block_tx,
        fetch_quit_rx,
        log.new(o!("task" => "fetch")),
    )
    .map_err(CatchUpError::Fetch)?;
    let mut fetch_task = tokio::spawn(fetcher.run());

    let mut cursor = Cursor::<T>::new(
        hash_list,
        chain,
        packer,
        set_head,
        config.check_height_max_diff,
        log.new(o!("task" => "cursor")),
    );
    cursor.start();
    let mut quit = quit.clone();

    let result = loop {
        if cursor.is_finished() {
            break Ok(());
        }
        tokio::select! {
            maybe_block = block_rx.recv() => match maybe_block {
                Some(block) => {
                    if let Err(e) = cursor.process_block(block) {
                        debug!(log, "Cursor rejected block"; "error" => %e);
                    }
                }
                None => break Err(CatchUpError::Incomplete),
            },
            finished = &mut fetch_task => {
                while let Ok(block) = block_rx.try_recv() {
                    if let Err(e) = cursor.process_block(block) {
                        debug!(log, "Cursor rejected block"; "error" => %e);
                    }
                }
                break match finished {
                    Ok(Ok(())) if cursor.is_finished() => Ok(()),
                    Ok(Ok(())) => Err(CatchUpError::Incomplete),
                    Ok(Err(e)) => Err(CatchUpError::Fetch(e)),
                    Err(_) => Err(CatchUpError::Incomplete),
                };
            }
            _ = quit.changed() => break Err(CatchUpError::Cancelled),
        }
    };

    // Stop the fetcher if it outlived the cursor; dropping the receiver
    // unblocks a sender waiting on a full channel.
    let _ = fetch_quit_tx.send(true);
    if cursor.discarded() > 0 {
        warn!(
            log, "Cursor discarded blocks that failed verification";
            "count" => cursor.discarded(), "stage" => %stage,
        );
        globals.add_discarded_blocks(cursor.discarded());
    }
    result
}

/// One catch-up attempt: break point, consensus, main-chain check, then
/// the two cursor segments.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_catch_up<T: NodeTypes>(
    chain: &Arc<T::Chain>,
    packer: &Arc<T::Packer>,
    peers: Vec<Arc<T::Peer>>,
    drop_peer: &DropPeerFn,
    config: &SyncConfig,
    stage: SyncStage,
    min_peer_count: usize,
    globals: &Arc<SyncGlobals>,
    quit: &watch::Receiver<bool>,
    log: &Logger,
) -> Result<(), CatchUpError> {
    if peers.is_empty() {
        return Err(CatchUpError::Consensus(ConsensusError::NotEnoughPeers));
    }

    let check_point_block = latest_check_point_block(chain.as_ref());
    let head = chain.current_block();
    let (break_block, _) = chain
        .break_point(&check_point_block, &head)
        .map_err(CatchUpError::Chain)?;
    let bounds = HashListBounds::open_from(HashElem::from_block(&break_block));

    let responses =
        consensus::request_hash_lists(&peers, stage, bounds, config.short_timeout(), log).await;
    let com_pre_count = consensus::common_prefix_count(&responses);
    let agreement = consensus::find_main_chain(responses, com_pre_count, min_peer_count)
        .map_err(CatchUpError::Consensus)?;
    let best = consensus::best_of_class(&agreement).expect("winning class is non-empty");
    let fail_budget = peers.len().saturating_sub(min_peer_count);
    consensus::check_main_chain(
        &best,
        &agreement.agreed,
        chain.as_ref(),
        stage,
        fail_budget,
        config.short_timeout(),
        log,
    )
    .await
    .map_err(CatchUpError::Consensus)?;

    execute_agreed_list::<T>(
        chain,
        packer,
        agreement.class,
        drop_peer,
        config,
        stage,
        agreement.agreed,
        globals,
        quit,
        log,
    )
    .await
}

/// Splits the agreed list at the local head and runs the two segments:
/// past blocks first (`set_head` off), then the head-moving suffix.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_agreed_list<T: NodeTypes>(
    chain: &Arc<T::Chain>,
    packer: &Arc<T::Packer>,
    class: Vec<Arc<T::Peer>>,
    drop_peer: &DropPeerFn,
    config: &SyncConfig,
    stage: SyncStage,
    agreed: Vec<HashElem>,
    globals: &Arc<SyncGlobals>,
    quit: &watch::Receiver<bool>,
    log: &Logger,
) -> Result<(), CatchUpError> {
    let head_hash = chain.current_block().full_hash();
    let split = agreed
        .iter()
        .position(|elem| elem.full_hash == head_hash)
        .map(|index| index + 1)
        .unwrap_or(0);
    let (pre, post) = agreed.split_at(split);
    info!(
        log, "Executing agreed hash list";
        "agreed" => agreed.len(), "pre" => pre.len(), "post" => post.len(), "stage" => %stage,
    );

    if !pre.is_empty() {
        fetch_into_cursor::<T>(
            chain.clone(),
            packer.clone(),
            class.clone(),
            drop_peer.clone(),
            config,
            stage,
            pre.to_vec(),
            false,
            globals,
            quit,
            log,
        )
        .await?;
    }
    if !post.is_empty() {
        fetch_into_cursor::<T>(
            chain.clone(),
            packer.clone(),
            class,
            drop_peer.clone(),
            config,
            stage,
            post.to_vec(),
            true,
            globals,
            quit,
            log,
        )
        .await?;
    }
    Ok(())
}

/// The background CP2FP task. Failures are contained here: the peer set
/// is disciplined, the outcome is logged and `Normal` carries on.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_contained<T: NodeTypes>(
    chain: Arc<T::Chain>,
    packer: Arc<T::Packer>,
    peers: Vec<Arc<T::Peer>>,
    drop_peer: DropPeerFn,
    config: SyncConfig,
    globals: Arc<SyncGlobals>,
    quit: watch::Receiver<bool>,
    log: Logger,
) {
    let attempt = run_catch_up::<T>(
        &chain,
        &packer,
        peers.clone(),
        &drop_peer,
        &config,
        SyncStage::Cp2fp,
        config.min_regular_peer_count,
        &globals,
        &quit,
        &log,
    );
    match timeout(config.long_timeout(), attempt).await {
        Err(_) => warn!(log, "Catch-up timed out"),
        Ok(Ok(())) => {
            info!(log, "Catch-up complete"; "head" => chain.current_block().height());
        }
        Ok(Err(CatchUpError::Consensus(e))) => match e {
            ConsensusError::NotEnoughPeers => {
                debug!(log, "Catch-up deferred"; "error" => %e);
            }
            ConsensusError::NoCommonPrefix
            | ConsensusError::CanNotGetConsensus
            | ConsensusError::MainChainCheckFailed => {
                warn!(log, "Catch-up consensus failed, dropping peer set"; "error" => %e, "peers" => peers.len());
                for peer in &peers {
                    drop_peer(&peer.id(), false);
                }
            }
        },
        Ok(Err(CatchUpError::Cancelled)) => debug!(log, "Catch-up cancelled"),
        Ok(Err(e)) => warn!(log, "Catch-up failed"; "error" => %e),
    }
}
