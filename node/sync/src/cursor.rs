//! Ordered block insertion for one sync attempt.
//!
//! A cursor owns the agreed hash list and accepts blocks in whatever order
//! the network delivers them. Blocks are buffered, dependency-checked and
//! inserted; the element at `index` is executed as a main-chain block
//! before the index advances, so main-chain execution order always matches
//! the agreed list.

use crate::chain::{Chain, Packer};
use crate::protocol::HashElem;
use crate::NodeTypes;
use slog::{debug, info, warn, Logger};
use std::fmt;
use std::sync::Arc;
use types::{Block, Hash256, TxPackage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Idle,
    Running,
    Finished,
}

/// Window violations. The caller discards the block and carries on; these
/// never fail a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    BlockTooLow,
    BlockTooHigh,
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorError::BlockTooLow => write!(f, "block too low"),
            CursorError::BlockTooHigh => write!(f, "block too high"),
        }
    }
}

pub struct Cursor<T: NodeTypes> {
    /// Next hash-list element awaiting main-chain execution.
    index: usize,
    /// Whether main-chain execution may advance the node's head. False on
    /// the segment below the current head.
    set_head: bool,
    state: CursorState,
    /// Received blocks not yet consumed, sorted by `(round, full_hash)`.
    blocks: Vec<Block>,
    hash_list: Vec<HashElem>,
    check_height_max_diff: u64,
    /// Blocks dropped because verification failed. The peer layer is not
    /// told; this count keeps the event observable.
    discarded: u64,
    chain: Arc<T::Chain>,
    packer: Arc<T::Packer>,
    log: Logger,
}

impl<T: NodeTypes> Cursor<T> {
    pub fn new(
        hash_list: Vec<HashElem>,
        chain: Arc<T::Chain>,
        packer: Arc<T::Packer>,
        set_head: bool,
        check_height_max_diff: u64,
        log: Logger,
    ) -> Self {
        Cursor {
            index: 0,
            set_head,
            state: CursorState::Idle,
            blocks: Vec::new(),
            hash_list,
            check_height_max_diff,
            discarded: 0,
            chain,
            packer,
            log,
        }
    }

    pub fn start(&mut self) {
        if self.hash_list.is_empty() {
            self.state = CursorState::Finished;
        } else {
            self.state = CursorState::Running;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == CursorState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state == CursorState::Finished
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn check_window(&self, block: &Block) -> Result<(), CursorError> {
        let first = &self.hash_list[0];
        if block.height() < first.height {
            if first.height - block.height() >= self.check_height_max_diff {
                return Err(CursorError::BlockTooLow);
            }
            return Ok(());
        }
        if block.height() - first.height >= self.hash_list.len() as u64 {
            return Err(CursorError::BlockTooHigh);
        }
        Ok(())
    }

    /// Feeds one block into the cursor.
    ///
    /// Blocks whose dependencies are missing stay buffered for a later
    /// pass; blocks failing verification are dropped. Errors only report
    /// window violations.
    pub fn process_block(&mut self, block: Block) -> Result<(), CursorError> {
        if self.is_finished() {
            return Ok(());
        }
        debug!(
            self.log, "Processing block in cursor";
            "index" => self.index,
            "height" => block.height(),
            "round" => block.round(),
            "hash" => ?block.full_hash(),
            "list_len" => self.hash_list.len(),
        );

        self.check_window(&block)?;

        if !self
            .blocks
            .iter()
            .any(|b| b.full_hash() == block.full_hash())
        {
            self.blocks.push(block);
            types::sort_by_round_hash(&mut self.blocks);
        }

        self.try_insert_buffered();

        if self.index >= self.hash_list.len() {
            info!(self.log, "Cursor finished"; "executed" => self.index);
            self.state = CursorState::Finished;
        }
        Ok(())
    }

    fn try_insert_buffered(&mut self) {
        let buffered = std::mem::take(&mut self.blocks);
        let mut remaining = Vec::with_capacity(buffered.len());
        let mut stalled = false;

        for block in buffered {
            if stalled || self.index >= self.hash_list.len() {
                remaining.push(block);
                continue;
            }
            if block.round() > self.hash_list[self.index].round {
                remaining.push(block);
                continue;
            }

            if let Err(e) = self.chain.verify_block_depend(&block) {
                debug!(
                    self.log, "Block dependency missing, keeping buffered";
                    "hash" => ?block.full_hash(), "missing" => ?e.missing,
                );
                remaining.push(block);
                continue;
            }

            if let Err(e) = self.chain.verify_block(&block, self.set_head) {
                warn!(
                    self.log, "Dropping block that failed verification";
                    "hash" => ?block.full_hash(), "round" => block.round(), "error" => %e,
                );
                self.discarded += 1;
                continue;
            }

            self.chain.insert_block_no_check(&block);

            if block.full_hash() == self.hash_list[self.index].full_hash {
                let exec_failed = self.execute_main_block(&block);
                self.process_future_tx_packages(block.full_hash());
                if exec_failed {
                    stalled = true;
                    continue;
                }
                self.index += 1;
            }
        }
        self.blocks = remaining;
    }

    /// Executes the block matching the current hash-list element. Returns
    /// true if execution failed and the index must not advance.
    fn execute_main_block(&mut self, block: &Block) -> bool {
        info!(
            self.log, "Executing main-chain block";
            "height" => block.height(),
            "round" => block.round(),
            "hash" => ?block.full_hash(),
            "set_head" => self.set_head,
        );
        if self.set_head {
            self.chain.insert_block(block);
            false
        } else if let Err(e) = self.chain.insert_past_block(block) {
            warn!(
                self.log, "Past block execution failed";
                "hash" => ?block.full_hash(), "error" => %e,
            );
            true
        } else {
            false
        }
    }

    fn process_future_tx_packages(&self, block_hash: Hash256) {
        for pkg in self.chain.future_block_tx_packages(&block_hash) {
            debug!(
                self.log, "Processing future tx package";
                "pkg" => ?pkg.hash(), "block" => ?block_hash,
            );
            if self.insert_tx_package(&pkg) {
                self.chain.remove_future_block_tx_package(&pkg.hash());
            }
        }
    }

    fn insert_tx_package(&self, pkg: &TxPackage) -> bool {
        if self.chain.has_tx_package(&pkg.hash()) {
            return false;
        }
        if let Err(e) = self.chain.verify_tx_package(pkg) {
            warn!(
                self.log, "Future tx package failed verification";
                "pkg" => ?pkg.hash(), "packer" => ?pkg.packer(), "error" => %e,
            );
            return false;
        }
        if let Err(e) = self.packer.insert_remote_tx_package(pkg.clone()) {
            warn!(
                self.log, "Inserting tx package into pool failed";
                "pkg" => ?pkg.hash(), "error" => %e,
            );
        }
        true
    }
}
