//! Capabilities the sync core consumes from the rest of the node.
//!
//! The chain, the packer pool and the miner are handed to the
//! [`crate::Synchronizer`] as `Arc`s at construction; all of them are
//! internally synchronized and safe to call from any task.

use std::fmt;
use std::sync::Arc;
use types::{Block, ChainConfig, CheckPoint, Hash256, TxPackage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    UnknownBlock(Hash256),
    InvalidBlock(String),
    /// The block a tx package was validated against is not known locally.
    PackageRelatedBlockNotFound(Hash256),
    InvalidPackage(String),
    Other(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::UnknownBlock(hash) => write!(f, "unknown block {:?}", hash),
            ChainError::InvalidBlock(reason) => write!(f, "invalid block: {}", reason),
            ChainError::PackageRelatedBlockNotFound(hash) => {
                write!(f, "related block {:?} for tx package not found", hash)
            }
            ChainError::InvalidPackage(reason) => write!(f, "invalid tx package: {}", reason),
            ChainError::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// A dependency that `verify_block_depend` found missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyError {
    pub missing: Hash256,
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing dependency {:?}", self.missing)
    }
}

/// Opaque key-value store handle, forwarded to the state downloader.
pub trait Database: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]);
    fn contains(&self, key: &[u8]) -> bool;
}

/// The local block database and its verification rules.
pub trait Chain: Send + Sync + 'static {
    type Db: Database;

    fn current_block(&self) -> Block;
    fn genesis(&self) -> Block;
    fn get_block(&self, hash: &Hash256) -> Option<Block>;
    fn has_block(&self, hash: &Hash256) -> bool;
    fn blocks_in_round_range(&self, round_from: u64, round_to: u64) -> Vec<Block>;

    /// Inserts a verified block and lets the chain's fork rules decide
    /// whether it becomes the head.
    fn insert_block(&self, block: &Block);
    /// Inserts and executes a block below the current head.
    fn insert_past_block(&self, block: &Block) -> Result<(), ChainError>;
    /// Stores a block that has already been verified elsewhere.
    fn insert_block_no_check(&self, block: &Block);

    fn verify_block(&self, block: &Block, check_greedy: bool) -> Result<(), ChainError>;
    fn verify_block_depend(&self, block: &Block) -> Result<(), DependencyError>;
    fn set_current_block(&self, block: &Block);

    /// The first block after `check_point` from which the local chain is
    /// incomplete, together with the head-side bound of the gap.
    fn break_point(&self, check_point: &Block, head: &Block)
        -> Result<(Block, Block), ChainError>;
    fn check_points(&self) -> Vec<CheckPoint>;
    fn chain_config(&self) -> ChainConfig;

    fn has_tx_package(&self, hash: &Hash256) -> bool;
    fn get_tx_package(&self, hash: &Hash256) -> Option<TxPackage>;
    fn is_tx_package_in_future(&self, hash: &Hash256) -> bool;
    fn related_block_for_future_tx_package(&self, hash: &Hash256) -> Option<Hash256>;
    fn verify_tx_package(&self, pkg: &TxPackage) -> Result<(), ChainError>;
    /// Packages parked until `block_hash` arrived.
    fn future_block_tx_packages(&self, block_hash: &Hash256) -> Vec<TxPackage>;
    fn remove_future_block_tx_package(&self, pkg_hash: &Hash256);

    fn database(&self) -> Arc<Self::Db>;
}

/// The transaction-package pool.
pub trait Packer: Send + Sync + 'static {
    fn insert_remote_tx_package(&self, pkg: TxPackage) -> Result<(), ChainError>;
}

pub trait Miner: Send + Sync + 'static {
    fn start(&self);
    fn stop(&self);
}
