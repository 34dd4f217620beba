use crate::Hash256;
use serde_derive::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Header of a block.
///
/// `round` is the logical time unit assigned by consensus; blocks sharing a
/// round are siblings. `confirmed_hashes` are the full hashes of the
/// ancestors this block confirms, `tx_package_hashes` the transaction
/// packages it executes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub round: u64,
    pub parent_full_hash: Hash256,
    pub state_root: Hash256,
    pub confirmed_hashes: Vec<Hash256>,
    pub tx_package_hashes: Vec<Hash256>,
}

/// A block together with its two identities.
///
/// The full hash covers the complete block contents, the simple hash only
/// the consensus-relevant header fields. Both are computed by the host
/// (hashing is not this crate's concern) and cached at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    full_hash: Hash256,
    simple_hash: Hash256,
}

impl Block {
    pub fn new(header: BlockHeader, full_hash: Hash256, simple_hash: Hash256) -> Self {
        Block {
            header,
            full_hash,
            simple_hash,
        }
    }

    pub fn full_hash(&self) -> Hash256 {
        self.full_hash
    }

    pub fn simple_hash(&self) -> Hash256 {
        self.simple_hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn round(&self) -> u64 {
        self.header.round
    }

    /// Canonical sibling ordering: ascending round, then full hash.
    pub fn cmp_round_hash(&self, other: &Self) -> Ordering {
        self.header
            .round
            .cmp(&other.header.round)
            .then_with(|| self.full_hash.cmp(&other.full_hash))
    }
}

/// Sorts blocks by `(round, full_hash)`, the order in which the chain
/// accepts them.
pub fn sort_by_round_hash(blocks: &mut [Block]) {
    blocks.sort_unstable_by(|a, b| a.cmp_round_hash(b));
}
