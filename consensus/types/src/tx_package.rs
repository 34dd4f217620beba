use crate::{Address, Hash256};
use serde_derive::{Deserialize, Serialize};

/// A transaction package produced by a packer.
///
/// Packages are validated against the state of a specific block; that block
/// is recorded as `related_block_hash` and must be present locally before
/// the package can be verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPackage {
    packer: Address,
    nonce: u64,
    hash: Hash256,
    related_block_hash: Hash256,
}

impl TxPackage {
    pub fn new(packer: Address, nonce: u64, hash: Hash256, related_block_hash: Hash256) -> Self {
        TxPackage {
            packer,
            nonce,
            hash,
            related_block_hash,
        }
    }

    pub fn packer(&self) -> Address {
        self.packer
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn related_block_hash(&self) -> Hash256 {
        self.related_block_hash
    }
}
