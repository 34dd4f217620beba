//! Core data types shared between the chain, the transaction-package pool
//! and the synchronization layer.

mod account;
mod block;
mod chain_config;
mod tx_package;

pub use account::{Account, AccountDecodeError, ACCOUNT_ENCODED_LEN};
pub use block::{sort_by_round_hash, Block, BlockHeader};
pub use chain_config::{latest_check_point, ChainConfig, CheckPoint};
pub use tx_package::TxPackage;

pub use ethereum_types::{H160, H256, U256};

/// 32-byte hash identifying blocks, packages and trie nodes.
pub type Hash256 = H256;

/// 20-byte account/packer address.
pub type Address = H160;
