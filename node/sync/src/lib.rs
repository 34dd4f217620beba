//! Chain synchronization core.
//!
//! This crate drives a local block database into agreement with the rest of
//! the network, starting from an arbitrary lag. The [`Synchronizer`] owns a
//! single-threaded event loop over four states (`Init`, `FastSync`,
//! `Normal`, `PeerSync`) and coordinates the sub-protocols:
//!
//! - hash-list consensus over a peer set ([`consensus`]),
//! - concurrent block download across peers ([`fetcher`]),
//! - world-state trie download at a fixed point ([`state_sync`]),
//! - ordered block insertion ([`cursor`]),
//! - checkpoint-to-fixed-point catch-up ([`cp2fp`]),
//! - single-peer dependency recovery ([`peer_sync`]).
//!
//! Everything outside synchronization (transport, codec, execution, pools,
//! mining) is consumed through the capability traits in [`chain`] and
//! [`peer`].

pub mod chain;
pub mod config;
pub mod consensus;
pub mod cp2fp;
pub mod cursor;
pub mod fast_sync;
pub mod fetcher;
pub mod manager;
pub mod peer;
pub mod peer_sync;
pub mod protocol;
pub mod state_sync;
pub mod status;

#[cfg(test)]
mod tests;

use chain::{Chain, Miner, Packer};
use peer::SyncPeer;

pub use config::SyncConfig;
pub use manager::{SyncHandle, SyncMessage, Synchronizer};
pub use status::{FastSyncMode, FastSyncStatus, SyncStatus};

/// Bundles the collaborator types a [`Synchronizer`] is built over, so that
/// every component can be generic over one parameter instead of four.
pub trait NodeTypes: Send + Sync + 'static {
    type Chain: Chain;
    type Packer: Packer;
    type Miner: Miner;
    type Peer: SyncPeer;
}
