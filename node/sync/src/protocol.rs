//! Identity types carried by sync wire messages.
//!
//! The transport and its codec live outside this crate; these are the
//! payload shapes every request method on [`crate::peer::SyncPeer`] is
//! parameterized by.

use std::cmp::Ordering;
use std::fmt;
use types::{Block, Hash256};

/// Which sub-protocol a request belongs to. Responders use it to route the
/// reply to the right task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStage {
    Cp2fp,
    FastSync,
    PeerSync,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStage::Cp2fp => write!(f, "cp2fp"),
            SyncStage::FastSync => write!(f, "fast_sync"),
            SyncStage::PeerSync => write!(f, "peer_sync"),
        }
    }
}

/// Canonical identity of one block on a candidate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HashElem {
    pub height: u64,
    pub round: u64,
    pub full_hash: Hash256,
    pub simple_hash: Hash256,
}

impl HashElem {
    pub fn from_block(block: &Block) -> Self {
        HashElem {
            height: block.height(),
            round: block.round(),
            full_hash: block.full_hash(),
            simple_hash: block.simple_hash(),
        }
    }

    /// The zero element doubles as an open bound in requests.
    pub fn is_empty(&self) -> bool {
        *self == HashElem::default()
    }

    /// Canonical list ordering: ascending round, then full hash.
    pub fn cmp_round_hash(&self, other: &Self) -> Ordering {
        self.round
            .cmp(&other.round)
            .then_with(|| self.full_hash.cmp(&other.full_hash))
    }
}

impl fmt::Display for HashElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "h={} r={} hash={:?}",
            self.height, self.round, self.full_hash
        )
    }
}

pub type HashElems = Vec<HashElem>;

/// Requested range of a hash list. An empty `to` asks the responder for
/// everything up to its head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashListBounds {
    pub from: HashElem,
    pub to: HashElem,
}

impl HashListBounds {
    pub fn open_from(from: HashElem) -> Self {
        HashListBounds {
            from,
            to: HashElem::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashListError {
    Empty,
    NotMonotonic { index: usize },
    BadLowerBound,
    BadUpperBound,
}

impl fmt::Display for HashListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashListError::Empty => write!(f, "hash list is empty"),
            HashListError::NotMonotonic { index } => {
                write!(f, "hash list is not monotonic at index {}", index)
            }
            HashListError::BadLowerBound => write!(f, "hash list does not start at the requested element"),
            HashListError::BadUpperBound => write!(f, "hash list does not end at the requested element"),
        }
    }
}

/// Checks the structural invariants of a hash list against the bounds it
/// was requested with: strictly increasing `(round, full_hash)` and, for
/// closed bounds, matching endpoints.
pub fn validate_hash_list(list: &[HashElem], bounds: &HashListBounds) -> Result<(), HashListError> {
    if list.is_empty() {
        return Err(HashListError::Empty);
    }
    for (index, pair) in list.windows(2).enumerate() {
        if pair[0].cmp_round_hash(&pair[1]) != Ordering::Less {
            return Err(HashListError::NotMonotonic { index: index + 1 });
        }
    }
    if !bounds.from.is_empty() && list[0] != bounds.from {
        return Err(HashListError::BadLowerBound);
    }
    if !bounds.to.is_empty() && *list.last().expect("list is non-empty") != bounds.to {
        return Err(HashListError::BadUpperBound);
    }
    Ok(())
}

/// Length of the longest common prefix of two hash lists.
pub fn longest_common_prefix(a: &[HashElem], b: &[HashElem]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
