//! World-state trie download.
//!
//! A [`StateSync`] schedules node-by-node requests for every trie node
//! reachable from a state root. Leaf nodes carry accounts, whose storage
//! roots and code hashes become further requests. Fetched nodes land in
//! the database keyed by hash; until the queue drains nothing references
//! the new root, so an aborted download leaves only unreachable entries
//! behind.

use crate::chain::Database;
use crate::peer::{PeerError, PeerId, SyncPeer};
use fnv::FnvHashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use slog::{debug, info, warn, Logger};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use types::{Account, Hash256};

/// Tag bytes of the node encoding.
const NODE_TAG_BRANCH: u8 = 0x00;
const NODE_TAG_LEAF: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateSyncError {
    /// A node request missed its retry budget.
    RetriesExhausted(Hash256),
    /// Every peer is gone.
    NoPeers,
}

impl fmt::Display for StateSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateSyncError::RetriesExhausted(hash) => {
                write!(f, "state node {:?} exhausted its retries", hash)
            }
            StateSyncError::NoPeers => write!(f, "no peers available for state download"),
        }
    }
}

/// Content hashing is delegated to the host.
pub type Hasher = Arc<dyn Fn(&[u8]) -> Hash256 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// A trie node that must be decoded for children.
    Node,
    /// An opaque blob (contract code) stored as-is.
    Raw,
}

#[derive(Debug, Clone)]
struct NodeRequest {
    hash: Hash256,
    depth: u32,
    parent: Hash256,
    kind: EntryKind,
    retries: u8,
}

enum TrieNode {
    Branch(Vec<Hash256>),
    Leaf(Account),
}

fn decode_node(bytes: &[u8]) -> Result<TrieNode, String> {
    match bytes.split_first() {
        Some((&NODE_TAG_BRANCH, rest)) => {
            let count = *rest.first().ok_or("branch node missing child count")? as usize;
            let body = &rest[1..];
            if body.len() != count * 32 {
                return Err(format!(
                    "branch node body is {} bytes, expected {}",
                    body.len(),
                    count * 32
                ));
            }
            let children = body.chunks(32).map(Hash256::from_slice).collect();
            Ok(TrieNode::Branch(children))
        }
        Some((&NODE_TAG_LEAF, rest)) => {
            let account = Account::decode(rest).map_err(|e| e.to_string())?;
            Ok(TrieNode::Leaf(account))
        }
        Some((tag, _)) => Err(format!("unknown node tag {:#x}", tag)),
        None => Err("empty node".to_string()),
    }
}

/// Test-facing encoders matching [`decode_node`].
#[cfg(test)]
pub(crate) fn encode_branch(children: &[Hash256]) -> Vec<u8> {
    let mut out = vec![NODE_TAG_BRANCH, children.len() as u8];
    for child in children {
        out.extend_from_slice(child.as_bytes());
    }
    out
}

#[cfg(test)]
pub(crate) fn encode_leaf(account: &Account) -> Vec<u8> {
    let mut out = vec![NODE_TAG_LEAF];
    out.extend_from_slice(&account.encode());
    out
}

/// The scheduler: tracks which hashes are still wanted and digests
/// delivered blobs.
pub struct StateSync<D: Database> {
    db: Arc<D>,
    hasher: Hasher,
    pending: VecDeque<NodeRequest>,
    in_flight: FnvHashMap<Hash256, NodeRequest>,
    fetched: u64,
    log: Logger,
}

impl<D: Database> StateSync<D> {
    pub fn new(root: Hash256, db: Arc<D>, hasher: Hasher, log: Logger) -> Self {
        let mut sync = StateSync {
            db,
            hasher,
            pending: VecDeque::new(),
            in_flight: FnvHashMap::default(),
            fetched: 0,
            log,
        };
        sync.schedule(root, 0, Hash256::zero(), EntryKind::Node);
        sync
    }

    fn schedule(&mut self, hash: Hash256, depth: u32, parent: Hash256, kind: EntryKind) {
        if hash.is_zero() || self.db.contains(hash.as_bytes()) {
            return;
        }
        if self.in_flight.contains_key(&hash)
            || self.pending.iter().any(|request| request.hash == hash)
        {
            return;
        }
        self.pending.push_back(NodeRequest {
            hash,
            depth,
            parent,
            kind,
            retries: 0,
        });
    }

    /// Pops up to `max` hashes into the in-flight set.
    fn missing(&mut self, max: usize) -> Vec<Hash256> {
        let mut batch = Vec::with_capacity(max.min(self.pending.len()));
        while batch.len() < max {
            match self.pending.pop_front() {
                Some(request) => {
                    batch.push(request.hash);
                    self.in_flight.insert(request.hash, request);
                }
                None => break,
            }
        }
        batch
    }

    /// Digests one delivered blob. Blobs whose hash matches nothing we
    /// asked for are ignored.
    fn process(&mut self, data: &[u8]) {
        let hash = (self.hasher)(data);
        let request = match self.in_flight.remove(&hash) {
            Some(request) => request,
            None => return,
        };
        if let EntryKind::Node = request.kind {
            match decode_node(data) {
                Ok(TrieNode::Branch(children)) => {
                    for child in children {
                        self.schedule(child, request.depth + 1, hash, EntryKind::Node);
                    }
                }
                Ok(TrieNode::Leaf(account)) => {
                    self.schedule(
                        account.storage_root,
                        request.depth + 1,
                        hash,
                        EntryKind::Node,
                    );
                    self.schedule(account.code_hash, request.depth + 1, hash, EntryKind::Raw);
                }
                Err(reason) => {
                    warn!(
                        self.log, "Undecodable state node, retrying";
                        "hash" => ?hash, "parent" => ?request.parent, "reason" => reason,
                    );
                    self.in_flight.insert(hash, request);
                    return;
                }
            }
        }
        self.db.put(hash.as_bytes(), data);
        self.fetched += 1;
    }

    /// Returns the in-flight hashes that were not satisfied by a response
    /// to the pending queue, failing any that ran out of retries.
    fn requeue_unanswered(
        &mut self,
        asked: &[Hash256],
        max_retry: u8,
    ) -> Result<(), StateSyncError> {
        for hash in asked {
            if let Some(mut request) = self.in_flight.remove(hash) {
                request.retries += 1;
                if request.retries > max_retry {
                    return Err(StateSyncError::RetriesExhausted(*hash));
                }
                self.pending.push_back(request);
            }
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn fetched(&self) -> u64 {
        self.fetched
    }
}

type BatchResponse = (PeerId, Vec<Hash256>, Result<Vec<Vec<u8>>, PeerError>);

/// Drives a [`StateSync`] to completion over a peer set.
///
/// Up to `max_outstanding` node-data batches stay in flight at once, one
/// per peer, filled round-robin as responses land. A peer that fails or
/// serves nothing is set aside until every other peer has failed too.
pub async fn download_state<D: Database, P: SyncPeer>(
    mut sync: StateSync<D>,
    peers: &[Arc<P>],
    batch: usize,
    max_outstanding: usize,
    max_retry: u8,
    deadline: Duration,
    mut quit: watch::Receiver<bool>,
) -> Result<(), StateSyncError> {
    let log = sync.log.clone();
    let max_outstanding = max_outstanding.max(1);
    let mut rotation = 0usize;
    let mut banned: Vec<PeerId> = Vec::new();
    let mut busy: Vec<PeerId> = Vec::new();
    let mut requests: FuturesUnordered<BoxFuture<'static, BatchResponse>> =
        FuturesUnordered::new();

    loop {
        if *quit.borrow() {
            return Ok(());
        }

        // Keep the pipeline full: one batch per idle peer, up to the cap.
        while requests.len() < max_outstanding {
            let peer = {
                let candidates: Vec<&Arc<P>> = peers
                    .iter()
                    .filter(|peer| {
                        !peer.is_closed()
                            && !banned.contains(&peer.id())
                            && !busy.contains(&peer.id())
                    })
                    .collect();
                if candidates.is_empty() {
                    break;
                }
                Arc::clone(candidates[rotation % candidates.len()])
            };
            rotation = rotation.wrapping_add(1);
            let asked = sync.missing(batch);
            if asked.is_empty() {
                break;
            }
            let peer_id = peer.id();
            debug!(
                log, "Requesting state nodes";
                "count" => asked.len(), "peer" => %peer_id, "in_flight" => requests.len() + 1,
            );
            busy.push(peer_id.clone());
            requests.push(Box::pin(async move {
                let result = match timeout(deadline, peer.node_data(asked.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(PeerError::Timeout),
                };
                (peer_id, asked, result)
            }));
        }

        if requests.is_empty() {
            if sync.is_done() {
                break;
            }
            // Nodes are still wanted but nobody is askable. Failed peers
            // get another chance only when everyone has failed.
            if !banned.is_empty() {
                banned.clear();
                continue;
            }
            return Err(StateSyncError::NoPeers);
        }

        tokio::select! {
            Some((peer_id, asked, result)) = requests.next() => {
                busy.retain(|id| id != &peer_id);
                match result {
                    Ok(blobs) => {
                        if blobs.is_empty() {
                            debug!(log, "Peer served no state nodes"; "peer" => %peer_id);
                            banned.push(peer_id);
                        }
                        for blob in &blobs {
                            sync.process(blob);
                        }
                        sync.requeue_unanswered(&asked, max_retry)?;
                    }
                    Err(e) => {
                        debug!(log, "State node request failed"; "peer" => %peer_id, "error" => %e);
                        banned.push(peer_id);
                        sync.requeue_unanswered(&asked, max_retry)?;
                    }
                }
                if banned.len() >= peers.len() {
                    banned.clear();
                }
            }
            _ = quit.changed() => return Ok(()),
        }
    }

    info!(log, "State download complete"; "nodes" => sync.fetched());
    Ok(())
}
