//! Hash-list consensus: deciding, over a peer set, on a canonical ordered
//! list of block identities.
//!
//! Collection is concurrent and lossy (peers that time out or answer with
//! malformed lists are simply excluded); the decision itself is a pure
//! function of the collected responses so that a fixed response set always
//! produces the same agreement.

use crate::chain::Chain;
use crate::peer::{best_by_head, cmp_heads, PeerId, SyncPeer};
use crate::protocol::{
    longest_common_prefix, validate_hash_list, HashElem, HashListBounds, SyncStage,
};
use fnv::FnvHashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use slog::{debug, warn, Logger};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Too few peers answered; wait for more and retry.
    NotEnoughPeers,
    /// The responders share no prefix at all.
    NoCommonPrefix,
    /// No sufficiently large group of peers agrees on a prefix.
    CanNotGetConsensus,
    /// Blocks along the agreed list failed local verification beyond the
    /// tolerated budget.
    MainChainCheckFailed,
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::NotEnoughPeers => write!(f, "not enough peers"),
            ConsensusError::NoCommonPrefix => {
                write!(f, "no common prefix in short hash lists")
            }
            ConsensusError::CanNotGetConsensus => {
                write!(f, "failed to get to an agreement of hash lists")
            }
            ConsensusError::MainChainCheckFailed => {
                write!(f, "main block check and exec failed")
            }
        }
    }
}

/// One peer's answer to a hash-list request.
pub struct PeerHashList<P> {
    pub peer: Arc<P>,
    pub list: Vec<HashElem>,
}

/// The outcome of a successful consensus round.
#[derive(Debug)]
pub struct Agreement<P> {
    /// The prefix every class member shares, in canonical order.
    pub agreed: Vec<HashElem>,
    /// The peers backing the agreed prefix.
    pub class: Vec<Arc<P>>,
    /// For each dissenter, the index at which its list diverges from the
    /// agreed prefix. Diagnostic only.
    pub dissent_index: FnvHashMap<PeerId, usize>,
}

/// Asks every peer for its hash list over `bounds`, dropping peers that
/// time out or answer with a list violating the structural invariants.
pub async fn request_hash_lists<P: SyncPeer>(
    peers: &[Arc<P>],
    stage: SyncStage,
    bounds: HashListBounds,
    deadline: Duration,
    log: &Logger,
) -> Vec<PeerHashList<P>> {
    let mut requests = peers
        .iter()
        .map(|peer| {
            let peer = peer.clone();
            async move {
                let result = timeout(deadline, peer.sync_hash_list(stage, bounds)).await;
                (peer, result)
            }
        })
        .collect::<FuturesUnordered<_>>();

    let mut responses = Vec::with_capacity(peers.len());
    while let Some((peer, result)) = requests.next().await {
        match result {
            Ok(Ok(list)) => match validate_hash_list(&list, &bounds) {
                Ok(()) => responses.push(PeerHashList { peer, list }),
                Err(e) => {
                    warn!(log, "Discarding malformed hash list"; "peer" => %peer.id(), "error" => %e);
                }
            },
            Ok(Err(e)) => {
                debug!(log, "Hash list request failed"; "peer" => %peer.id(), "error" => %e);
            }
            Err(_) => {
                debug!(log, "Hash list request timed out"; "peer" => %peer.id(), "stage" => %stage);
            }
        }
    }
    // Deterministic downstream processing regardless of arrival order.
    responses.sort_unstable_by_key(|r| r.peer.id());
    responses
}

/// Decides on the main-chain hash list.
///
/// Responders are grouped by their first `com_pre_count` elements; the
/// winning class is the largest one with at least `min_peer_count`
/// members, ties broken toward the class holding the best head and then by
/// prefix order. The agreed list is the longest common prefix of the
/// winning class. Pure: no requests, no clocks.
pub fn find_main_chain<P: SyncPeer>(
    responses: Vec<PeerHashList<P>>,
    com_pre_count: usize,
    min_peer_count: usize,
) -> Result<Agreement<P>, ConsensusError> {
    if responses.is_empty() || responses.len() < min_peer_count {
        return Err(ConsensusError::NotEnoughPeers);
    }
    if com_pre_count == 0 {
        return Err(ConsensusError::NoCommonPrefix);
    }

    // Group by the attestation prefix. Lists shorter than the threshold
    // cannot attest and are left out as dissenters.
    let mut classes: FnvHashMap<Vec<HashElem>, Vec<usize>> = FnvHashMap::default();
    for (index, response) in responses.iter().enumerate() {
        if response.list.len() >= com_pre_count {
            classes
                .entry(response.list[..com_pre_count].to_vec())
                .or_insert_with(Vec::new)
                .push(index);
        }
    }

    let mut candidates: Vec<(Vec<HashElem>, Vec<usize>)> = classes.into_iter().collect();
    candidates.sort_unstable_by(|(key_a, members_a), (key_b, members_b)| {
        members_b
            .len()
            .cmp(&members_a.len())
            .then_with(|| {
                let best_a = best_head_of(&responses, members_a);
                let best_b = best_head_of(&responses, members_b);
                cmp_heads(&best_b, &best_a)
            })
            .then_with(|| cmp_prefixes(key_a, key_b))
    });

    let (_, members) = match candidates.into_iter().next() {
        Some(winner) if winner.1.len() >= min_peer_count => winner,
        _ => return Err(ConsensusError::CanNotGetConsensus),
    };

    // The class agrees on at least `com_pre_count` elements; extend the
    // agreement as far as every member's full list allows.
    let mut agreed = responses[members[0]].list.clone();
    for &member in members.iter().skip(1) {
        let lcp = longest_common_prefix(&agreed, &responses[member].list);
        agreed.truncate(lcp);
    }
    if agreed.is_empty() {
        return Err(ConsensusError::NoCommonPrefix);
    }

    let mut dissent_index = FnvHashMap::default();
    let mut class = Vec::with_capacity(members.len());
    for (index, response) in responses.into_iter().enumerate() {
        if members.contains(&index) {
            class.push(response.peer);
        } else {
            dissent_index.insert(
                response.peer.id(),
                longest_common_prefix(&agreed, &response.list),
            );
        }
    }

    Ok(Agreement {
        agreed,
        class,
        dissent_index,
    })
}

fn best_head_of<P: SyncPeer>(
    responses: &[PeerHashList<P>],
    members: &[usize],
) -> crate::peer::PeerHead {
    members
        .iter()
        .map(|&index| responses[index].peer.head())
        .max_by(|a, b| cmp_heads(a, b))
        .unwrap_or_default()
}

fn cmp_prefixes(a: &[HashElem], b: &[HashElem]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.cmp_round_hash(y);
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Verifies the agreed list against blocks served by the best peer of the
/// winning class.
///
/// Every agreed element must be covered by a delivered (or already local)
/// block whose height and round match. Up to `fail_budget` misses are
/// tolerated; beyond that the whole run fails.
pub async fn check_main_chain<P: SyncPeer, C: Chain>(
    best_peer: &Arc<P>,
    agreed: &[HashElem],
    chain: &C,
    stage: SyncStage,
    fail_budget: usize,
    deadline: Duration,
    log: &Logger,
) -> Result<(), ConsensusError> {
    let (first, last) = match (agreed.first(), agreed.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Ok(()),
    };

    let blocks = match timeout(
        deadline,
        best_peer.blocks_by_round_range(stage, first.round, last.round),
    )
    .await
    {
        Ok(Ok(blocks)) => blocks,
        Ok(Err(e)) => {
            warn!(log, "Main chain check request failed"; "peer" => %best_peer.id(), "error" => %e);
            Vec::new()
        }
        Err(_) => {
            warn!(log, "Main chain check request timed out"; "peer" => %best_peer.id());
            Vec::new()
        }
    };

    let delivered: FnvHashMap<_, _> = blocks
        .iter()
        .map(|block| (block.full_hash(), block))
        .collect();

    let mut failures = 0usize;
    for elem in agreed {
        let covered = match delivered.get(&elem.full_hash) {
            Some(block) => block.height() == elem.height && block.round() == elem.round,
            None => chain.has_block(&elem.full_hash),
        };
        if !covered {
            debug!(log, "Agreed element not covered by best peer"; "height" => elem.height, "round" => elem.round);
            failures += 1;
        }
    }

    if failures > fail_budget {
        warn!(
            log, "Main chain check failed";
            "failures" => failures, "budget" => fail_budget, "peer" => %best_peer.id(),
        );
        return Err(ConsensusError::MainChainCheckFailed);
    }
    Ok(())
}

/// Derives the attestation prefix length for a response set: the shortest
/// list every responder can still vouch for.
pub fn common_prefix_count<P>(responses: &[PeerHashList<P>]) -> usize {
    responses
        .iter()
        .map(|response| response.list.len())
        .min()
        .unwrap_or(0)
}

pub fn best_of_class<P: SyncPeer>(agreement: &Agreement<P>) -> Option<Arc<P>> {
    best_by_head(&agreement.class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerHead;
    use crate::tests::mocks::MockPeer;
    use types::Hash256;

    fn elem(height: u64, round: u64, byte: u8) -> HashElem {
        HashElem {
            height,
            round,
            full_hash: Hash256::repeat_byte(byte),
            simple_hash: Hash256::repeat_byte(byte),
        }
    }

    fn chain_list(len: u64) -> Vec<HashElem> {
        (0..len).map(|i| elem(i, i * 2, i as u8 + 1)).collect()
    }

    fn response(id: &str, height: u64, list: Vec<HashElem>) -> PeerHashList<MockPeer> {
        let head = PeerHead {
            full_hash: Hash256::repeat_byte(0xe0),
            simple_hash: Hash256::repeat_byte(0xe0),
            height,
            round: height * 2,
        };
        PeerHashList {
            peer: Arc::new(MockPeer::new(id, head)),
            list,
        }
    }

    #[test]
    fn unanimous_peers_agree_on_the_full_list() {
        let list = chain_list(10);
        let responses = vec![
            response("a", 9, list.clone()),
            response("b", 9, list.clone()),
            response("c", 9, list.clone()),
        ];
        let agreement = find_main_chain(responses, 10, 3).expect("consensus");
        assert_eq!(agreement.agreed, list);
        assert_eq!(agreement.class.len(), 3);
        assert!(agreement.dissent_index.is_empty());
    }

    #[test]
    fn two_equal_factions_cannot_reach_consensus() {
        let honest = chain_list(100);
        let mut forked = honest.clone();
        for (i, e) in forked.iter_mut().enumerate().skip(50) {
            e.full_hash = Hash256::repeat_byte(0xf0 ^ i as u8);
        }
        let responses = vec![
            response("a1", 99, honest.clone()),
            response("a2", 99, honest),
            response("b1", 99, forked.clone()),
            response("b2", 99, forked),
        ];
        assert_eq!(
            find_main_chain(responses, 100, 3).unwrap_err(),
            ConsensusError::CanNotGetConsensus
        );
    }

    #[test]
    fn largest_class_wins_and_dissenters_are_indexed() {
        let honest = chain_list(20);
        let mut forked = honest.clone();
        forked[15].full_hash = Hash256::repeat_byte(0xf0);
        let responses = vec![
            response("a1", 19, honest.clone()),
            response("a2", 19, honest.clone()),
            response("a3", 19, honest.clone()),
            response("b1", 19, forked),
        ];
        // The dissenter's list still matches for 15 elements, so grouping
        // by a shorter attestation prefix keeps it in the class while the
        // LCP shortens the agreement; grouping by the full list isolates
        // it. Use the full length here to exercise dissent tracking.
        let agreement = find_main_chain(responses, 20, 3).expect("consensus");
        assert_eq!(agreement.agreed, honest);
        assert_eq!(agreement.class.len(), 3);
        assert_eq!(
            agreement.dissent_index[&crate::peer::PeerId::new("b1")],
            15
        );
    }

    #[test]
    fn short_prefix_grouping_truncates_to_the_common_prefix() {
        let long = chain_list(20);
        let mut diverged = long.clone();
        for (i, e) in diverged.iter_mut().enumerate().skip(10) {
            e.full_hash = Hash256::repeat_byte(0xa0 ^ i as u8);
        }
        let responses = vec![
            response("a", 19, long.clone()),
            response("b", 19, long.clone()),
            response("c", 19, diverged),
        ];
        // All three share the first 10 elements, so with an attestation
        // prefix of 10 they form one class whose LCP is exactly those 10.
        let agreement = find_main_chain(responses, 10, 3).expect("consensus");
        assert_eq!(agreement.agreed, long[..10].to_vec());
        assert_eq!(agreement.class.len(), 3);
    }

    #[test]
    fn ties_resolve_toward_the_class_with_the_best_head() {
        let honest = chain_list(10);
        let mut forked = honest.clone();
        forked[9].full_hash = Hash256::repeat_byte(0xf0);
        let responses = vec![
            response("low1", 9, honest.clone()),
            response("low2", 9, honest),
            response("high1", 50, forked.clone()),
            response("high2", 50, forked.clone()),
        ];
        let agreement = find_main_chain(responses, 10, 2).expect("consensus");
        assert_eq!(agreement.agreed, forked);
        let mut ids: Vec<_> = agreement.class.iter().map(|p| p.id()).collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                crate::peer::PeerId::new("high1"),
                crate::peer::PeerId::new("high2")
            ]
        );
    }

    #[test]
    fn consensus_is_deterministic_for_a_fixed_response_set() {
        let make_responses = || {
            let honest = chain_list(12);
            let mut forked = honest.clone();
            forked[11].full_hash = Hash256::repeat_byte(0xf0);
            vec![
                response("a", 11, honest.clone()),
                response("b", 11, honest.clone()),
                response("c", 11, forked.clone()),
                response("d", 11, forked),
            ]
        };
        let first = find_main_chain(make_responses(), 12, 2).expect("consensus");
        for _ in 0..10 {
            let again = find_main_chain(make_responses(), 12, 2).expect("consensus");
            assert_eq!(again.agreed, first.agreed);
            let ids: Vec<_> = again.class.iter().map(|p| p.id()).collect();
            let first_ids: Vec<_> = first.class.iter().map(|p| p.id()).collect();
            assert_eq!(ids, first_ids);
        }
    }

    #[test]
    fn empty_response_set_is_not_enough_peers() {
        assert_eq!(
            find_main_chain::<MockPeer>(Vec::new(), 1, 1).unwrap_err(),
            ConsensusError::NotEnoughPeers
        );
    }
}
