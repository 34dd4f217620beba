use serde_derive::Deserialize;
use std::time::Duration;

/// Tunables for the synchronizer and its sub-protocols.
///
/// The defaults are the production values; hosts override them through
/// deserialized node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Peers required before any sync attempt starts.
    pub min_regular_peer_count: usize,
    /// Peers required before a fast sync is attempted.
    pub min_fast_sync_peer_count: usize,
    /// Height lag at which fast sync is preferred over regular catch-up.
    pub height_diff: u64,
    /// Per-peer deadline for a hash-list request.
    pub short_timeout_secs: u64,
    /// Deadline for a whole checkpoint-to-fixed-point run.
    pub long_timeout_secs: u64,
    /// Per-chunk deadline for a blocks-by-round-range request.
    pub chunk_timeout_secs: u64,
    /// How far below the hash list's first element a block may sit before
    /// the cursor rejects it.
    pub check_height_max_diff: u64,
    /// Head lag (in heights) that triggers the peer-sync sub-protocol.
    pub peer_sync_threshold: u64,
    /// Cooldown after a failed peer sync before retrying the same peer.
    pub finish_depend_err_secs: u64,
    /// Width of a block-fetcher round chunk.
    pub rounds_per_chunk: u64,
    /// In-flight request cap per peer inside a fetcher task.
    pub max_requests_per_peer: usize,
    /// Attempts per chunk before the fetch task fails.
    pub chunk_retry_limit: u8,
    /// Capacity of the fetcher-to-cursor block channel.
    pub block_channel_capacity: usize,
    /// Trie-node hashes requested per node-data message.
    pub node_fetch_batch: usize,
    /// Node-data batches kept in flight concurrently by the state
    /// downloader.
    pub max_outstanding_node_batches: usize,
    /// Attempts per trie node before the state download fails.
    pub state_max_retry: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            min_regular_peer_count: 3,
            min_fast_sync_peer_count: 4,
            height_diff: 10,
            short_timeout_secs: 10,
            long_timeout_secs: 180,
            chunk_timeout_secs: 20,
            check_height_max_diff: 10,
            peer_sync_threshold: 6,
            finish_depend_err_secs: 600,
            rounds_per_chunk: 32,
            max_requests_per_peer: 2,
            chunk_retry_limit: 5,
            block_channel_capacity: 256,
            node_fetch_batch: 128,
            max_outstanding_node_batches: 4,
            state_max_retry: 3,
        }
    }
}

impl SyncConfig {
    pub fn short_timeout(&self) -> Duration {
        Duration::from_secs(self.short_timeout_secs)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.long_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn finish_depend_err_time(&self) -> Duration {
        Duration::from_secs(self.finish_depend_err_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hold_the_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.check_height_max_diff, 10);
        assert_eq!(config.peer_sync_threshold, 6);
        assert_eq!(config.finish_depend_err_time(), Duration::from_secs(600));
    }
}
