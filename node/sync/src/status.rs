//! Shared, read-mostly view of the synchronizer's state.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Top-level state of the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Waiting for enough peers to decide on a strategy.
    Init,
    /// Downloading blocks plus a state snapshot at a fixed point.
    FastSync,
    /// In sync; regular catch-up runs in the background.
    Normal,
    /// Resolving a dependency stall against a single peer.
    PeerSync,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Init => write!(f, "init"),
            SyncStatus::FastSync => write!(f, "fast_sync"),
            SyncStatus::Normal => write!(f, "normal"),
            SyncStatus::PeerSync => write!(f, "peer_sync"),
        }
    }
}

/// How the current fast sync obtains state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastSyncMode {
    None,
    /// State snapshot downloaded at the fixed point.
    Full,
    /// The agreed list is short enough to execute block-by-block.
    Incremental,
}

impl fmt::Display for FastSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastSyncMode::None => write!(f, "none"),
            FastSyncMode::Full => write!(f, "full"),
            FastSyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Phase of the current fast sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastSyncStatus {
    None,
    HashList,
    PreState,
    State,
    PostState,
    Done,
}

impl fmt::Display for FastSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastSyncStatus::None => write!(f, "none"),
            FastSyncStatus::HashList => write!(f, "hash_list"),
            FastSyncStatus::PreState => write!(f, "pre_state"),
            FastSyncStatus::State => write!(f, "state"),
            FastSyncStatus::PostState => write!(f, "post_state"),
            FastSyncStatus::Done => write!(f, "done"),
        }
    }
}

/// State shared between the synchronizer loop, its sub-sync tasks and the
/// host. Written only by the owning tasks, read by anyone.
pub struct SyncGlobals {
    status: RwLock<SyncStatus>,
    fast_sync_mode: RwLock<FastSyncMode>,
    fast_sync_status: RwLock<FastSyncStatus>,
    /// Blocks the cursor discarded after a failed verification.
    discarded_blocks: AtomicU64,
}

impl SyncGlobals {
    pub fn new() -> Self {
        SyncGlobals {
            status: RwLock::new(SyncStatus::Init),
            fast_sync_mode: RwLock::new(FastSyncMode::None),
            fast_sync_status: RwLock::new(FastSyncStatus::None),
            discarded_blocks: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: SyncStatus) {
        *self.status.write() = status;
    }

    pub fn fast_sync_mode(&self) -> FastSyncMode {
        *self.fast_sync_mode.read()
    }

    pub fn set_fast_sync_mode(&self, mode: FastSyncMode) {
        *self.fast_sync_mode.write() = mode;
    }

    pub fn fast_sync_status(&self) -> FastSyncStatus {
        *self.fast_sync_status.read()
    }

    pub fn set_fast_sync_status(&self, status: FastSyncStatus) {
        *self.fast_sync_status.write() = status;
    }

    pub fn discarded_blocks(&self) -> u64 {
        self.discarded_blocks.load(Ordering::Relaxed)
    }

    pub fn add_discarded_blocks(&self, count: u64) {
        self.discarded_blocks.fetch_add(count, Ordering::Relaxed);
    }
}

impl Default for SyncGlobals {
    fn default() -> Self {
        Self::new()
    }
}
