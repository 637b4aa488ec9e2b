//! Narrow interfaces to the engine's collaborators.
//!
//! The storage engine and the election layer are external to the replay
//! engine; only the operations named here are assumed. In-memory doubles
//! live in [`crate::testkit`].

use rhyolite_types::{Lsn, MasterTerm, NodeId, Vlsn};
use rhyolite_wire::Entry;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures the storage engine can surface to the replayer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The configured disk budget is exhausted. The replica loop exits
    /// cleanly and the node waits for space.
    #[error("disk limit violated: {0}")]
    DiskLimit(String),

    /// Any other storage failure; fatal for the current loop.
    #[error("storage failure: {0}")]
    Failed(String),
}

/// Handle to an open database (namespace) inside the storage engine.
///
/// Opening can be expensive; the replayer caches handles in a bounded
/// cache keyed by db id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHandle {
    pub db_id: u64,
}

/// The storage engine operations the replay engine consumes.
pub trait ReplayStore: Send + Sync {
    /// Opens (or fetches) the database a record lives in.
    fn open_db(&self, db_id: u64) -> StoreResult<DbHandle>;

    /// Applies one replicated entry. Writes carry a key/value; commit and
    /// abort entries make or discard the transaction's writes.
    fn apply(&self, db: &DbHandle, entry: &Entry) -> StoreResult<()>;

    /// Forces a checkpoint that minimizes recovery work on the next open.
    fn checkpoint(&self) -> StoreResult<()>;

    /// Discards every log entry at or after `lsn`.
    fn truncate(&self, lsn: Lsn) -> StoreResult<()>;

    /// Cheap disk-budget probe, consulted once per incoming message.
    fn disk_ok(&self) -> StoreResult<()>;
}

/// One entry met during the backward sync-up scan of the local log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    /// Where the entry sits in the local log.
    pub lsn: Lsn,
    /// Its stream position.
    pub vlsn: Vlsn,
    /// Transaction id for txn-end entries, zero otherwise.
    pub txn_id: u64,
    /// True for commit/abort entries.
    pub is_txn_end: bool,
    /// True for commit entries only.
    pub is_commit: bool,
    /// True when the commit was locally synced to disk.
    pub durable: bool,
    /// Durable-txn VLSN recorded with the entry.
    pub dtvlsn: Vlsn,
    /// True for a checkpoint-end marker. Scanning past one prohibits
    /// automatic rollback.
    pub is_checkpoint_end: bool,
    /// True for a gap the log cleaner skipped. Same prohibition.
    pub is_skipped_gap: bool,
    /// First-active LSN recorded by checkpoint entries, if any.
    pub first_active_lsn: Option<Lsn>,
}

/// Backward access to the local replicated log, used only during sync-up.
pub trait LogScanner: Send + Sync {
    /// Entries from the log tail backwards to the start.
    fn scan_backward(&self) -> Box<dyn Iterator<Item = ScannedEntry> + '_>;

    /// Appends a non-replicated marker record and fsyncs it.
    fn append_marker(&self, marker: &[u8]) -> StoreResult<Lsn>;
}

/// The election layer's view, as consumed by the replay engine.
pub trait ElectionView: Send + Sync {
    /// The master this node believes in, if any.
    fn current_master(&self) -> Option<(NodeId, MasterTerm)>;

    /// True while `master`/`term` is still the group's master. The
    /// replayer asserts this as it drains the queue; a mismatch unwinds
    /// the loop.
    fn in_sync(&self, master: NodeId, term: MasterTerm) -> bool;

    /// Tells the election layer its master is gone, so it can start a new
    /// round.
    fn notify_master_obsolete(&self);
}
