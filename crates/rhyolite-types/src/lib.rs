//! # rhyolite-types: Core types for `Rhyolite`
//!
//! This crate contains shared types used across the `Rhyolite` replication
//! engine:
//! - Log positions ([`Vlsn`], [`Lsn`])
//! - Entity IDs ([`TxnId`], [`NodeId`], [`MasterTerm`])
//! - Replicated entry classification ([`EntryKind`])
//! - Channel naming for diagnostics ([`ChannelName`])
//! - Clock helpers ([`monotonic_nanos`], [`realtime_millis`])

use std::fmt::{self, Debug, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Log Positions - All Copy (cheap 8-byte values)
// ============================================================================

/// Virtual log sequence number.
///
/// Assigned by the master to every replicated log entry; strictly increasing
/// along the stream. For any two entries observed on the wire, order of
/// arrival equals order of VLSN.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Vlsn(u64);

impl Vlsn {
    /// The null VLSN, ordered before every real sequence number.
    pub const NULL: Vlsn = Vlsn(0);

    /// Sentinel for a VLSN field that has never been set.
    pub const UNINITIALIZED: Vlsn = Vlsn(u64::MAX);

    /// Sentinel for a VLSN known to be unusable (e.g. parsed from a
    /// corrupt frame).
    pub const INVALID: Vlsn = Vlsn(u64::MAX - 1);

    /// The first VLSN the master ever assigns.
    pub const FIRST: Vlsn = Vlsn(1);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the next sequence number.
    ///
    /// # Panics
    ///
    /// Panics if called on a sentinel value.
    pub fn next(self) -> Self {
        assert!(!self.is_sentinel(), "cannot advance a sentinel VLSN");
        Self(self.0 + 1)
    }

    /// True for [`Vlsn::NULL`].
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// True for any of the three sentinel values.
    pub fn is_sentinel(self) -> bool {
        matches!(self, Self::NULL | Self::UNINITIALIZED | Self::INVALID)
    }

    /// True for a real, master-assigned sequence number.
    pub fn is_real(self) -> bool {
        !self.is_sentinel()
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => write!(f, "null"),
            Self::UNINITIALIZED => write!(f, "uninit"),
            Self::INVALID => write!(f, "invalid"),
            Self(seq) => write!(f, "{seq}"),
        }
    }
}

impl Debug for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vlsn({self})")
    }
}

impl From<u64> for Vlsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Vlsn> for u64 {
    fn from(vlsn: Vlsn) -> Self {
        vlsn.0
    }
}

/// Local on-disk log position: file number plus byte offset.
///
/// Distinct from [`Vlsn`]: an `Lsn` is meaningful only on the node that
/// wrote the log file, while a VLSN is shared by the whole group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsn {
    /// Log file number.
    pub file: u32,
    /// Byte offset within the file.
    pub offset: u32,
}

impl Lsn {
    /// The null LSN, ordered before every real position.
    pub const NULL: Lsn = Lsn { file: 0, offset: 0 };

    pub fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// True for [`Lsn::NULL`].
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Packs the position into a single u64 (`file` in the upper 32 bits).
    ///
    /// The packed form preserves ordering, which the rollback marker codec
    /// relies on.
    pub fn pack(self) -> u64 {
        (u64::from(self.file) << 32) | u64::from(self.offset)
    }

    /// Inverse of [`Lsn::pack`].
    pub fn unpack(packed: u64) -> Self {
        Self {
            file: (packed >> 32) as u32,
            offset: (packed & 0xFFFF_FFFF) as u32,
        }
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.file, self.offset)
    }
}

// ============================================================================
// Entity IDs
// ============================================================================

/// Unique identifier for a transaction.
///
/// Assigned by the master for replicated transactions; the replica reuses
/// the master's id for the matching replay transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TxnId> for u64 {
    fn from(id: TxnId) -> Self {
        id.0
    }
}

/// Unique identifier for a node within the replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonically increasing master term.
///
/// A new term starts whenever the election layer installs a new master.
/// Entries carry the term so a replica can detect a stale stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MasterTerm(u64);

impl MasterTerm {
    pub const ZERO: MasterTerm = MasterTerm(0);

    pub fn new(term: u64) -> Self {
        Self(term)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for MasterTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ============================================================================
// Entry Classification
// ============================================================================

/// Kind of a replicated log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Insert or update a record.
    Put,
    /// Remove a record.
    Delete,
    /// End of a transaction, making its writes visible.
    Commit,
    /// End of a transaction, discarding its writes.
    Abort,
}

impl EntryKind {
    /// True for `Commit` and `Abort`, the entries that end a transaction.
    pub fn is_txn_end(self) -> bool {
        matches!(self, Self::Commit | Self::Abort)
    }

    /// True for entries that carry a record write.
    pub fn is_write(self) -> bool {
        matches!(self, Self::Put | Self::Delete)
    }
}

impl Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Commit => "commit",
            Self::Abort => "abort",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Name tag for a network channel: the remote node's name plus a local
/// sequence id, so log lines from overlapping connections stay apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelName {
    /// Remote node name.
    pub node_name: String,
    /// Locally assigned channel id, unique per process.
    pub id: u64,
}

impl ChannelName {
    pub fn new(node_name: impl Into<String>, id: u64) -> Self {
        Self {
            node_name: node_name.into(),
            id,
        }
    }
}

impl Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.node_name, self.id)
    }
}

// ============================================================================
// Clock Helpers
// ============================================================================

/// Returns the current monotonic time in nanoseconds.
///
/// Uses a process-wide anchor so values are comparable across threads.
pub fn monotonic_nanos() -> u128 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos()
}

/// Returns the current wall-clock time in milliseconds since the epoch.
pub fn realtime_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests;
