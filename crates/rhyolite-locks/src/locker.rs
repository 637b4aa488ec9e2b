//! Locker identity and flags.

use std::collections::HashSet;
use std::fmt::{self, Display};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stable id of a lockable record.
///
/// The engine derives it from the storage key; the table never inspects the
/// key itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(u64);

impl RecordId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Stable id of a locker: a transaction or an internal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockerId(u64);

impl LockerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

impl From<u64> for LockerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Static properties of a locker, fixed at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockerFlags {
    /// Replay locker: allowed to steal conflicting locks instead of
    /// waiting behind them.
    pub importunate: bool,
    /// May have its locks stolen by an importunate locker.
    pub preemptable: bool,
    /// Lockers with the same group share locks and never conflict with
    /// each other (a transaction and its cursors).
    pub share_group: Option<u64>,
}

impl LockerFlags {
    /// Flags for a replay transaction.
    pub fn replay() -> Self {
        Self {
            importunate: true,
            preemptable: false,
            share_group: None,
        }
    }

    /// Flags for an ordinary local transaction.
    pub fn local() -> Self {
        Self {
            importunate: false,
            preemptable: true,
            share_group: None,
        }
    }

    /// True when `self` shares locks with `other`.
    pub fn shares_with(&self, other: &LockerFlags) -> bool {
        matches!((self.share_group, other.share_group), (Some(a), Some(b)) if a == b)
    }
}

/// Table-owned state of a registered locker.
#[derive(Debug)]
pub(crate) struct LockerState {
    pub(crate) flags: LockerFlags,
    /// Set when replay steals one of this locker's locks. Its transaction
    /// must observe the flag and abort.
    pub(crate) preempted: AtomicBool,
    /// Records this locker currently owns; drives `release_all` and
    /// owner-id rewriting during role transition.
    pub(crate) held: Mutex<HashSet<RecordId>>,
}

impl LockerState {
    pub(crate) fn new(flags: LockerFlags) -> Self {
        Self {
            flags,
            preempted: AtomicBool::new(false),
            held: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn is_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_preempted(&self) {
        self.preempted.store(true, Ordering::Release);
    }
}
