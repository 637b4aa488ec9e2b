//! Per-record lock state and the grant decision.

use std::collections::VecDeque;

use crate::locker::{LockerFlags, LockerId};

/// Mode of a lock request or holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Shared: any number of readers coexist.
    Read,
    /// Exclusive: conflicts with everything outside the share group.
    Write,
}

impl LockMode {
    /// True when a holder in `self` prevents a request in `other`.
    pub fn conflicts(self, other: LockMode) -> bool {
        self == LockMode::Write || other == LockMode::Write
    }

    /// True when moving from `self` to `requested` strengthens the holding.
    pub fn is_strict_upgrade(self, requested: LockMode) -> bool {
        self == LockMode::Read && requested == LockMode::Write
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// Granted; the locker was not previously an owner.
    New,
    /// The locker already held the record in a sufficient mode.
    Existing,
    /// Granted by upgrading the locker's existing read to a write.
    Promotion,
    /// Not granted; the locker was appended to the waiter line.
    WaitNew,
    /// Not granted; the locker waits at the head of the line for its
    /// read→write promotion.
    WaitPromotion,
    /// Not granted and `nonblocking` was set; no waiter was recorded.
    Denied,
}

impl LockGrant {
    /// True when the request ended with the locker owning the record.
    pub fn is_granted(self) -> bool {
        matches!(self, Self::New | Self::Existing | Self::Promotion)
    }

    /// True for the two queued outcomes.
    pub fn is_wait(self) -> bool {
        matches!(self, Self::WaitNew | Self::WaitPromotion)
    }
}

/// One owner of a record lock.
///
/// Flags are copied from the locker registry at grant time; they are fixed
/// per locker, so the copy cannot go stale.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockInfo {
    pub(crate) locker: LockerId,
    pub(crate) mode: LockMode,
    pub(crate) flags: LockerFlags,
}

/// One queued waiter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub(crate) locker: LockerId,
    pub(crate) mode: LockMode,
    pub(crate) flags: LockerFlags,
    /// True when the waiter already owns the record in read mode and is
    /// queued for the write upgrade.
    pub(crate) promotion: bool,
}

/// Owner set with the single-owner case kept inline.
///
/// Most records have exactly one owner at a time, so the common case avoids
/// a heap allocation; the `Many` arm only appears under reader sharing.
#[derive(Debug, Default)]
pub(crate) enum Owners {
    #[default]
    Empty,
    One(LockInfo),
    Many(Vec<LockInfo>),
}

impl Owners {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::One(_) => 1,
            Self::Many(v) => v.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    fn as_slice(&self) -> &[LockInfo] {
        match self {
            Self::Empty => &[],
            Self::One(info) => std::slice::from_ref(info),
            Self::Many(v) => v.as_slice(),
        }
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, LockInfo> {
        self.as_slice().iter()
    }

    pub(crate) fn get(&self, locker: LockerId) -> Option<&LockInfo> {
        self.iter().find(|info| info.locker == locker)
    }

    /// Adds an owner. The caller has already established the locker is not
    /// present.
    pub(crate) fn push(&mut self, info: LockInfo) {
        debug_assert!(self.get(info.locker).is_none(), "owner added twice");
        match self {
            Self::Empty => *self = Self::One(info),
            Self::One(existing) => *self = Self::Many(vec![*existing, info]),
            Self::Many(v) => v.push(info),
        }
    }

    /// Removes an owner, returning its entry if present.
    pub(crate) fn remove(&mut self, locker: LockerId) -> Option<LockInfo> {
        match self {
            Self::Empty => None,
            Self::One(info) if info.locker == locker => {
                let info = *info;
                *self = Self::Empty;
                Some(info)
            }
            Self::One(_) => None,
            Self::Many(v) => {
                let idx = v.iter().position(|info| info.locker == locker)?;
                let info = v.remove(idx);
                if v.len() == 1 {
                    *self = Self::One(v[0]);
                }
                Some(info)
            }
        }
    }

    /// Changes the mode of an existing owner.
    pub(crate) fn set_mode(&mut self, locker: LockerId, mode: LockMode) -> bool {
        let slot = match self {
            Self::Empty => None,
            Self::One(info) => (info.locker == locker).then_some(info),
            Self::Many(v) => v.iter_mut().find(|info| info.locker == locker),
        };
        match slot {
            Some(info) => {
                info.mode = mode;
                true
            }
            None => false,
        }
    }

    /// Rewrites an owner's id in place, preserving its mode, and installs
    /// the new identity's flags.
    pub(crate) fn rewrite(&mut self, from: LockerId, to: LockerId, to_flags: LockerFlags) -> Option<LockMode> {
        let slot = match self {
            Self::Empty => None,
            Self::One(info) => (info.locker == from).then_some(info),
            Self::Many(v) => v.iter_mut().find(|info| info.locker == from),
        };
        slot.map(|info| {
            info.locker = to;
            info.flags = to_flags;
            info.mode
        })
    }
}

/// The lock on one record: owners plus ordered waiters.
#[derive(Debug, Default)]
pub(crate) struct Lock {
    pub(crate) owners: Owners,
    pub(crate) waiters: VecDeque<Waiter>,
}

impl Lock {
    /// True when the lock holds no state and can be dropped from the table.
    pub(crate) fn is_unused(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty()
    }

    pub(crate) fn waiter_position(&self, locker: LockerId) -> Option<usize> {
        self.waiters.iter().position(|w| w.locker == locker)
    }

    /// Evaluates a request against the current owners, without touching
    /// the waiter line.
    ///
    /// Returns the grant decision plus whether a pending read→write
    /// upgrade was found.
    pub(crate) fn evaluate(
        &self,
        locker: LockerId,
        flags: LockerFlags,
        requested: LockMode,
        jump_waiters: bool,
    ) -> LockGrant {
        // With no owners the record is free: either there are no waiters at
        // all, or the caller is a drained waiter being converted (the only
        // state in which an empty owner set coexists with a waiter line).
        if self.owners.is_empty() {
            return LockGrant::New;
        }

        let mut pending_upgrade = false;
        let mut conflict = false;
        for owner in self.owners.iter() {
            if owner.locker == locker {
                if owner.mode.is_strict_upgrade(requested) {
                    pending_upgrade = true;
                } else {
                    // Same or weaker mode requested: nothing to do.
                    return LockGrant::Existing;
                }
            } else if !flags.shares_with(&owner.flags) && owner.mode.conflicts(requested) {
                conflict = true;
            }
        }

        if pending_upgrade {
            if conflict {
                LockGrant::WaitPromotion
            } else {
                LockGrant::Promotion
            }
        } else if !conflict && (jump_waiters || self.line_is_clear(locker)) {
            LockGrant::New
        } else {
            LockGrant::WaitNew
        }
    }

    fn first_waiter_is(&self, locker: LockerId) -> bool {
        self.waiters.front().is_some_and(|w| w.locker == locker)
    }

    /// True when no earlier waiter would be bypassed by granting `locker`
    /// now: the line is empty or `locker` heads it.
    fn line_is_clear(&self, locker: LockerId) -> bool {
        self.waiters.is_empty() || self.first_waiter_is(locker)
    }
}
