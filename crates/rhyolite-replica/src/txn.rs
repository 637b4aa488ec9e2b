//! Replay and master transactions.
//!
//! A replay transaction is created on the first write entry carrying a
//! given txn id and ends when the matching commit or abort is applied.
//! Master transactions exist only while the node is master; on a
//! master→replica transition they are frozen and converted in bulk (see
//! [`crate::transition`]).
//!
//! The freeze flag is an atomic observed on every commit/abort path; its
//! only purpose is to keep a transaction's lock set immutable while the
//! conversion rewrites ownership in the lock table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use rhyolite_locks::{LockMode, LockTable, LockerFlags, LockerId};
use rhyolite_types::TxnId;

use crate::error::{ReplicaError, ReplicaResult};
use crate::stats::ReplicaStats;

/// What created a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    /// Created by the replay stream; its locker is importunate.
    Replay,
    /// Created by a local writer while this node was master.
    Master,
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Active,
    /// The transaction can no longer commit; the owner must abort it.
    MustAbort,
}

struct TxnState {
    locker: LockerId,
    kind: TxnKind,
    phase: TxnPhase,
    frozen: Arc<AtomicBool>,
}

/// Report of a master→replica bulk conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConversionReport {
    /// Master transactions converted to replay transactions.
    pub converted: usize,
    /// Write locks carried across the conversion.
    pub write_locks_transferred: usize,
}

/// Registry of live transactions and their lockers.
pub struct TxnManager {
    locks: Arc<LockTable>,
    txns: Mutex<HashMap<TxnId, TxnState>>,
    next_locker: AtomicU64,
    stats: Option<Arc<ReplicaStats>>,
}

impl TxnManager {
    pub fn new(locks: Arc<LockTable>) -> Self {
        Self {
            locks,
            txns: Mutex::new(HashMap::new()),
            next_locker: AtomicU64::new(1),
            stats: None,
        }
    }

    pub fn with_stats(locks: Arc<LockTable>, stats: Arc<ReplicaStats>) -> Self {
        Self {
            stats: Some(stats),
            ..Self::new(locks)
        }
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    fn alloc_locker(&self, flags: LockerFlags) -> LockerId {
        let locker = LockerId::new(self.next_locker.fetch_add(1, Ordering::Relaxed));
        self.locks.register_locker(locker, flags);
        locker
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// The replay transaction for `txn_id`, created on first use.
    pub fn begin_replay(&self, txn_id: TxnId) -> ReplicaResult<LockerId> {
        let mut txns = self.txns.lock().expect("txn registry poisoned");
        if let Some(existing) = txns.get(&txn_id) {
            if existing.kind != TxnKind::Replay {
                return Err(ReplicaError::EnvironmentFailure(format!(
                    "stream reused txn id {txn_id} held by a master transaction"
                )));
            }
            return Ok(existing.locker);
        }
        let locker = self.alloc_locker(LockerFlags::replay());
        txns.insert(
            txn_id,
            TxnState {
                locker,
                kind: TxnKind::Replay,
                phase: TxnPhase::Active,
                frozen: Arc::new(AtomicBool::new(false)),
            },
        );
        debug!(%txn_id, %locker, "replay txn started");
        Ok(locker)
    }

    /// Starts a master transaction. Only meaningful while this node is
    /// master.
    pub fn begin_master(&self, txn_id: TxnId) -> ReplicaResult<LockerId> {
        let mut txns = self.txns.lock().expect("txn registry poisoned");
        if txns.contains_key(&txn_id) {
            return Err(ReplicaError::EnvironmentFailure(format!(
                "txn id {txn_id} already in use"
            )));
        }
        let locker = self.alloc_locker(LockerFlags::local());
        txns.insert(
            txn_id,
            TxnState {
                locker,
                kind: TxnKind::Master,
                phase: TxnPhase::Active,
                frozen: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(locker)
    }

    // ------------------------------------------------------------------
    // Ending
    // ------------------------------------------------------------------

    /// Commits a transaction, releasing its locks.
    ///
    /// Fails with [`ReplicaError::ReplicaWrite`] on a frozen transaction
    /// and [`ReplicaError::Preempted`] on one whose locks were stolen;
    /// both leave the transaction in `MustAbort`.
    pub fn commit(&self, txn_id: TxnId) -> ReplicaResult<()> {
        let locker = {
            let mut txns = self.txns.lock().expect("txn registry poisoned");
            let state = txns
                .get_mut(&txn_id)
                .ok_or(ReplicaError::EnvironmentFailure(format!(
                    "commit of unknown txn {txn_id}"
                )))?;
            if state.frozen.load(Ordering::Acquire) {
                state.phase = TxnPhase::MustAbort;
                return Err(ReplicaError::ReplicaWrite);
            }
            if self.locks.is_preempted(state.locker) {
                state.phase = TxnPhase::MustAbort;
                if let Some(stats) = &self.stats {
                    stats.inc_preemptions();
                }
                return Err(ReplicaError::Preempted);
            }
            if state.phase == TxnPhase::MustAbort {
                return Err(ReplicaError::Preempted);
            }
            let locker = state.locker;
            txns.remove(&txn_id);
            locker
        };
        self.locks.remove_locker(locker);
        Ok(())
    }

    /// Aborts a transaction, releasing whatever locks it still holds.
    /// This is the required path out of `MustAbort`.
    pub fn abort(&self, txn_id: TxnId) -> ReplicaResult<()> {
        let locker = {
            let mut txns = self.txns.lock().expect("txn registry poisoned");
            let state = txns
                .get_mut(&txn_id)
                .ok_or(ReplicaError::EnvironmentFailure(format!(
                    "abort of unknown txn {txn_id}"
                )))?;
            if state.frozen.load(Ordering::Acquire) {
                state.phase = TxnPhase::MustAbort;
                return Err(ReplicaError::UnknownMaster);
            }
            let locker = state.locker;
            txns.remove(&txn_id);
            locker
        };
        self.locks.remove_locker(locker);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Role transition support
    // ------------------------------------------------------------------

    /// Freezes every master transaction. While frozen, commit and abort
    /// fail and the lock set cannot change.
    pub fn freeze_masters(&self) -> usize {
        let txns = self.txns.lock().expect("txn registry poisoned");
        let mut frozen = 0;
        for state in txns.values() {
            if state.kind == TxnKind::Master {
                state.frozen.store(true, Ordering::Release);
                frozen += 1;
            }
        }
        frozen
    }

    /// Converts every frozen master transaction into a replay transaction
    /// of the same id.
    ///
    /// Write locks move to the new replay locker by rewriting owner ids in
    /// the lock table; read locks are released with the abandoned master
    /// shell. The shell is then unfrozen and dropped.
    pub fn convert_masters_to_replay(&self) -> ReplicaResult<ConversionReport> {
        let masters: Vec<(TxnId, LockerId, Arc<AtomicBool>)> = {
            let txns = self.txns.lock().expect("txn registry poisoned");
            txns.iter()
                .filter(|(_, s)| s.kind == TxnKind::Master)
                .map(|(id, s)| (*id, s.locker, Arc::clone(&s.frozen)))
                .collect()
        };

        let mut report = ConversionReport::default();
        for (txn_id, master_locker, frozen) in masters {
            debug_assert!(
                frozen.load(Ordering::Acquire),
                "conversion requires frozen masters"
            );

            // Read locks do not survive the conversion; replay only ever
            // writes.
            for (record, mode) in self.locks.held_records(master_locker) {
                if mode == LockMode::Read {
                    self.locks.release(record, master_locker);
                }
            }

            let replay_locker = self.alloc_locker(LockerFlags::replay());
            let writes = self
                .locks
                .rewrite_owner(master_locker, replay_locker)
                .map_err(ReplicaError::from_lock)?;

            {
                let mut txns = self.txns.lock().expect("txn registry poisoned");
                txns.insert(
                    txn_id,
                    TxnState {
                        locker: replay_locker,
                        kind: TxnKind::Replay,
                        phase: TxnPhase::Active,
                        frozen: Arc::new(AtomicBool::new(false)),
                    },
                );
            }
            // Unfreeze and abort the shell: its locks are gone, so this
            // is pure registry cleanup.
            frozen.store(false, Ordering::Release);
            self.locks.remove_locker(master_locker);

            report.converted += 1;
            report.write_locks_transferred += writes;
        }
        if report.converted > 0 {
            info!(
                converted = report.converted,
                write_locks = report.write_locks_transferred,
                "master txns converted to replay"
            );
        }
        Ok(report)
    }

    /// Aborts every replay transaction. Used on replica→master
    /// transition: in-flight replay txns belong to an obsolete master.
    pub fn abort_all_replay(&self) -> usize {
        let replays: Vec<(TxnId, LockerId)> = {
            let txns = self.txns.lock().expect("txn registry poisoned");
            txns.iter()
                .filter(|(_, s)| s.kind == TxnKind::Replay)
                .map(|(id, s)| (*id, s.locker))
                .collect()
        };
        let aborted = replays.len();
        for (txn_id, locker) in replays {
            self.locks.remove_locker(locker);
            self.txns.lock().expect("txn registry poisoned").remove(&txn_id);
        }
        aborted
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn locker_of(&self, txn_id: TxnId) -> Option<LockerId> {
        let txns = self.txns.lock().expect("txn registry poisoned");
        txns.get(&txn_id).map(|s| s.locker)
    }

    pub fn phase(&self, txn_id: TxnId) -> Option<TxnPhase> {
        let txns = self.txns.lock().expect("txn registry poisoned");
        txns.get(&txn_id).map(|s| s.phase)
    }

    pub fn kind(&self, txn_id: TxnId) -> Option<TxnKind> {
        let txns = self.txns.lock().expect("txn registry poisoned");
        txns.get(&txn_id).map(|s| s.kind)
    }

    pub fn live_count(&self) -> usize {
        self.txns.lock().expect("txn registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use rhyolite_locks::{LockGrant, RecordId};

    use super::*;

    fn manager() -> TxnManager {
        TxnManager::new(Arc::new(LockTable::new()))
    }

    #[test]
    fn begin_replay_is_idempotent_per_id() {
        let m = manager();
        let a = m.begin_replay(TxnId::new(7)).unwrap();
        let b = m.begin_replay(TxnId::new(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.live_count(), 1);
    }

    #[test]
    fn commit_releases_locks_and_forgets_txn() {
        let m = manager();
        let locker = m.begin_replay(TxnId::new(7)).unwrap();
        m.lock_table()
            .lock(RecordId::new(1), locker, LockMode::Write, false, false)
            .unwrap();

        m.commit(TxnId::new(7)).unwrap();
        assert_eq!(m.live_count(), 0);
        assert!(m.lock_table().write_owner(RecordId::new(1)).is_none());
    }

    #[test]
    fn commit_of_preempted_txn_fails_and_requires_abort() {
        let m = manager();
        let victim = m.begin_master(TxnId::new(1)).unwrap();
        let replayer = m.begin_replay(TxnId::new(2)).unwrap();
        m.lock_table()
            .lock(RecordId::new(9), victim, LockMode::Write, false, false)
            .unwrap();

        m.lock_table().steal(RecordId::new(9), replayer).unwrap();
        assert!(matches!(
            m.commit(TxnId::new(1)),
            Err(ReplicaError::Preempted)
        ));
        assert_eq!(m.phase(TxnId::new(1)), Some(TxnPhase::MustAbort));

        // Abort is the required way out.
        m.abort(TxnId::new(1)).unwrap();
        assert_eq!(m.phase(TxnId::new(1)), None);
    }

    #[test]
    fn frozen_txn_rejects_commit_and_abort() {
        let m = manager();
        m.begin_master(TxnId::new(1)).unwrap();
        assert_eq!(m.freeze_masters(), 1);

        assert!(matches!(
            m.commit(TxnId::new(1)),
            Err(ReplicaError::ReplicaWrite)
        ));
        assert_eq!(m.phase(TxnId::new(1)), Some(TxnPhase::MustAbort));
        assert!(matches!(
            m.abort(TxnId::new(1)),
            Err(ReplicaError::UnknownMaster)
        ));
        // Locks survive the refused operations.
        assert_eq!(m.live_count(), 1);
    }

    #[test]
    fn conversion_transfers_write_locks_only() {
        let m = manager();
        let master = m.begin_master(TxnId::new(1)).unwrap();
        m.lock_table()
            .lock(RecordId::new(1), master, LockMode::Write, false, false)
            .unwrap();
        m.lock_table()
            .lock(RecordId::new(2), master, LockMode::Write, false, false)
            .unwrap();
        m.lock_table()
            .lock(RecordId::new(3), master, LockMode::Read, false, false)
            .unwrap();

        m.freeze_masters();
        let report = m.convert_masters_to_replay().unwrap();
        assert_eq!(report.converted, 1);
        assert_eq!(report.write_locks_transferred, 2);

        assert_eq!(m.kind(TxnId::new(1)), Some(TxnKind::Replay));
        let replay_locker = m.locker_of(TxnId::new(1)).unwrap();
        assert_ne!(replay_locker, master);
        assert_eq!(m.lock_table().write_owner(RecordId::new(1)), Some(replay_locker));
        assert_eq!(m.lock_table().write_owner(RecordId::new(2)), Some(replay_locker));
        // The read lock was released with the shell.
        assert!(m.lock_table().owned_mode(RecordId::new(3), replay_locker).is_none());

        // The converted txn commits like any replay txn.
        m.commit(TxnId::new(1)).unwrap();
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn converted_locker_can_be_granted_replay_requests() {
        let m = manager();
        let master = m.begin_master(TxnId::new(1)).unwrap();
        m.lock_table()
            .lock(RecordId::new(1), master, LockMode::Write, false, false)
            .unwrap();
        m.freeze_masters();
        m.convert_masters_to_replay().unwrap();

        let locker = m.locker_of(TxnId::new(1)).unwrap();
        assert_eq!(
            m.lock_table()
                .lock(RecordId::new(1), locker, LockMode::Write, false, false)
                .unwrap(),
            LockGrant::Existing
        );
    }

    #[test]
    fn abort_all_replay_clears_registry() {
        let m = manager();
        for id in 1..=3 {
            let locker = m.begin_replay(TxnId::new(id)).unwrap();
            m.lock_table()
                .lock(RecordId::new(id), locker, LockMode::Write, false, false)
                .unwrap();
        }
        m.begin_master(TxnId::new(100)).unwrap();

        assert_eq!(m.abort_all_replay(), 3);
        assert_eq!(m.live_count(), 1);
        for id in 1..=3u64 {
            assert!(m.lock_table().write_owner(RecordId::new(id)).is_none());
        }
    }

    #[test]
    fn replay_cannot_reuse_master_txn_id() {
        let m = manager();
        m.begin_master(TxnId::new(5)).unwrap();
        assert!(matches!(
            m.begin_replay(TxnId::new(5)),
            Err(ReplicaError::EnvironmentFailure(_))
        ));
    }
}
