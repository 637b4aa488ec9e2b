//! Master↔replica role transitions (C6).
//!
//! A master→replica transition without full recovery freezes every
//! in-flight master transaction, converts each to a replay transaction of
//! the same id (write locks carried across, read locks released with the
//! shell), and wakes anything blocked on master authority. The reverse
//! transition aborts in-flight replay transactions, which belong to a
//! master that no longer exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::info;

use crate::error::{ConsistencyFailure, ReplicaError, ReplicaResult};
use crate::tracker::ConsistencyTracker;
use crate::txn::{ConversionReport, TxnManager};

/// The node's current replication role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Replica,
    Master,
    /// Not serving either role (between loops, or shut down).
    Detached,
}

/// Serializes role changes and converts transactions across them.
pub struct RoleController {
    role: Mutex<Role>,
    /// Wakes threads blocked waiting for master authority.
    authority: Condvar,
    /// Set while a master transfer is handing authority away; new
    /// transaction ends block until it resolves. Any role transition
    /// clears it.
    transfer_blocked: AtomicBool,
    txns: Arc<TxnManager>,
    tracker: Arc<ConsistencyTracker>,
}

impl RoleController {
    pub fn new(txns: Arc<TxnManager>, tracker: Arc<ConsistencyTracker>) -> Self {
        Self {
            role: Mutex::new(Role::Detached),
            authority: Condvar::new(),
            transfer_blocked: AtomicBool::new(false),
            txns,
            tracker,
        }
    }

    /// Blocks new transaction ends for a master transfer.
    pub fn block_txns_for_transfer(&self) {
        self.transfer_blocked.store(true, Ordering::Release);
    }

    pub fn transfer_blocked(&self) -> bool {
        self.transfer_blocked.load(Ordering::Acquire)
    }

    /// Clears transfer state and wakes its latch holders.
    fn clear_transfer(&self) {
        if self.transfer_blocked.swap(false, Ordering::AcqRel) {
            self.authority.notify_all();
        }
    }

    pub fn role(&self) -> Role {
        *self.role.lock().expect("role poisoned")
    }

    /// Marks this node master. Replay transactions from the previous
    /// master are aborted and consistency waiters are released with a
    /// role-change failure: their policies are meaningless on a master.
    pub fn to_master(&self) -> ReplicaResult<usize> {
        let mut role = self.role.lock().expect("role poisoned");
        let aborted = self.txns.abort_all_replay();
        *role = Role::Master;
        self.authority.notify_all();
        drop(role);
        self.clear_transfer();

        self.tracker.force_trip_all(ConsistencyFailure::MasterState);
        info!(aborted_replay_txns = aborted, "node is now master");
        Ok(aborted)
    }

    /// Master→replica transition without full recovery.
    pub fn to_replica(&self) -> ReplicaResult<ConversionReport> {
        let mut role = self.role.lock().expect("role poisoned");
        if *role == Role::Master {
            return Err(ReplicaError::EnvironmentFailure(
                "role transition started while still master".into(),
            ));
        }
        *role = Role::Replica;
        // Threads blocked awaiting authority must re-check and fail.
        self.authority.notify_all();
        drop(role);

        // Freeze first: commit/abort of these transactions now fails and
        // their lock sets cannot change under the rewrite. Pending
        // transfer latches are released before the conversion so nothing
        // blocks on a transfer that will never finish.
        self.txns.freeze_masters();
        self.clear_transfer();
        let report = self.txns.convert_masters_to_replay()?;
        info!(
            converted = report.converted,
            write_locks = report.write_locks_transferred,
            "node is now replica"
        );
        Ok(report)
    }

    /// Leaves both roles, e.g. on node shutdown.
    pub fn detach(&self) {
        let mut role = self.role.lock().expect("role poisoned");
        *role = Role::Detached;
        self.authority.notify_all();
    }

    /// Blocks until this node holds master authority, or fails when the
    /// role settles elsewhere.
    pub fn await_master_authority(&self, timeout: std::time::Duration) -> ReplicaResult<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut role = self.role.lock().expect("role poisoned");
        loop {
            match *role {
                Role::Master => return Ok(()),
                Role::Replica => return Err(ReplicaError::ReplicaWrite),
                Role::Detached => {}
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(ReplicaError::UnknownMaster);
            }
            let (guard, _) = self
                .authority
                .wait_timeout(role, deadline - now)
                .expect("role poisoned");
            role = guard;
        }
    }
}
