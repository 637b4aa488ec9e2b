//! The striped lock table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::accountant::{
    LOCK_BASE_OVERHEAD, MemoryAccountant, NullAccountant, OWNER_OVERHEAD, WAITER_OVERHEAD,
};
use crate::error::{LockError, LockResult};
use crate::lock::{Lock, LockGrant, LockInfo, LockMode, Waiter};
use crate::locker::{LockerFlags, LockerId, LockerState, RecordId};

/// Default number of stripes. Unrelated records land on different stripes
/// and never contend on a mutex.
const DEFAULT_STRIPES: usize = 64;

/// Slice length for blocking waits, so preemption and shutdown are noticed
/// without a dedicated wakeup channel.
const WAIT_SLICE: Duration = Duration::from_millis(100);

struct Stripe {
    locks: Mutex<HashMap<RecordId, Lock>>,
    cond: Condvar,
}

impl Stripe {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }
}

/// Record-granular readers/writer lock manager with upgrade, promotion,
/// waiters, and preemption.
///
/// See the crate docs for the granting and stealing disciplines.
pub struct LockTable {
    stripes: Vec<Stripe>,
    lockers: RwLock<HashMap<LockerId, Arc<LockerState>>>,
    accountant: Arc<dyn MemoryAccountant>,
    shutdown: AtomicBool,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::with_accountant(DEFAULT_STRIPES, Arc::new(NullAccountant))
    }

    pub fn with_accountant(stripes: usize, accountant: Arc<dyn MemoryAccountant>) -> Self {
        assert!(stripes > 0, "stripe count must be positive");
        Self {
            stripes: (0..stripes).map(|_| Stripe::new()).collect(),
            lockers: RwLock::new(HashMap::new()),
            accountant,
            shutdown: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Locker registry
    // ------------------------------------------------------------------

    /// Registers a locker. Its flags are fixed for its lifetime.
    pub fn register_locker(&self, locker: LockerId, flags: LockerFlags) {
        let mut lockers = self.lockers.write().expect("locker registry poisoned");
        let prev = lockers.insert(locker, Arc::new(LockerState::new(flags)));
        debug_assert!(prev.is_none(), "locker {locker} registered twice");
    }

    /// Removes a locker from the registry. Any remaining holdings are
    /// released first.
    pub fn remove_locker(&self, locker: LockerId) {
        self.release_all(locker);
        let mut lockers = self.lockers.write().expect("locker registry poisoned");
        lockers.remove(&locker);
    }

    /// True once replay has stolen one of this locker's locks. The owning
    /// transaction must abort when it sees this.
    pub fn is_preempted(&self, locker: LockerId) -> bool {
        self.locker_state(locker).is_ok_and(|s| s.is_preempted())
    }

    /// Flags the locker was registered with.
    pub fn locker_flags(&self, locker: LockerId) -> LockResult<LockerFlags> {
        self.locker_state(locker).map(|s| s.flags)
    }

    fn locker_state(&self, locker: LockerId) -> LockResult<Arc<LockerState>> {
        let lockers = self.lockers.read().expect("locker registry poisoned");
        lockers
            .get(&locker)
            .cloned()
            .ok_or(LockError::UnknownLocker(locker))
    }

    /// Locker state looked up while a stripe mutex is held. Lock order is
    /// always stripe → registry, never the reverse.
    fn locker_state_locked(&self, locker: LockerId) -> Option<Arc<LockerState>> {
        let lockers = self.lockers.read().expect("locker registry poisoned");
        lockers.get(&locker).cloned()
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Requests `record` in `mode` for `locker` and returns the resulting
    /// grant state without blocking.
    ///
    /// `WaitNew` appends the locker to the waiter line; `WaitPromotion`
    /// inserts it at the head. With `nonblocking` set, either wait outcome
    /// becomes `Denied` and no waiter is recorded. `jump_waiters` lets the
    /// request bypass the line (used when draining waiters and by replay
    /// after a steal).
    pub fn lock(
        &self,
        record: RecordId,
        locker: LockerId,
        mode: LockMode,
        nonblocking: bool,
        jump_waiters: bool,
    ) -> LockResult<LockGrant> {
        if self.is_shutdown() {
            return Err(LockError::ShuttingDown);
        }
        let state = self.locker_state(locker)?;
        let stripe = self.stripe_for(record);
        let mut locks = stripe.locks.lock().expect("stripe poisoned");
        let grant = self.grant_locked(&mut locks, record, locker, &state, mode, nonblocking, jump_waiters);
        trace!(%record, %locker, ?mode, ?grant, "lock request");
        Ok(grant)
    }

    /// Requests `record` in `mode`, blocking until granted or `timeout`.
    ///
    /// Importunate lockers do not queue behind preemptable owners: a
    /// conflicting request steals first and retries at the head of the
    /// line. Waits end early when the locker is preempted or the table
    /// shuts down.
    pub fn lock_wait(
        &self,
        record: RecordId,
        locker: LockerId,
        mode: LockMode,
        timeout: Duration,
    ) -> LockResult<LockGrant> {
        let state = self.locker_state(locker)?;
        let mut grant = self.lock(record, locker, mode, false, false)?;
        if grant.is_granted() {
            return Ok(grant);
        }

        if state.flags.importunate {
            self.steal(record, locker)?;
            grant = self.lock(record, locker, mode, false, true)?;
            if grant.is_granted() {
                return Ok(grant);
            }
        }

        let converted = if grant == LockGrant::WaitPromotion {
            LockGrant::Promotion
        } else {
            LockGrant::New
        };
        let deadline = Instant::now() + timeout;
        let stripe = self.stripe_for(record);
        let mut locks = stripe.locks.lock().expect("stripe poisoned");
        loop {
            let owned = locks.get(&record).and_then(|l| l.owners.get(locker));
            if owned.is_some_and(|info| info.mode == LockMode::Write || mode == LockMode::Read) {
                return Ok(converted);
            }
            if self.is_shutdown() {
                self.cancel_wait_locked(&mut locks, record, locker);
                return Err(LockError::ShuttingDown);
            }
            if state.is_preempted() {
                self.cancel_wait_locked(&mut locks, record, locker);
                return Err(LockError::Preempted { locker });
            }
            let now = Instant::now();
            if now >= deadline {
                self.cancel_wait_locked(&mut locks, record, locker);
                return Err(LockError::Timeout { record, locker });
            }
            let slice = WAIT_SLICE.min(deadline - now);
            let (guard, _timed_out) = stripe
                .cond
                .wait_timeout(locks, slice)
                .expect("stripe poisoned");
            locks = guard;
        }
    }

    /// Grant core. Runs under the stripe mutex.
    fn grant_locked(
        &self,
        locks: &mut HashMap<RecordId, Lock>,
        record: RecordId,
        locker: LockerId,
        state: &LockerState,
        mode: LockMode,
        nonblocking: bool,
        jump_waiters: bool,
    ) -> LockGrant {
        let flags = state.flags;
        if !locks.contains_key(&record) {
            locks.insert(record, Lock::default());
            self.accountant.add(LOCK_BASE_OVERHEAD);
        }
        let lock = locks.get_mut(&record).expect("just inserted");

        let decision = lock.evaluate(locker, flags, mode, jump_waiters);
        match decision {
            LockGrant::New => {
                self.remove_waiter(lock, locker);
                if !lock.owners.is_empty() {
                    self.accountant.add(OWNER_OVERHEAD);
                }
                lock.owners.push(LockInfo { locker, mode, flags });
                state.held.lock().expect("held set poisoned").insert(record);
                LockGrant::New
            }
            LockGrant::Promotion => {
                self.remove_waiter(lock, locker);
                lock.owners.set_mode(locker, LockMode::Write);
                LockGrant::Promotion
            }
            LockGrant::Existing => LockGrant::Existing,
            wait @ (LockGrant::WaitNew | LockGrant::WaitPromotion) => {
                if nonblocking {
                    self.destroy_if_unused(locks, record);
                    return LockGrant::Denied;
                }
                if lock.waiter_position(locker).is_none() {
                    let waiter = Waiter {
                        locker,
                        mode,
                        flags,
                        promotion: wait == LockGrant::WaitPromotion,
                    };
                    // Promotions go to the head: the promoter already owns
                    // the record in read mode, and every grant behind it
                    // would only widen the deadlock window.
                    if waiter.promotion {
                        lock.waiters.push_front(waiter);
                    } else {
                        lock.waiters.push_back(waiter);
                    }
                    self.accountant.add(WAITER_OVERHEAD);
                }
                wait
            }
            LockGrant::Denied => LockGrant::Denied,
        }
    }

    fn remove_waiter(&self, lock: &mut Lock, locker: LockerId) {
        if let Some(pos) = lock.waiter_position(locker) {
            lock.waiters.remove(pos);
            self.accountant.sub(WAITER_OVERHEAD);
        }
    }

    fn cancel_wait_locked(
        &self,
        locks: &mut HashMap<RecordId, Lock>,
        record: RecordId,
        locker: LockerId,
    ) {
        if let Some(lock) = locks.get_mut(&record) {
            self.remove_waiter(lock, locker);
        }
        self.destroy_if_unused(locks, record);
    }

    fn destroy_if_unused(&self, locks: &mut HashMap<RecordId, Lock>, record: RecordId) {
        if locks.get(&record).is_some_and(Lock::is_unused) {
            locks.remove(&record);
            self.accountant.sub(LOCK_BASE_OVERHEAD);
        }
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Releases `locker`'s holding on `record`.
    ///
    /// Returns `None` when the caller was not an owner. Otherwise drains
    /// the waiter line in order, converting each waiter to an owner until
    /// the first that cannot be granted, and returns the set of lockers
    /// that became owners so the caller can wake them.
    pub fn release(&self, record: RecordId, locker: LockerId) -> Option<HashSet<LockerId>> {
        let stripe = self.stripe_for(record);
        let mut locks = stripe.locks.lock().expect("stripe poisoned");
        let lock = locks.get_mut(&record)?;

        if lock.owners.remove(locker).is_none() {
            // Not an owner. Drop any stale wait entry so a dead locker
            // cannot wedge the line.
            self.remove_waiter(lock, locker);
            self.destroy_if_unused(&mut locks, record);
            return None;
        }
        if !lock.owners.is_empty() {
            self.accountant.sub(OWNER_OVERHEAD);
        }
        if let Some(state) = self.locker_state_locked(locker) {
            state.held.lock().expect("held set poisoned").remove(&record);
        }

        let granted = self.drain_waiters_locked(&mut locks, record);
        self.destroy_if_unused(&mut locks, record);
        stripe.cond.notify_all();
        Some(granted)
    }

    /// Converts queued waiters to owners, in line order, stopping at the
    /// first waiter the grant logic refuses.
    fn drain_waiters_locked(
        &self,
        locks: &mut HashMap<RecordId, Lock>,
        record: RecordId,
    ) -> HashSet<LockerId> {
        let mut granted = HashSet::new();
        loop {
            let (front, decision) = {
                let Some(lock) = locks.get_mut(&record) else {
                    break;
                };
                let Some(front) = lock.waiters.front().copied() else {
                    break;
                };
                let decision = lock.evaluate(front.locker, front.flags, front.mode, true);
                (front, decision)
            };
            if !decision.is_granted() {
                break;
            }
            match self.locker_state_locked(front.locker) {
                Some(state) => {
                    self.grant_locked(locks, record, front.locker, &state, front.mode, false, true);
                    granted.insert(front.locker);
                }
                None => {
                    // Locker vanished while waiting; drop the entry.
                    if let Some(lock) = locks.get_mut(&record) {
                        self.remove_waiter(lock, front.locker);
                    }
                }
            }
        }
        granted
    }

    /// Releases every lock `locker` holds. Returns how many were released.
    pub fn release_all(&self, locker: LockerId) -> usize {
        let Ok(state) = self.locker_state(locker) else {
            return 0;
        };
        let held: Vec<RecordId> = {
            let held = state.held.lock().expect("held set poisoned");
            held.iter().copied().collect()
        };
        let mut released = 0;
        for record in held {
            if self.release(record, locker).is_some() {
                released += 1;
            }
        }
        released
    }

    // ------------------------------------------------------------------
    // Preemption
    // ------------------------------------------------------------------

    /// Steals `record` from its preemptable owners on behalf of the
    /// importunate `for_locker`.
    ///
    /// Owners that are `for_locker` itself are left alone (the caller will
    /// be granted normally). A second importunate owner is a log integrity
    /// violation. Non-preemptable local owners are also left alone; the
    /// caller waits for them. Returns the number of owners preempted.
    pub fn steal(&self, record: RecordId, for_locker: LockerId) -> LockResult<usize> {
        let stripe = self.stripe_for(record);
        let mut locks = stripe.locks.lock().expect("stripe poisoned");
        let Some(lock) = locks.get_mut(&record) else {
            return Ok(0);
        };

        let mut victims = Vec::new();
        for owner in lock.owners.iter() {
            if owner.locker == for_locker {
                continue;
            }
            if owner.flags.importunate {
                return Err(LockError::LogIntegrity(format!(
                    "importunate lockers {for_locker} and {} conflict on record {record}",
                    owner.locker
                )));
            }
            if owner.flags.preemptable {
                victims.push(owner.locker);
            }
        }

        for victim in &victims {
            lock.owners.remove(*victim);
            if !lock.owners.is_empty() {
                self.accountant.sub(OWNER_OVERHEAD);
            }
            if let Some(state) = self.locker_state_locked(*victim) {
                state.mark_preempted();
                state.held.lock().expect("held set poisoned").remove(&record);
            }
            trace!(%record, victim = %victim, %for_locker, "lock stolen");
        }
        self.destroy_if_unused(&mut locks, record);
        stripe.cond.notify_all();
        Ok(victims.len())
    }

    // ------------------------------------------------------------------
    // Demotion and queries
    // ------------------------------------------------------------------

    /// Weakens `locker`'s write holding on `record` to a read. A read
    /// holding is left as is. Returns false when `locker` does not own the
    /// record.
    pub fn demote(&self, record: RecordId, locker: LockerId) -> bool {
        let stripe = self.stripe_for(record);
        let mut locks = stripe.locks.lock().expect("stripe poisoned");
        let Some(lock) = locks.get_mut(&record) else {
            return false;
        };
        match lock.owners.get(locker).map(|info| info.mode) {
            Some(LockMode::Write) => {
                lock.owners.set_mode(locker, LockMode::Read);
                true
            }
            Some(LockMode::Read) => true,
            None => false,
        }
    }

    /// True when `locker` owns `record` in at least `mode`.
    pub fn is_owner(&self, record: RecordId, locker: LockerId, mode: LockMode) -> bool {
        match self.owned_mode(record, locker) {
            Some(LockMode::Write) => true,
            Some(LockMode::Read) => mode == LockMode::Read,
            None => false,
        }
    }

    /// Mode in which `locker` owns `record`, if any.
    pub fn owned_mode(&self, record: RecordId, locker: LockerId) -> Option<LockMode> {
        let stripe = self.stripe_for(record);
        let locks = stripe.locks.lock().expect("stripe poisoned");
        locks
            .get(&record)
            .and_then(|l| l.owners.get(locker))
            .map(|info| info.mode)
    }

    /// The writer of `record`, if it currently has one.
    pub fn write_owner(&self, record: RecordId) -> Option<LockerId> {
        let stripe = self.stripe_for(record);
        let locks = stripe.locks.lock().expect("stripe poisoned");
        locks.get(&record).and_then(|l| {
            l.owners
                .iter()
                .find(|info| info.mode == LockMode::Write)
                .map(|info| info.locker)
        })
    }

    /// Number of owners of `record`. For stats and tests.
    pub fn owner_count(&self, record: RecordId) -> usize {
        let stripe = self.stripe_for(record);
        let locks = stripe.locks.lock().expect("stripe poisoned");
        locks.get(&record).map_or(0, |l| l.owners.len())
    }

    /// Number of queued waiters on `record`. For stats and tests.
    pub fn waiter_count(&self, record: RecordId) -> usize {
        let stripe = self.stripe_for(record);
        let locks = stripe.locks.lock().expect("stripe poisoned");
        locks.get(&record).map_or(0, |l| l.waiters.len())
    }

    /// Records `locker` currently owns, with the mode of each holding.
    pub fn held_records(&self, locker: LockerId) -> Vec<(RecordId, LockMode)> {
        let Ok(state) = self.locker_state(locker) else {
            return Vec::new();
        };
        let held: Vec<RecordId> = {
            let held = state.held.lock().expect("held set poisoned");
            held.iter().copied().collect()
        };
        held.into_iter()
            .filter_map(|record| self.owned_mode(record, locker).map(|mode| (record, mode)))
            .collect()
    }

    /// Position of `locker` in `record`'s waiter line, if queued.
    pub fn waiter_position(&self, record: RecordId, locker: LockerId) -> Option<usize> {
        let stripe = self.stripe_for(record);
        let locks = stripe.locks.lock().expect("stripe poisoned");
        locks.get(&record).and_then(|l| l.waiter_position(locker))
    }

    // ------------------------------------------------------------------
    // Identity rewrite (role transition)
    // ------------------------------------------------------------------

    /// Transfers every lock owned by `from` to `to`, preserving modes.
    ///
    /// Used when a master transaction is converted to a replay transaction
    /// of the same id: ownership moves by rewriting ids inside the table,
    /// with no lock released in between. Returns the number of **write**
    /// locks transferred.
    pub fn rewrite_owner(&self, from: LockerId, to: LockerId) -> LockResult<usize> {
        let from_state = self.locker_state(from)?;
        let to_state = self.locker_state(to)?;
        let held: Vec<RecordId> = {
            let held = from_state.held.lock().expect("held set poisoned");
            held.iter().copied().collect()
        };

        let mut writes = 0;
        for record in held {
            let stripe = self.stripe_for(record);
            let mut locks = stripe.locks.lock().expect("stripe poisoned");
            let Some(lock) = locks.get_mut(&record) else {
                continue;
            };
            if let Some(mode) = lock.owners.rewrite(from, to, to_state.flags) {
                if mode == LockMode::Write {
                    writes += 1;
                }
                from_state
                    .held
                    .lock()
                    .expect("held set poisoned")
                    .remove(&record);
                to_state
                    .held
                    .lock()
                    .expect("held set poisoned")
                    .insert(record);
            }
        }
        Ok(writes)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Trips every blocked wait with [`LockError::ShuttingDown`].
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for stripe in &self.stripes {
            // Acquire-release pairs the flag store with blocked waiters'
            // wakeup check.
            let _guard: MutexGuard<'_, _> = stripe.locks.lock().expect("stripe poisoned");
            stripe.cond.notify_all();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn stripe_for(&self, record: RecordId) -> &Stripe {
        let hash = record.as_u64().wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let idx = (hash >> 32) as usize % self.stripes.len();
        &self.stripes[idx]
    }
}

#[cfg(test)]
mod tests;
