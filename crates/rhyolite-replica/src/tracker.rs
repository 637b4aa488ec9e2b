//! Replica-vs-master consistency tracking (C3).
//!
//! The replayer feeds this tracker as it applies the stream; application
//! threads block here until their declared consistency policy holds.
//! Two ordered latch maps hold the blocked waiters: one keyed by target
//! VLSN, one by permissible lag in milliseconds. Each latch is a one-shot
//! countdown with an optional attached failure, so waiters never outlive
//! a shutdown or role change.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use rhyolite_types::{Vlsn, realtime_millis};
use rhyolite_wire::{Entry, Heartbeat};

use crate::error::{ConsistencyError, ConsistencyFailure, ConsistencyPolicy};
use crate::stats::ReplicaStats;

/// Lag reported before the first heartbeat has been seen.
pub const LAG_UNKNOWN_MS: u64 = u64::MAX;

/// One-shot countdown latch with an optional attached failure.
struct Latch {
    state: Mutex<Option<Option<ConsistencyFailure>>>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn trip(&self, failure: Option<ConsistencyFailure>) {
        let mut state = self.state.lock().expect("latch poisoned");
        if state.is_none() {
            *state = Some(failure);
            self.cond.notify_all();
        }
    }

    /// Blocks until tripped or `timeout`. `Ok(())` means tripped cleanly;
    /// `Err` carries the attached failure or the timeout.
    fn wait(&self, timeout: Duration) -> Result<(), ConsistencyFailure> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("latch poisoned");
        loop {
            if let Some(outcome) = state.as_ref() {
                return match outcome {
                    None => Ok(()),
                    Some(failure) => Err(failure.clone()),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConsistencyFailure::Timeout);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("latch poisoned");
            state = guard;
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Highest VLSN the replayer has applied.
    last_replayed_vlsn: Vlsn,
    /// Highest transaction-end VLSN the replayer has applied.
    last_replayed_txn_end_vlsn: Vlsn,
    /// Group-durable high-water mark, folded in from entries.
    dtvlsn: Vlsn,
    /// Master's transaction-end high-water mark.
    master_txn_end_vlsn: Vlsn,
    /// Master commit time of that high-water mark (ms epoch).
    master_txn_end_time_ms: u64,
    /// Master wall clock from the latest heartbeat (ms epoch).
    master_now_ms: u64,
    /// Id of the latest heartbeat, echoed in responses.
    master_heartbeat_id: u64,
    /// True until the first heartbeat initializes the master fields.
    heartbeat_seen: bool,
}

impl TrackerState {
    /// Current lag against the master, per the tracking fields.
    ///
    /// Behind in VLSN: measured from the master commit time we have not
    /// caught up to. Caught up: measured from the master's clock itself.
    fn lag_ms(&self, now_ms: u64) -> u64 {
        if !self.heartbeat_seen {
            return LAG_UNKNOWN_MS;
        }
        if self.last_replayed_txn_end_vlsn < self.master_txn_end_vlsn {
            now_ms.saturating_sub(self.master_txn_end_time_ms)
        } else {
            now_ms.saturating_sub(self.master_now_ms)
        }
    }
}

/// Tracks replica lag and releases consistency waiters (C3).
pub struct ConsistencyTracker {
    state: Mutex<TrackerState>,
    vlsn_latches: Mutex<BTreeMap<Vlsn, Arc<Latch>>>,
    lag_latches: Mutex<BTreeMap<u64, Arc<Latch>>>,
    stats: Arc<ReplicaStats>,
}

impl ConsistencyTracker {
    pub fn new(stats: Arc<ReplicaStats>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            vlsn_latches: Mutex::new(BTreeMap::new()),
            lag_latches: Mutex::new(BTreeMap::new()),
            stats,
        }
    }

    // ------------------------------------------------------------------
    // Tracking (replayer side)
    // ------------------------------------------------------------------

    /// Folds a heartbeat in and releases lag waiters it satisfies.
    ///
    /// Called when the heartbeat is *dequeued*, not when it is read, so
    /// VLSN and time advance together.
    pub fn track_heartbeat(&self, heartbeat: &Heartbeat, now_ms: u64) {
        let lag = {
            let mut state = self.state.lock().expect("tracker poisoned");
            state.master_now_ms = heartbeat.master_now_ms;
            state.master_heartbeat_id = heartbeat.heartbeat_id;
            if heartbeat.master_txn_end_vlsn > state.master_txn_end_vlsn {
                state.master_txn_end_vlsn = heartbeat.master_txn_end_vlsn;
                // The heartbeat carries no commit time; the master clock
                // bounds it from above.
                state.master_txn_end_time_ms = heartbeat.master_now_ms;
            }
            state.heartbeat_seen = true;
            state.lag_ms(now_ms)
        };
        self.trip_lag_latches(lag);
    }

    /// Records a replayed transaction-end entry and releases waiters on
    /// both maps.
    pub fn track_txn_end(&self, entry: &Entry, now_ms: u64) {
        debug_assert!(entry.is_txn_end());
        let lag = {
            let mut state = self.state.lock().expect("tracker poisoned");
            state.last_replayed_vlsn = entry.vlsn;
            state.last_replayed_txn_end_vlsn = entry.vlsn;
            if entry.dtvlsn.is_real() && entry.dtvlsn > state.dtvlsn {
                state.dtvlsn = entry.dtvlsn;
            }
            // A commit we replayed that the master logged after its last
            // reported high-water mark advances the master fields too:
            // the master is necessarily at least this far along.
            if entry.vlsn > state.master_txn_end_vlsn
                && entry.timestamp_ms >= state.master_now_ms
            {
                state.master_txn_end_vlsn = entry.vlsn;
                state.master_txn_end_time_ms = entry.timestamp_ms;
            }
            state.lag_ms(now_ms)
        };
        self.trip_vlsn_latches(entry.vlsn);
        self.trip_lag_latches(lag);
    }

    /// Records a replayed non-transaction-end entry. Only VLSN waiters
    /// can be released by it.
    pub fn track_vlsn(&self, vlsn: Vlsn) {
        {
            let mut state = self.state.lock().expect("tracker poisoned");
            state.last_replayed_vlsn = vlsn;
        }
        self.trip_vlsn_latches(vlsn);
    }

    fn trip_vlsn_latches(&self, replayed: Vlsn) {
        let mut latches = self.vlsn_latches.lock().expect("latch map poisoned");
        // Keys ≤ the replayed VLSN are satisfied; the map is ordered, so
        // everything past the first unsatisfied key stays.
        while let Some((&key, _)) = latches.first_key_value() {
            if key > replayed {
                break;
            }
            let (_, latch) = latches.pop_first().expect("checked non-empty");
            latch.trip(None);
        }
    }

    fn trip_lag_latches(&self, lag_ms: u64) {
        let mut latches = self.lag_latches.lock().expect("latch map poisoned");
        // A latch keyed by k trips when lag ≤ k: the most permissive keys
        // sit at the top of the map.
        let satisfied = latches.split_off(&lag_ms);
        for latch in satisfied.values() {
            latch.trip(None);
        }
    }

    // ------------------------------------------------------------------
    // Awaiting (application side)
    // ------------------------------------------------------------------

    /// Blocks until the replica has replayed at least `target`.
    pub fn await_vlsn(&self, target: Vlsn, timeout: Duration) -> Result<(), ConsistencyError> {
        let policy = ConsistencyPolicy::VlsnBound { target, timeout };
        let latch = {
            let state = self.state.lock().expect("tracker poisoned");
            if state.last_replayed_vlsn >= target {
                return Ok(());
            }
            let mut latches = self.vlsn_latches.lock().expect("latch map poisoned");
            Arc::clone(latches.entry(target).or_insert_with(Latch::new))
        };

        let started = Instant::now();
        let result = latch.wait(timeout);
        self.stats.inc_vlsn_consistency_waits();
        self.stats
            .add_vlsn_consistency_wait_ms(started.elapsed().as_millis() as u64);
        result.map_err(|kind| self.fail(policy, kind))
    }

    /// Blocks until replica lag is at most `permissible_lag`.
    pub fn await_lag(
        &self,
        permissible_lag: Duration,
        timeout: Duration,
    ) -> Result<(), ConsistencyError> {
        let policy = ConsistencyPolicy::TimeLag {
            permissible_lag,
            timeout,
        };
        let permissible_ms = permissible_lag.as_millis() as u64;
        let latch = {
            let state = self.state.lock().expect("tracker poisoned");
            if state.lag_ms(realtime_millis()) <= permissible_ms {
                return Ok(());
            }
            let mut latches = self.lag_latches.lock().expect("latch map poisoned");
            Arc::clone(latches.entry(permissible_ms).or_insert_with(Latch::new))
        };

        let started = Instant::now();
        let result = latch.wait(timeout);
        self.stats.inc_lag_consistency_waits();
        self.stats
            .add_lag_consistency_wait_ms(started.elapsed().as_millis() as u64);
        result.map_err(|kind| self.fail(policy, kind))
    }

    /// Trips every latch with `failure` attached. Used on shutdown and on
    /// role changes so application threads never block forever.
    pub fn force_trip_all(&self, failure: ConsistencyFailure) {
        debug!(?failure, "tripping all consistency latches");
        let vlsn: Vec<_> = {
            let mut latches = self.vlsn_latches.lock().expect("latch map poisoned");
            std::mem::take(&mut *latches).into_values().collect()
        };
        let lag: Vec<_> = {
            let mut latches = self.lag_latches.lock().expect("latch map poisoned");
            std::mem::take(&mut *latches).into_values().collect()
        };
        for latch in vlsn.into_iter().chain(lag) {
            latch.trip(Some(failure.clone()));
        }
    }

    fn fail(&self, policy: ConsistencyPolicy, kind: ConsistencyFailure) -> ConsistencyError {
        ConsistencyError {
            policy,
            node_inactive: !matches!(kind, ConsistencyFailure::Timeout),
            kind,
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn last_replayed_vlsn(&self) -> Vlsn {
        self.state.lock().expect("tracker poisoned").last_replayed_vlsn
    }

    pub fn last_replayed_txn_end_vlsn(&self) -> Vlsn {
        self.state
            .lock()
            .expect("tracker poisoned")
            .last_replayed_txn_end_vlsn
    }

    /// Group-durable high-water mark observed on the stream.
    pub fn dtvlsn(&self) -> Vlsn {
        self.state.lock().expect("tracker poisoned").dtvlsn
    }

    pub fn master_heartbeat_id(&self) -> u64 {
        self.state.lock().expect("tracker poisoned").master_heartbeat_id
    }

    /// Current lag in milliseconds, [`LAG_UNKNOWN_MS`] before the first
    /// heartbeat.
    pub fn lag_ms(&self) -> u64 {
        self.state
            .lock()
            .expect("tracker poisoned")
            .lag_ms(realtime_millis())
    }
}

#[cfg(test)]
mod tests;
