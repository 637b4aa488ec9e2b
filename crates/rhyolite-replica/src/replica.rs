//! The assembled replica engine.
//!
//! [`Replica`] wires the lock table, transaction registry, consistency
//! tracker, and role controller together, and drives the supervised loop:
//! connect → handshake + sync-up → first heartbeat → replay pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use rhyolite_config::RhyoliteConfig;
use rhyolite_locks::LockTable;
use rhyolite_types::{NodeId, realtime_millis};
use rhyolite_wire::Message;

use crate::channel::NamedChannel;
use crate::error::{ConsistencyFailure, ReplicaError, ReplicaResult};
use crate::replay::{ReplayContext, run_pipeline};
use crate::stats::ReplicaStats;
use crate::store::{ElectionView, LogScanner, ReplayStore};
use crate::supervisor::{LoopEntry, SupervisorExit, run_supervised};
use crate::syncup::{HandshakeIdentity, run_syncup};
use crate::tracker::ConsistencyTracker;
use crate::transition::RoleController;
use crate::txn::TxnManager;

/// One replica node's replay engine.
pub struct Replica {
    config: RhyoliteConfig,
    node_id: NodeId,
    store: Arc<dyn ReplayStore>,
    scanner: Arc<dyn LogScanner>,
    election: Arc<dyn ElectionView>,
    locks: Arc<LockTable>,
    txns: Arc<TxnManager>,
    tracker: Arc<ConsistencyTracker>,
    stats: Arc<ReplicaStats>,
    roles: Arc<RoleController>,
    shutdown: AtomicBool,
    /// Channel of the live loop entry, closed by `shutdown`.
    channel: Mutex<Option<Arc<NamedChannel>>>,
    /// Released once the first heartbeat after sync-up has been seen.
    ready: (Mutex<bool>, Condvar),
    #[cfg(feature = "sim")]
    test_delay_ms: std::sync::atomic::AtomicU64,
    #[cfg(feature = "sim")]
    dont_process_stream: Arc<AtomicBool>,
}

impl Replica {
    pub fn new(
        config: RhyoliteConfig,
        node_id: NodeId,
        store: Arc<dyn ReplayStore>,
        scanner: Arc<dyn LogScanner>,
        election: Arc<dyn ElectionView>,
    ) -> Self {
        let stats = Arc::new(ReplicaStats::new());
        let locks = Arc::new(LockTable::new());
        let txns = Arc::new(TxnManager::with_stats(
            Arc::clone(&locks),
            Arc::clone(&stats),
        ));
        let tracker = Arc::new(ConsistencyTracker::new(Arc::clone(&stats)));
        let roles = Arc::new(RoleController::new(
            Arc::clone(&txns),
            Arc::clone(&tracker),
        ));
        Self {
            config,
            node_id,
            store,
            scanner,
            election,
            locks,
            txns,
            tracker,
            stats,
            roles,
            shutdown: AtomicBool::new(false),
            channel: Mutex::new(None),
            ready: (Mutex::new(false), Condvar::new()),
            #[cfg(feature = "sim")]
            test_delay_ms: std::sync::atomic::AtomicU64::new(0),
            #[cfg(feature = "sim")]
            dont_process_stream: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> &Arc<ReplicaStats> {
        &self.stats
    }

    pub fn tracker(&self) -> &Arc<ConsistencyTracker> {
        &self.tracker
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn txns(&self) -> &Arc<TxnManager> {
        &self.txns
    }

    pub fn roles(&self) -> &Arc<RoleController> {
        &self.roles
    }

    /// Runs the supervised replica loop until shutdown or a terminal
    /// failure. `connect` dials the current master; `hold_election` is
    /// invoked when sync-up demands a hard rollback.
    pub fn run<C, E>(&self, mut connect: C, hold_election: E) -> SupervisorExit
    where
        C: FnMut() -> ReplicaResult<NamedChannel>,
        E: FnMut() -> ReplicaResult<()>,
    {
        let exit = run_supervised(
            |entry| self.run_once(&mut connect, entry),
            &self.shutdown,
            hold_election,
        );
        self.roles.detach();
        exit
    }

    /// One entry of the replica loop.
    fn run_once<C>(&self, connect: &mut C, entry: LoopEntry) -> ReplicaResult<()>
    where
        C: FnMut() -> ReplicaResult<NamedChannel>,
    {
        let channel = Arc::new(connect()?);
        *self.channel.lock().expect("channel slot poisoned") = Some(Arc::clone(&channel));
        let result = self.serve_stream(&channel, entry);
        *self.channel.lock().expect("channel slot poisoned") = None;
        channel.close();
        result
    }

    fn serve_stream(&self, channel: &Arc<NamedChannel>, entry: LoopEntry) -> ReplicaResult<()> {
        let identity = HandshakeIdentity {
            node_name: self.config.node.name.clone(),
            node_id: self.node_id,
            group_name: self.config.node.group.clone(),
        };
        let outcome = run_syncup(
            channel,
            self.scanner.as_ref(),
            self.store.as_ref(),
            &identity,
            entry.election_confirmed,
        )?;

        // First heartbeat initializes the tracker and releases waiters on
        // the ready latch.
        channel.set_read_timeout(Some(Duration::from_millis(
            self.config.replica.pre_heartbeat_timeout_ms,
        )))?;
        match channel.read_message()? {
            Message::Heartbeat(heartbeat) => {
                self.stats.inc_heartbeats_seen();
                self.tracker.track_heartbeat(&heartbeat, realtime_millis());
            }
            other => {
                return Err(ReplicaError::EnvironmentFailure(format!(
                    "expected first heartbeat, got {} frame",
                    other.kind_name()
                )));
            }
        }
        self.mark_ready();

        let master = self
            .election
            .current_master()
            .ok_or(ReplicaError::UnknownMaster)?;
        info!(
            channel = %channel.name(),
            master = %master.0,
            term = %master.1,
            start = %outcome.start_vlsn,
            "stream established"
        );

        #[cfg_attr(not(feature = "sim"), allow(unused_mut))]
        let mut config = self.config.clone();
        #[cfg(feature = "sim")]
        {
            config.replica.test_delay_ms = self.test_delay_ms.load(Ordering::Acquire);
        }

        let ctx = ReplayContext {
            channel: Arc::clone(channel),
            store: Arc::clone(&self.store),
            election: Arc::clone(&self.election),
            tracker: Arc::clone(&self.tracker),
            txns: Arc::clone(&self.txns),
            stats: Arc::clone(&self.stats),
            config,
            master,
            #[cfg(feature = "sim")]
            dont_process_stream: Arc::clone(&self.dont_process_stream),
        };
        run_pipeline(&ctx, outcome.start_vlsn)
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Stops the engine: closes the live channel, trips consistency
    /// waiters, and unblocks lock waits. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("replica shutdown requested");
        if let Some(channel) = self.channel.lock().expect("channel slot poisoned").as_ref() {
            channel.close();
        }
        self.tracker.force_trip_all(ConsistencyFailure::Shutdown);
        self.locks.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Blocks until the first heartbeat after sync-up, i.e. until reads
    /// under a consistency policy make sense. False on timeout.
    pub fn await_ready(&self, timeout: Duration) -> bool {
        let (flag, cond) = &self.ready;
        let deadline = std::time::Instant::now() + timeout;
        let mut ready = flag.lock().expect("ready latch poisoned");
        while !*ready {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cond
                .wait_timeout(ready, deadline - now)
                .expect("ready latch poisoned");
            ready = guard;
        }
        true
    }

    fn mark_ready(&self) {
        let (flag, cond) = &self.ready;
        *flag.lock().expect("ready latch poisoned") = true;
        cond.notify_all();
    }

    // ------------------------------------------------------------------
    // Test instrumentation (sim builds only)
    // ------------------------------------------------------------------

    /// Artificial per-message replay delay.
    #[cfg(feature = "sim")]
    pub fn set_test_delay_ms(&self, delay_ms: u64) {
        self.test_delay_ms.store(delay_ms, Ordering::Release);
    }

    /// Simulates a partition: the stream is read but not processed.
    #[cfg(feature = "sim")]
    pub fn set_dont_process_stream(&self, value: bool) {
        self.dont_process_stream.store(value, Ordering::Release);
    }
}
