//! The replayer stage: applies the ordered stream to storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use rhyolite_locks::LockMode;
use rhyolite_types::{Vlsn, realtime_millis};
use rhyolite_wire::{Entry, Heartbeat, Message};

use crate::channel::NamedChannel;
use crate::error::{ReplicaError, ReplicaResult};
use crate::stats::ReplicaStats;
use crate::store::{DbHandle, ElectionView, ReplayStore, StoreError};
use crate::tracker::ConsistencyTracker;
use crate::txn::TxnManager;

use super::{
    ACK_FLUSH_INTERVAL, AckItem, BoundedQueue, DB_CACHE_CLEAR_OPS, ExitRequest, POP_SLICE,
    PipelineShared, PreprocessPool, PushResult, ReplayContext, record_id_for,
};

/// Upper bound on a single replay lock wait. Conflicts are resolved by
/// stealing, so a wait this long means a wedged local transaction.
const REPLAY_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Acks buffered beyond this count are flushed without waiting for the
/// timer.
const ACK_BATCH_LIMIT: usize = 32;

/// Bounded cache of open DB handles, keyed by db id.
struct DbCache {
    max: usize,
    idle_timeout: Duration,
    map: HashMap<u64, (DbHandle, Instant)>,
}

impl DbCache {
    fn new(max: usize, idle_timeout: Duration) -> Self {
        Self {
            max,
            idle_timeout,
            map: HashMap::new(),
        }
    }

    fn get_or_open(&mut self, store: &dyn ReplayStore, db_id: u64) -> ReplicaResult<DbHandle> {
        let now = Instant::now();
        self.map
            .retain(|_, (_, last_used)| now.duration_since(*last_used) < self.idle_timeout);

        if let Some((handle, last_used)) = self.map.get_mut(&db_id) {
            *last_used = now;
            return Ok(handle.clone());
        }
        if self.map.len() >= self.max {
            // Evict the longest-idle handle to stay within budget.
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(id, _)| *id)
            {
                self.map.remove(&oldest);
            }
        }
        let handle = store.open_db(db_id).map_err(map_store)?;
        self.map.insert(db_id, (handle.clone(), now));
        Ok(handle)
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// The replayer stage.
pub(super) struct Replayer {
    channel: Arc<NamedChannel>,
    store: Arc<dyn ReplayStore>,
    election: Arc<dyn ElectionView>,
    tracker: Arc<ConsistencyTracker>,
    txns: Arc<TxnManager>,
    stats: Arc<ReplicaStats>,
    shared: Arc<PipelineShared>,
    replay_q: Arc<BoundedQueue<Message>>,
    output_q: Arc<BoundedQueue<AckItem>>,
    pool: Option<Arc<PreprocessPool>>,
    master: (rhyolite_types::NodeId, rhyolite_types::MasterTerm),
    /// Highest VLSN applied; the stream must stay strictly above it.
    last_vlsn: Vlsn,
    db_cache: DbCache,
    pending_acks: Vec<AckItem>,
    last_flush: Instant,
    ops: u64,
    #[cfg(feature = "sim")]
    test_delay: Duration,
}

impl Replayer {
    pub(super) fn new(
        ctx: &ReplayContext,
        shared: &Arc<PipelineShared>,
        replay_q: &Arc<BoundedQueue<Message>>,
        output_q: &Arc<BoundedQueue<AckItem>>,
        pool: Option<Arc<PreprocessPool>>,
        start_vlsn: Vlsn,
    ) -> Self {
        Self {
            channel: Arc::clone(&ctx.channel),
            store: Arc::clone(&ctx.store),
            election: Arc::clone(&ctx.election),
            tracker: Arc::clone(&ctx.tracker),
            txns: Arc::clone(&ctx.txns),
            stats: Arc::clone(&ctx.stats),
            shared: Arc::clone(shared),
            replay_q: Arc::clone(replay_q),
            output_q: Arc::clone(output_q),
            pool,
            master: ctx.master,
            last_vlsn: if start_vlsn.is_real() {
                Vlsn::new(start_vlsn.as_u64() - 1)
            } else {
                Vlsn::NULL
            },
            db_cache: DbCache::new(
                ctx.config.replay.max_open_db_handles,
                Duration::from_millis(ctx.config.replay.db_handle_timeout_ms),
            ),
            pending_acks: Vec::new(),
            last_flush: Instant::now(),
            ops: 0,
            #[cfg(feature = "sim")]
            test_delay: Duration::from_millis(ctx.config.replica.test_delay_ms),
        }
    }

    pub(super) fn run(&mut self) -> ReplicaResult<()> {
        let result = self.run_inner();
        self.flush_acks();
        result
    }

    fn run_inner(&mut self) -> ReplicaResult<()> {
        loop {
            match self.shared.exit.get() {
                Some(ExitRequest::Immediate) => {
                    debug!("replayer: immediate exit, abandoning queue");
                    return Ok(());
                }
                Some(ExitRequest::Soft) if self.replay_q.is_empty() => {
                    debug!("replayer: soft exit, queue drained");
                    return Ok(());
                }
                _ => {}
            }

            if self.last_flush.elapsed() >= ACK_FLUSH_INTERVAL {
                self.flush_acks();
            }

            let Some(message) = self.replay_q.pop_wait(POP_SLICE) else {
                continue;
            };

            self.assert_master_in_sync()?;

            match message {
                Message::ShutdownRequest { shutdown_time_ms } => {
                    return Err(self.run_shutdown_protocol(shutdown_time_ms));
                }
                Message::Heartbeat(heartbeat) => self.process_heartbeat(&heartbeat),
                Message::Entry(entry) => self.replay_entry(&entry)?,
                Message::ProtocolError { text } => {
                    return Err(ReplicaError::EnvironmentFailure(format!(
                        "feeder reported protocol error: {text}"
                    )));
                }
                other => {
                    return Err(ReplicaError::EnvironmentFailure(format!(
                        "unexpected {} frame in steady-state stream",
                        other.kind_name()
                    )));
                }
            }

            self.ops += 1;
            if self.ops.is_multiple_of(DB_CACHE_CLEAR_OPS) {
                self.db_cache.clear();
            }
        }
    }

    /// The election layer must still agree this stream's master is the
    /// group's master.
    fn assert_master_in_sync(&self) -> ReplicaResult<()> {
        let (node, term) = self.master;
        if self.election.in_sync(node, term) {
            return Ok(());
        }
        self.election.notify_master_obsolete();
        Err(ReplicaError::MasterObsolete {
            new_master: self.election.current_master().map(|(n, _)| n),
        })
    }

    fn process_heartbeat(&mut self, heartbeat: &Heartbeat) {
        self.stats.inc_heartbeats_seen();
        self.tracker.track_heartbeat(heartbeat, realtime_millis());
        self.push_ack(AckItem::HeartbeatResponse {
            txn_end_vlsn: self.tracker.last_replayed_txn_end_vlsn(),
            heartbeat_id: heartbeat.heartbeat_id,
        });
        // Heartbeat responses carry freshness; don't let them sit.
        self.flush_acks();
    }

    fn replay_entry(&mut self, entry: &Entry) -> ReplicaResult<()> {
        if entry.vlsn <= self.last_vlsn {
            return Err(ReplicaError::EnvironmentFailure(format!(
                "stream order violation: entry {} after {}",
                entry.vlsn, self.last_vlsn
            )));
        }
        self.last_vlsn = entry.vlsn;

        #[cfg(feature = "sim")]
        if !self.test_delay.is_zero() {
            std::thread::sleep(self.test_delay);
        }

        match entry.kind {
            rhyolite_types::EntryKind::Put | rhyolite_types::EntryKind::Delete => {
                self.replay_write(entry)
            }
            rhyolite_types::EntryKind::Commit => self.replay_txn_end(entry, true),
            rhyolite_types::EntryKind::Abort => self.replay_txn_end(entry, false),
        }
    }

    fn replay_write(&mut self, entry: &Entry) -> ReplicaResult<()> {
        let locker = self.txns.begin_replay(entry.txn_id)?;
        let record = self
            .pool
            .as_ref()
            .and_then(|pool| pool.take(entry.vlsn))
            .unwrap_or_else(|| record_id_for(entry.db_id, &entry.key));

        // Replay steals from preemptable local holders inside lock_wait;
        // only a non-preemptable internal operation makes it actually
        // block here.
        self.txns
            .lock_table()
            .lock_wait(record, locker, LockMode::Write, REPLAY_LOCK_TIMEOUT)
            .map_err(ReplicaError::from_lock)?;

        let db = self.db_cache.get_or_open(self.store.as_ref(), entry.db_id)?;
        self.store.apply(&db, entry).map_err(map_store)?;

        self.tracker.track_vlsn(entry.vlsn);
        self.push_ack(AckItem::Ack(entry.txn_id));
        self.stats.inc_entries_replayed();
        Ok(())
    }

    fn replay_txn_end(&mut self, entry: &Entry, is_commit: bool) -> ReplicaResult<()> {
        // A transaction can end without prior writes on this stream.
        self.txns.begin_replay(entry.txn_id)?;

        let db = self.db_cache.get_or_open(self.store.as_ref(), entry.db_id)?;
        self.store.apply(&db, entry).map_err(map_store)?;

        if is_commit {
            self.txns.commit(entry.txn_id)?;
            self.stats.inc_commits_replayed();
        } else {
            self.txns.abort(entry.txn_id)?;
            self.stats.inc_aborts_replayed();
        }

        self.tracker.track_txn_end(entry, realtime_millis());
        self.push_ack(if is_commit && entry.needs_group_ack {
            AckItem::GroupAck(entry.txn_id)
        } else {
            AckItem::Ack(entry.txn_id)
        });
        self.stats.inc_entries_replayed();
        // Commit acks bound the master's durability window; flush now.
        self.flush_acks();
        Ok(())
    }

    /// Master-initiated group shutdown. Ack immediately, keep the channel
    /// from timing out under the checkpoint, stop the daemons, checkpoint
    /// with minimized recovery, and surface the shutdown.
    fn run_shutdown_protocol(&mut self, shutdown_time_ms: u64) -> ReplicaError {
        info!(shutdown_time_ms, "group shutdown requested by master");
        self.push_ack(AckItem::ShutdownResponse);
        self.flush_acks();

        // A long checkpoint must not look like a dead peer.
        let _ = self.channel.set_read_timeout(None);
        if let Some(pool) = &self.pool {
            pool.request_stop();
        }
        if let Err(err) = self.store.checkpoint() {
            warn!(%err, "shutdown checkpoint failed");
        }

        // Let the writer drain the shutdown ack before the loop teardown
        // closes the channel under it.
        let drain_deadline = Instant::now() + Duration::from_secs(5);
        while !self.output_q.is_empty()
            && !self.shared.writer_done.load(Ordering::Acquire)
            && Instant::now() < drain_deadline
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        // Grace for an ack popped but not yet on the wire.
        std::thread::sleep(Duration::from_millis(20));
        ReplicaError::GroupShutdown { shutdown_time_ms }
    }

    fn push_ack(&mut self, ack: AckItem) {
        self.pending_acks.push(ack);
        if self.pending_acks.len() >= ACK_BATCH_LIMIT {
            self.flush_acks();
        }
    }

    /// Moves buffered acks to the output queue. Drops them only when the
    /// writer is gone and the channel is closing anyway.
    fn flush_acks(&mut self) {
        for ack in self.pending_acks.drain(..) {
            let mut item = ack;
            loop {
                match self.output_q.try_push(item) {
                    PushResult::Ok => break,
                    PushResult::Backpressure(returned) => {
                        if self.shared.writer_done.load(Ordering::Acquire)
                            || self.shared.exit.get() == Some(ExitRequest::Immediate)
                        {
                            return;
                        }
                        item = returned;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
        self.last_flush = Instant::now();
    }
}

fn map_store(err: StoreError) -> ReplicaError {
    match err {
        StoreError::DiskLimit(msg) => ReplicaError::DiskLimit(msg),
        StoreError::Failed(msg) => ReplicaError::Store(msg),
    }
}
