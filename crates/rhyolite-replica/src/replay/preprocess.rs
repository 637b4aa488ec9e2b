//! Preprocessor pool: CPU-bound entry digestion ahead of the replayer.
//!
//! Write entries can have their record id computed off the critical
//! replay path. The pool is an optimization only: when its inbox is full
//! the task is *discarded* (counted in stats) and the replayer computes
//! the id itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use rhyolite_locks::RecordId;
use rhyolite_types::Vlsn;
use rhyolite_wire::Entry;

use crate::replay::queue::{BoundedQueue, PushResult};
use crate::stats::ReplicaStats;

/// Poll slice for idle pool workers.
const POLL: Duration = Duration::from_millis(20);

/// Derives the lock-table record id for a key. FNV-1a over the db id and
/// the key bytes.
pub fn record_id_for(db_id: u64, key: &[u8]) -> RecordId {
    const FNV_OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

    let mut hash = FNV_OFFSET;
    for byte in db_id.to_le_bytes() {
        hash = (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME);
    }
    for byte in key {
        hash = (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME);
    }
    RecordId::new(hash)
}

struct Task {
    vlsn: Vlsn,
    db_id: u64,
    key: Bytes,
}

/// A small fixed pool digesting write entries ahead of replay.
pub struct PreprocessPool {
    inbox: Arc<BoundedQueue<Task>>,
    results: Arc<Mutex<HashMap<Vlsn, RecordId>>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ReplicaStats>,
}

impl PreprocessPool {
    pub fn new(threads: usize, queue_capacity: usize, stats: Arc<ReplicaStats>) -> Self {
        assert!(threads > 0, "preprocessor pool needs at least one thread");
        let inbox = Arc::new(BoundedQueue::<Task>::new(queue_capacity));
        let results = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let workers = (0..threads)
            .map(|i| {
                let inbox = Arc::clone(&inbox);
                let results = Arc::clone(&results);
                let stop = Arc::clone(&stop);
                thread::Builder::new()
                    .name(format!("replay-preprocess-{i}"))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) {
                            if let Some(task) = inbox.pop_wait(POLL) {
                                let record = record_id_for(task.db_id, &task.key);
                                results
                                    .lock()
                                    .expect("preprocess results poisoned")
                                    .insert(task.vlsn, record);
                            }
                        }
                    })
                    .expect("failed to spawn preprocessor thread")
            })
            .collect();

        Self {
            inbox,
            results,
            stop,
            workers,
            stats,
        }
    }

    /// Offers a write entry to the pool. On a full inbox the task is
    /// discarded: the replayer will do the work inline.
    pub fn submit(&self, entry: &Entry) {
        debug_assert!(entry.is_write());
        let task = Task {
            vlsn: entry.vlsn,
            db_id: entry.db_id,
            key: entry.key.clone(),
        };
        if let PushResult::Backpressure(_) = self.inbox.try_push(task) {
            self.stats.inc_preprocessor_discards();
        }
    }

    /// Takes the precomputed record id for `vlsn`, if the pool got to it.
    pub fn take(&self, vlsn: Vlsn) -> Option<RecordId> {
        self.results
            .lock()
            .expect("preprocess results poisoned")
            .remove(&vlsn)
    }

    /// Asks the workers to stop after their current task.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stops the pool and joins its workers.
    pub fn stop(&mut self) {
        self.request_stop();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("preprocessor pool stopped");
    }
}

impl Drop for PreprocessPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use rhyolite_types::{EntryKind, MasterTerm, TxnId};

    use super::*;

    fn write_entry(vlsn: u64, key: &'static [u8]) -> Entry {
        Entry {
            vlsn: Vlsn::new(vlsn),
            txn_id: TxnId::new(1),
            db_id: 3,
            kind: EntryKind::Put,
            dtvlsn: Vlsn::NULL,
            master_term: MasterTerm::new(1),
            timestamp_ms: 0,
            key: Bytes::from_static(key),
            value: Bytes::from_static(b"v"),
            needs_group_ack: false,
        }
    }

    #[test]
    fn record_id_is_deterministic_and_keyed() {
        assert_eq!(record_id_for(1, b"k"), record_id_for(1, b"k"));
        assert_ne!(record_id_for(1, b"k"), record_id_for(2, b"k"));
        assert_ne!(record_id_for(1, b"k"), record_id_for(1, b"j"));
    }

    #[test]
    fn pool_digests_submitted_entries() {
        let stats = Arc::new(ReplicaStats::new());
        let mut pool = PreprocessPool::new(2, 16, Arc::clone(&stats));
        let entry = write_entry(5, b"alpha");
        pool.submit(&entry);

        // The worker fills the result map shortly after.
        let mut found = None;
        for _ in 0..100 {
            if let Some(record) = pool.take(Vlsn::new(5)) {
                found = Some(record);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(found, Some(record_id_for(3, b"alpha")));
        assert_eq!(stats.preprocessor_discards(), 0);
        pool.stop();
    }

    #[test]
    fn full_inbox_discards_and_counts() {
        let stats = Arc::new(ReplicaStats::new());
        let mut pool = PreprocessPool::new(1, 1, Arc::clone(&stats));
        // Stop the worker so the inbox stays full.
        pool.request_stop();
        thread::sleep(Duration::from_millis(50));

        pool.submit(&write_entry(1, b"a"));
        pool.submit(&write_entry(2, b"b"));
        pool.submit(&write_entry(3, b"c"));
        assert!(stats.preprocessor_discards() >= 1);
        pool.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut pool = PreprocessPool::new(1, 4, Arc::new(ReplicaStats::new()));
        pool.stop();
        pool.stop();
    }
}
