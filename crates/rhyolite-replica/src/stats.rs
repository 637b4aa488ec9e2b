//! Replay statistics.
//!
//! Thread-safe atomic counters, cheap enough to leave on in production.
//! Export backends are a collaborator's concern; this struct is the single
//! place the engine records into.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one replica's replay engine.
#[derive(Debug, Default)]
pub struct ReplicaStats {
    /// Messages enqueued onto the replay queue.
    messages_queued: AtomicU64,
    /// Entries applied by the replayer.
    entries_replayed: AtomicU64,
    /// Transaction commits replayed.
    commits_replayed: AtomicU64,
    /// Transaction aborts replayed.
    aborts_replayed: AtomicU64,
    /// Heartbeats observed in the stream.
    heartbeats_seen: AtomicU64,
    /// Simple acks sent.
    acks_sent: AtomicU64,
    /// Group-durability acks sent.
    group_acks_sent: AtomicU64,
    /// Offer retries caused by a full replay queue.
    queue_overflows: AtomicU64,
    /// Preprocessor tasks shed because the pool's inbox was full.
    preprocessor_discards: AtomicU64,
    /// Completed waits under a time-lag policy.
    lag_consistency_waits: AtomicU64,
    /// Total milliseconds spent in time-lag waits.
    lag_consistency_wait_ms: AtomicU64,
    /// Completed waits under a VLSN policy.
    vlsn_consistency_waits: AtomicU64,
    /// Total milliseconds spent in VLSN waits.
    vlsn_consistency_wait_ms: AtomicU64,
    /// Local transactions preempted by replay.
    preemptions: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl ReplicaStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_messages_queued, messages_queued, messages_queued);
    counter!(inc_entries_replayed, entries_replayed, entries_replayed);
    counter!(inc_commits_replayed, commits_replayed, commits_replayed);
    counter!(inc_aborts_replayed, aborts_replayed, aborts_replayed);
    counter!(inc_heartbeats_seen, heartbeats_seen, heartbeats_seen);
    counter!(inc_acks_sent, acks_sent, acks_sent);
    counter!(inc_group_acks_sent, group_acks_sent, group_acks_sent);
    counter!(inc_queue_overflows, queue_overflows, queue_overflows);
    counter!(
        inc_preprocessor_discards,
        preprocessor_discards,
        preprocessor_discards
    );
    counter!(
        inc_lag_consistency_waits,
        lag_consistency_waits,
        lag_consistency_waits
    );
    counter!(
        inc_vlsn_consistency_waits,
        vlsn_consistency_waits,
        vlsn_consistency_waits
    );
    counter!(inc_preemptions, preemptions, preemptions);

    pub fn add_lag_consistency_wait_ms(&self, ms: u64) {
        self.lag_consistency_wait_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn lag_consistency_wait_ms(&self) -> u64 {
        self.lag_consistency_wait_ms.load(Ordering::Relaxed)
    }

    pub fn add_vlsn_consistency_wait_ms(&self, ms: u64) {
        self.vlsn_consistency_wait_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn vlsn_consistency_wait_ms(&self) -> u64 {
        self.vlsn_consistency_wait_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = ReplicaStats::new();
        stats.inc_acks_sent();
        stats.inc_acks_sent();
        stats.inc_queue_overflows();
        stats.add_lag_consistency_wait_ms(120);
        assert_eq!(stats.acks_sent(), 2);
        assert_eq!(stats.queue_overflows(), 1);
        assert_eq!(stats.lag_consistency_wait_ms(), 120);
        assert_eq!(stats.entries_replayed(), 0);
    }
}
