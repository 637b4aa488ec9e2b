use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use rhyolite_types::{EntryKind, MasterTerm, TxnId};

use super::*;

fn tracker() -> ConsistencyTracker {
    ConsistencyTracker::new(Arc::new(ReplicaStats::new()))
}

fn commit_entry(vlsn: u64, timestamp_ms: u64) -> Entry {
    Entry {
        vlsn: Vlsn::new(vlsn),
        txn_id: TxnId::new(7),
        db_id: 0,
        kind: EntryKind::Commit,
        dtvlsn: Vlsn::NULL,
        master_term: MasterTerm::new(1),
        timestamp_ms,
        key: Bytes::new(),
        value: Bytes::new(),
        needs_group_ack: false,
    }
}

fn heartbeat(master_now_ms: u64, vlsn: u64, id: u64) -> Heartbeat {
    Heartbeat {
        master_now_ms,
        master_txn_end_vlsn: Vlsn::new(vlsn),
        heartbeat_id: id,
    }
}

#[test]
fn lag_is_unknown_before_first_heartbeat() {
    let t = tracker();
    assert_eq!(t.lag_ms(), LAG_UNKNOWN_MS);
}

#[test]
fn heartbeat_initializes_master_fields() {
    let t = tracker();
    t.track_heartbeat(&heartbeat(1_000, 10, 42), 1_000);
    assert_eq!(t.master_heartbeat_id(), 42);
    assert_ne!(t.lag_ms(), LAG_UNKNOWN_MS);
}

#[test]
fn txn_end_advances_both_watermarks() {
    let t = tracker();
    t.track_heartbeat(&heartbeat(1_000, 10, 1), 1_000);
    t.track_txn_end(&commit_entry(12, 2_000), 2_000);
    assert_eq!(t.last_replayed_vlsn(), Vlsn::new(12));
    assert_eq!(t.last_replayed_txn_end_vlsn(), Vlsn::new(12));
}

#[test]
fn track_vlsn_advances_only_vlsn() {
    let t = tracker();
    t.track_vlsn(Vlsn::new(5));
    assert_eq!(t.last_replayed_vlsn(), Vlsn::new(5));
    assert_eq!(t.last_replayed_txn_end_vlsn(), Vlsn::NULL);
}

#[test]
fn dtvlsn_is_monotone() {
    let t = tracker();
    let mut entry = commit_entry(5, 100);
    entry.dtvlsn = Vlsn::new(4);
    t.track_txn_end(&entry, 100);
    assert_eq!(t.dtvlsn(), Vlsn::new(4));

    // A later entry carrying a smaller DTVLSN must not regress it.
    let mut entry = commit_entry(6, 200);
    entry.dtvlsn = Vlsn::new(3);
    t.track_txn_end(&entry, 200);
    assert_eq!(t.dtvlsn(), Vlsn::new(4));
}

#[test]
fn await_vlsn_returns_immediately_when_satisfied() {
    let t = tracker();
    t.track_vlsn(Vlsn::new(10));
    t.await_vlsn(Vlsn::new(10), Duration::from_millis(1)).unwrap();
    t.await_vlsn(Vlsn::new(3), Duration::from_millis(1)).unwrap();
}

#[test]
fn await_vlsn_blocks_until_replayed() {
    let t = Arc::new(tracker());
    let waiter = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.await_vlsn(Vlsn::new(12), Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(30));
    // An earlier VLSN must not release the waiter.
    t.track_vlsn(Vlsn::new(11));
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    t.track_txn_end(&commit_entry(12, 500), 500);
    waiter.join().unwrap().unwrap();
}

#[test]
fn await_vlsn_times_out() {
    let t = tracker();
    let err = t
        .await_vlsn(Vlsn::new(100), Duration::from_millis(30))
        .unwrap_err();
    assert_eq!(err.kind, ConsistencyFailure::Timeout);
    assert!(!err.node_inactive);
    assert!(matches!(err.policy, ConsistencyPolicy::VlsnBound { .. }));
}

#[test]
fn await_lag_released_by_heartbeat() {
    // A waiter with a 5s permissible lag blocks while lag is ~8s, then a
    // heartbeat drops the lag to ~3s and must release it.
    let stats = Arc::new(ReplicaStats::new());
    let t = Arc::new(ConsistencyTracker::new(Arc::clone(&stats)));

    let now = realtime_millis();
    // Behind in VLSN: lag measures from the master commit time 8s ago.
    t.track_heartbeat(&heartbeat(now.saturating_sub(8_000), 10, 1), now);

    let waiter = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.await_lag(Duration::from_secs(5), Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    // The master moved its high-water mark with a commit 3s ago; lag is
    // now measured from that commit time.
    let now = realtime_millis();
    t.track_heartbeat(&heartbeat(now.saturating_sub(3_000), 11, 2), now);
    waiter.join().unwrap().unwrap();

    assert_eq!(stats.lag_consistency_waits(), 1);
    assert!(stats.lag_consistency_wait_ms() >= 50);
}

#[test]
fn await_lag_satisfied_immediately_when_caught_up() {
    let t = tracker();
    let now = realtime_millis();
    t.track_heartbeat(&heartbeat(now, 10, 1), now);
    t.track_txn_end(&commit_entry(10, now), now);
    t.await_lag(Duration::from_secs(5), Duration::from_millis(1))
        .unwrap();
}

#[test]
fn force_trip_attaches_failure() {
    let t = Arc::new(tracker());
    let waiter = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.await_vlsn(Vlsn::new(50), Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(30));
    t.force_trip_all(ConsistencyFailure::Shutdown);

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind, ConsistencyFailure::Shutdown);
    assert!(err.node_inactive);
}

#[test]
fn waiters_released_in_key_order() {
    let t = Arc::new(tracker());
    let near = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.await_vlsn(Vlsn::new(5), Duration::from_secs(5)))
    };
    let far = {
        let t = Arc::clone(&t);
        thread::spawn(move || t.await_vlsn(Vlsn::new(20), Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(30));

    t.track_vlsn(Vlsn::new(7));
    near.join().unwrap().unwrap();
    assert!(!far.is_finished());

    t.track_vlsn(Vlsn::new(20));
    far.join().unwrap().unwrap();
}
