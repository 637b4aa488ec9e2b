use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::*;
use crate::accountant::CountingAccountant;

fn table() -> LockTable {
    LockTable::new()
}

fn rec(id: u64) -> RecordId {
    RecordId::new(id)
}

fn local(table: &LockTable, id: u64) -> LockerId {
    let locker = LockerId::new(id);
    table.register_locker(locker, LockerFlags::local());
    locker
}

fn replay(table: &LockTable, id: u64) -> LockerId {
    let locker = LockerId::new(id);
    table.register_locker(locker, LockerFlags::replay());
    locker
}

#[test]
fn first_request_is_new() {
    let t = table();
    let a = local(&t, 1);
    let grant = t.lock(rec(1), a, LockMode::Write, false, false).unwrap();
    assert_eq!(grant, LockGrant::New);
    assert_eq!(t.owned_mode(rec(1), a), Some(LockMode::Write));
    assert_eq!(t.write_owner(rec(1)), Some(a));
}

#[test]
fn repeat_request_is_existing() {
    let t = table();
    let a = local(&t, 1);
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    let grant = t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    assert_eq!(grant, LockGrant::Existing);
    assert_eq!(t.owner_count(rec(1)), 1);
}

#[test]
fn readers_coexist() {
    let t = table();
    let a = local(&t, 1);
    let b = local(&t, 2);
    assert_eq!(t.lock(rec(1), a, LockMode::Read, false, false).unwrap(), LockGrant::New);
    assert_eq!(t.lock(rec(1), b, LockMode::Read, false, false).unwrap(), LockGrant::New);
    assert_eq!(t.owner_count(rec(1)), 2);
}

#[test]
fn writer_conflicts_with_reader() {
    let t = table();
    let a = local(&t, 1);
    let b = local(&t, 2);
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    let grant = t.lock(rec(1), b, LockMode::Write, false, false).unwrap();
    assert_eq!(grant, LockGrant::WaitNew);
    assert_eq!(t.waiter_count(rec(1)), 1);
}

#[test]
fn nonblocking_conflict_is_denied_without_queueing() {
    let t = table();
    let a = local(&t, 1);
    let b = local(&t, 2);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();
    let grant = t.lock(rec(1), b, LockMode::Read, true, false).unwrap();
    assert_eq!(grant, LockGrant::Denied);
    assert_eq!(t.waiter_count(rec(1)), 0);
}

#[test]
fn uncontended_upgrade_is_promotion() {
    let t = table();
    let a = local(&t, 1);
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    let grant = t.lock(rec(1), a, LockMode::Write, false, false).unwrap();
    assert_eq!(grant, LockGrant::Promotion);
    assert_eq!(t.owned_mode(rec(1), a), Some(LockMode::Write));
}

#[test]
fn contended_upgrade_waits_at_head_of_line() {
    // Scenario: A and B hold read; A wants write. A's promotion must wait
    // (B conflicts) and must sit ahead of C, which queued earlier for a
    // new write lock.
    let t = table();
    let a = local(&t, 1);
    let b = local(&t, 2);
    let c = local(&t, 3);
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    t.lock(rec(1), b, LockMode::Read, false, false).unwrap();

    assert_eq!(
        t.lock(rec(1), c, LockMode::Write, false, false).unwrap(),
        LockGrant::WaitNew
    );
    assert_eq!(
        t.lock(rec(1), a, LockMode::Write, false, false).unwrap(),
        LockGrant::WaitPromotion
    );
    assert_eq!(t.waiter_position(rec(1), a), Some(0));
    assert_eq!(t.waiter_position(rec(1), c), Some(1));
}

#[test]
fn release_grants_pending_promotion() {
    // Continuation of the promotion scenario: when B releases, A must be
    // granted its promotion, and the release must report A.
    let t = table();
    let a = local(&t, 1);
    let b = local(&t, 2);
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    t.lock(rec(1), b, LockMode::Read, false, false).unwrap();
    assert_eq!(
        t.lock(rec(1), a, LockMode::Write, false, false).unwrap(),
        LockGrant::WaitPromotion
    );

    let granted = t.release(rec(1), b).expect("b was an owner");
    assert!(granted.contains(&a));
    assert_eq!(granted.len(), 1);
    assert_eq!(t.owned_mode(rec(1), a), Some(LockMode::Write));
    assert_eq!(t.waiter_count(rec(1)), 0);
}

#[test]
fn release_by_non_owner_returns_none() {
    let t = table();
    let a = local(&t, 1);
    let b = local(&t, 2);
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    assert!(t.release(rec(1), b).is_none());
    assert!(t.release(rec(99), a).is_none());
}

#[test]
fn release_drains_waiters_in_order_until_conflict() {
    // Line: writer W, then readers R1 R2. Releasing the owner grants only
    // W; the readers stay queued behind the new writer.
    let t = table();
    let owner = local(&t, 1);
    let w = local(&t, 2);
    let r1 = local(&t, 3);
    let r2 = local(&t, 4);
    t.lock(rec(1), owner, LockMode::Write, false, false).unwrap();
    t.lock(rec(1), w, LockMode::Write, false, false).unwrap();
    t.lock(rec(1), r1, LockMode::Read, false, false).unwrap();
    t.lock(rec(1), r2, LockMode::Read, false, false).unwrap();

    let granted = t.release(rec(1), owner).unwrap();
    assert_eq!(granted.len(), 1);
    assert!(granted.contains(&w));
    assert_eq!(t.waiter_count(rec(1)), 2);

    // Releasing the writer grants both queued readers at once.
    let granted = t.release(rec(1), w).unwrap();
    assert_eq!(granted.len(), 2);
    assert!(granted.contains(&r1) && granted.contains(&r2));
    assert_eq!(t.owner_count(rec(1)), 2);
}

#[test]
fn granted_sets_across_releases_cover_all_waiters() {
    // Round-trip of the release contract: every waiter that is eventually
    // granted appears in exactly one release's return set.
    let t = table();
    let owner = local(&t, 1);
    t.lock(rec(1), owner, LockMode::Write, false, false).unwrap();

    let waiters: Vec<LockerId> = (2..8).map(|id| local(&t, id)).collect();
    for w in &waiters {
        assert_eq!(
            t.lock(rec(1), *w, LockMode::Write, false, false).unwrap(),
            LockGrant::WaitNew
        );
    }

    let mut seen = HashSet::new();
    let mut current = owner;
    loop {
        let granted = t.release(rec(1), current).unwrap();
        assert!(granted.len() <= 1, "exclusive grants come one at a time");
        match granted.into_iter().next() {
            Some(next) => {
                assert!(seen.insert(next), "waiter granted twice");
                current = next;
            }
            None => break,
        }
    }
    assert_eq!(seen.len(), waiters.len());
}

#[test]
fn share_group_members_do_not_conflict() {
    let t = table();
    let txn = LockerId::new(1);
    let cursor = LockerId::new(2);
    let flags = LockerFlags {
        importunate: false,
        preemptable: true,
        share_group: Some(77),
    };
    t.register_locker(txn, flags);
    t.register_locker(cursor, flags);

    assert_eq!(t.lock(rec(1), txn, LockMode::Write, false, false).unwrap(), LockGrant::New);
    assert_eq!(
        t.lock(rec(1), cursor, LockMode::Read, false, false).unwrap(),
        LockGrant::New
    );
    assert_eq!(t.owner_count(rec(1)), 2);
}

#[test]
fn steal_preempts_preemptable_owner() {
    // Scenario: local A holds write; replay R steals, A is preempted and
    // gone from the owner set, R acquires.
    let t = table();
    let a = local(&t, 1);
    let r = replay(&t, 2);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();

    let stolen = t.steal(rec(1), r).unwrap();
    assert_eq!(stolen, 1);
    assert!(t.owned_mode(rec(1), a).is_none());
    assert!(t.is_preempted(a));

    let grant = t.lock(rec(1), r, LockMode::Write, false, true).unwrap();
    assert_eq!(grant, LockGrant::New);
    assert_eq!(t.write_owner(rec(1)), Some(r));
}

#[test]
fn steal_via_lock_wait() {
    let t = table();
    let a = local(&t, 1);
    let r = replay(&t, 2);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();

    let grant = t
        .lock_wait(rec(1), r, LockMode::Write, Duration::from_secs(1))
        .unwrap();
    assert_eq!(grant, LockGrant::New);
    assert!(t.is_preempted(a));
    assert_eq!(t.write_owner(rec(1)), Some(r));
}

#[test]
fn steal_ignores_requester_itself() {
    let t = table();
    let r = replay(&t, 1);
    t.lock(rec(1), r, LockMode::Write, false, false).unwrap();
    assert_eq!(t.steal(rec(1), r).unwrap(), 0);
    assert_eq!(t.write_owner(rec(1)), Some(r));
}

#[test]
fn steal_from_importunate_owner_is_log_integrity() {
    // Two replay lockers conflicting means the master stream itself is
    // inconsistent.
    let t = table();
    let r1 = replay(&t, 1);
    let r2 = replay(&t, 2);
    t.lock(rec(1), r1, LockMode::Write, false, false).unwrap();
    assert!(matches!(
        t.steal(rec(1), r2),
        Err(LockError::LogIntegrity(_))
    ));
    // The owner set is untouched by the failed steal.
    assert_eq!(t.write_owner(rec(1)), Some(r1));
}

#[test]
fn steal_leaves_non_preemptable_owner() {
    let t = table();
    let internal = LockerId::new(1);
    t.register_locker(
        internal,
        LockerFlags {
            importunate: false,
            preemptable: false,
            share_group: None,
        },
    );
    let r = replay(&t, 2);
    t.lock(rec(1), internal, LockMode::Write, false, false).unwrap();

    assert_eq!(t.steal(rec(1), r).unwrap(), 0);
    assert_eq!(t.write_owner(rec(1)), Some(internal));
    assert!(!t.is_preempted(internal));
}

#[test]
fn demote_weakens_write_to_read() {
    let t = table();
    let a = local(&t, 1);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();
    assert!(t.demote(rec(1), a));
    assert_eq!(t.owned_mode(rec(1), a), Some(LockMode::Read));

    // Demote of a read holding is a no-op, and re-requesting read is
    // Existing with no state change.
    assert!(t.demote(rec(1), a));
    assert_eq!(
        t.lock(rec(1), a, LockMode::Read, false, false).unwrap(),
        LockGrant::Existing
    );
    assert_eq!(t.owned_mode(rec(1), a), Some(LockMode::Read));
    assert!(!t.demote(rec(2), a));
}

#[test]
fn blocking_wait_granted_on_release() {
    let t = Arc::new(table());
    let a = local(&t, 1);
    let b = local(&t, 2);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();

    let t2 = Arc::clone(&t);
    let handle = thread::spawn(move || t2.lock_wait(rec(1), b, LockMode::Write, Duration::from_secs(5)));

    // Give the waiter time to queue, then release.
    while t.waiter_count(rec(1)) == 0 {
        thread::yield_now();
    }
    let granted = t.release(rec(1), a).unwrap();
    assert!(granted.contains(&b));

    let grant = handle.join().unwrap().unwrap();
    assert_eq!(grant, LockGrant::New);
    assert_eq!(t.write_owner(rec(1)), Some(b));
}

#[test]
fn blocking_wait_times_out() {
    let t = table();
    let a = local(&t, 1);
    let b = local(&t, 2);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();

    let err = t
        .lock_wait(rec(1), b, LockMode::Write, Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));
    // The timed-out waiter left the line.
    assert_eq!(t.waiter_count(rec(1)), 0);
}

#[test]
fn shutdown_trips_blocked_waiters() {
    let t = Arc::new(table());
    let a = local(&t, 1);
    let b = local(&t, 2);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();

    let t2 = Arc::clone(&t);
    let handle = thread::spawn(move || t2.lock_wait(rec(1), b, LockMode::Write, Duration::from_secs(30)));
    while t.waiter_count(rec(1)) == 0 {
        thread::yield_now();
    }
    t.shutdown();
    assert!(matches!(
        handle.join().unwrap(),
        Err(LockError::ShuttingDown)
    ));
}

#[test]
fn shutdown_is_idempotent() {
    let t = table();
    t.shutdown();
    t.shutdown();
    assert!(t.is_shutdown());
}

#[test]
fn release_all_returns_count() {
    let t = table();
    let a = local(&t, 1);
    for id in 0..5 {
        t.lock(rec(id), a, LockMode::Write, false, false).unwrap();
    }
    assert_eq!(t.release_all(a), 5);
    for id in 0..5 {
        assert!(t.owned_mode(rec(id), a).is_none());
    }
}

#[test]
fn rewrite_owner_transfers_write_locks() {
    // Master→replica conversion: the count of transferred write locks must
    // equal the write locks the master txn held.
    let t = table();
    let master = local(&t, 1);
    let replay_twin = replay(&t, 2);
    t.lock(rec(1), master, LockMode::Write, false, false).unwrap();
    t.lock(rec(2), master, LockMode::Write, false, false).unwrap();
    t.lock(rec(3), master, LockMode::Read, false, false).unwrap();

    let writes = t.rewrite_owner(master, replay_twin).unwrap();
    assert_eq!(writes, 2);
    assert_eq!(t.write_owner(rec(1)), Some(replay_twin));
    assert_eq!(t.write_owner(rec(2)), Some(replay_twin));
    assert_eq!(t.owned_mode(rec(3), replay_twin), Some(LockMode::Read));
    assert!(t.owned_mode(rec(1), master).is_none());
    assert_eq!(t.release_all(master), 0);
    assert_eq!(t.release_all(replay_twin), 3);
}

#[test]
fn accounting_balances_after_full_churn() {
    let acct = Arc::new(CountingAccountant::new());
    let t = LockTable::with_accountant(8, Arc::clone(&acct) as Arc<dyn MemoryAccountant>);
    let a = LockerId::new(1);
    let b = LockerId::new(2);
    t.register_locker(a, LockerFlags::local());
    t.register_locker(b, LockerFlags::local());

    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();
    t.lock(rec(1), b, LockMode::Write, false, false).unwrap();
    assert!(acct.bytes() > 0);

    t.release(rec(1), a).unwrap();
    t.release(rec(1), b).unwrap();
    assert_eq!(acct.bytes(), 0, "all overhead returned after churn");
}

#[test]
fn preempted_flag_trips_blocked_victim() {
    // A waits on record 2 while holding record 1. Replay steals record 1;
    // A's wait on record 2 must fail with Preempted promptly.
    let t = Arc::new(table());
    let a = local(&t, 1);
    let other = local(&t, 2);
    let r = replay(&t, 3);
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();
    t.lock(rec(2), other, LockMode::Write, false, false).unwrap();

    let t2 = Arc::clone(&t);
    let handle = thread::spawn(move || t2.lock_wait(rec(2), a, LockMode::Write, Duration::from_secs(30)));
    while t.waiter_count(rec(2)) == 0 {
        thread::yield_now();
    }

    t.steal(rec(1), r).unwrap();
    assert!(matches!(
        handle.join().unwrap(),
        Err(LockError::Preempted { .. })
    ));
}

#[test]
fn owner_uniqueness_is_preserved() {
    let t = table();
    let a = local(&t, 1);
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    t.lock(rec(1), a, LockMode::Read, false, false).unwrap();
    t.lock(rec(1), a, LockMode::Write, false, false).unwrap();
    assert_eq!(t.owner_count(rec(1)), 1);
}

#[test]
fn unknown_locker_is_rejected() {
    let t = table();
    assert!(matches!(
        t.lock(rec(1), LockerId::new(9), LockMode::Read, false, false),
        Err(LockError::UnknownLocker(_))
    ));
}

#[test]
fn concurrent_disjoint_records_do_not_interfere() {
    let t = Arc::new(table());
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for i in 0..4u64 {
        let t = Arc::clone(&t);
        let stop = Arc::clone(&stop);
        let locker = local(&t, i + 1);
        handles.push(thread::spawn(move || {
            let mut ops = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let record = rec(i * 1000 + ops % 10);
                let grant = t.lock(record, locker, LockMode::Write, false, false).unwrap();
                assert!(grant.is_granted());
                t.release(record, locker).unwrap();
                ops += 1;
            }
            ops
        }));
    }
    thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        assert!(handle.join().unwrap() > 0);
    }
}

mod properties {
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        Lock { record: u64, locker: u64, write: bool },
        Release { record: u64, locker: u64 },
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..4, 0u64..6, any::<bool>())
                .prop_map(|(record, locker, write)| Op::Lock { record, locker, write }),
            (0u64..4, 0u64..6).prop_map(|(record, locker)| Op::Release { record, locker }),
        ]
    }

    proptest! {
        /// Invariants over arbitrary lock/release interleavings:
        /// owners are at most one writer or any number of readers, a
        /// locker appears at most once per record, and promotion waiters
        /// never sit behind earlier new-lock waiters.
        #[test]
        fn owner_set_shape_holds(ops in proptest::collection::vec(arb_op(), 1..60)) {
            let t = LockTable::new();
            for id in 0..6u64 {
                t.register_locker(LockerId::new(id), LockerFlags::local());
            }

            for op in ops {
                match op {
                    Op::Lock { record, locker, write } => {
                        let mode = if write { LockMode::Write } else { LockMode::Read };
                        let _ = t.lock(RecordId::new(record), LockerId::new(locker), mode, false, false);
                    }
                    Op::Release { record, locker } => {
                        let _ = t.release(RecordId::new(record), LockerId::new(locker));
                    }
                }

                for record in 0..4u64 {
                    let record = RecordId::new(record);
                    let owners = t.owner_count(record);
                    if t.write_owner(record).is_some() {
                        prop_assert_eq!(owners, 1, "writer must be alone");
                    }
                    let mut seen = 0;
                    for locker in 0..6u64 {
                        if t.owned_mode(record, LockerId::new(locker)).is_some() {
                            seen += 1;
                        }
                    }
                    prop_assert_eq!(seen, owners, "each owner appears exactly once");
                }
            }
        }
    }
}
