use test_case::test_case;

use super::*;

#[test]
fn vlsn_ordering_matches_sequence() {
    let a = Vlsn::new(5);
    let b = Vlsn::new(6);
    assert!(a < b);
    assert_eq!(a.next(), b);
}

#[test]
fn vlsn_sentinels_are_distinct() {
    assert_ne!(Vlsn::NULL, Vlsn::UNINITIALIZED);
    assert_ne!(Vlsn::NULL, Vlsn::INVALID);
    assert_ne!(Vlsn::UNINITIALIZED, Vlsn::INVALID);
}

#[test_case(Vlsn::NULL ; "null")]
#[test_case(Vlsn::UNINITIALIZED ; "uninitialized")]
#[test_case(Vlsn::INVALID ; "invalid")]
fn vlsn_sentinel_detection(sentinel: Vlsn) {
    assert!(sentinel.is_sentinel());
    assert!(!sentinel.is_real());
}

#[test]
#[should_panic(expected = "cannot advance a sentinel VLSN")]
fn vlsn_next_panics_on_sentinel() {
    let _ = Vlsn::UNINITIALIZED.next();
}

#[test]
fn vlsn_display_names_sentinels() {
    assert_eq!(Vlsn::NULL.to_string(), "null");
    assert_eq!(Vlsn::new(42).to_string(), "42");
}

#[test]
fn lsn_ordering_is_file_then_offset() {
    let early = Lsn::new(1, 900);
    let late = Lsn::new(2, 0);
    assert!(early < late);
    assert!(Lsn::new(2, 1) > late);
}

#[test]
fn lsn_pack_roundtrip() {
    let lsn = Lsn::new(17, 0xDEAD_BEEF);
    assert_eq!(Lsn::unpack(lsn.pack()), lsn);
}

#[test]
fn lsn_pack_preserves_ordering() {
    let a = Lsn::new(1, u32::MAX);
    let b = Lsn::new(2, 0);
    assert!(a.pack() < b.pack());
}

#[test]
fn entry_kind_classification() {
    assert!(EntryKind::Commit.is_txn_end());
    assert!(EntryKind::Abort.is_txn_end());
    assert!(!EntryKind::Put.is_txn_end());
    assert!(EntryKind::Put.is_write());
    assert!(EntryKind::Delete.is_write());
    assert!(!EntryKind::Commit.is_write());
}

#[test]
fn channel_name_display() {
    let name = ChannelName::new("replica-3", 7);
    assert_eq!(name.to_string(), "(replica-3:7)");
}

#[test]
fn monotonic_nanos_is_monotonic() {
    let a = monotonic_nanos();
    let b = monotonic_nanos();
    assert!(b >= a);
}

mod properties {
    use proptest::prelude::*;

    use crate::{Lsn, Vlsn};

    proptest! {
        #[test]
        fn vlsn_u64_roundtrip(seq in 0u64..u64::MAX - 2) {
            let vlsn = Vlsn::new(seq);
            prop_assert_eq!(u64::from(vlsn), seq);
        }

        #[test]
        fn lsn_pack_roundtrip(file in any::<u32>(), offset in any::<u32>()) {
            let lsn = Lsn::new(file, offset);
            prop_assert_eq!(Lsn::unpack(lsn.pack()), lsn);
        }

        #[test]
        fn lsn_pack_order_agrees(a in any::<u64>(), b in any::<u64>()) {
            let (x, y) = (Lsn::unpack(a), Lsn::unpack(b));
            prop_assert_eq!(x.cmp(&y), a.cmp(&b));
        }
    }
}
