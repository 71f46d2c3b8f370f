//! Property tests for tombstone merging.
//!
//! Verifies that merging deletion records is commutative, associative and
//! idempotent, always keeps the earliest deletion time, and that pruning
//! never touches records inside the retention window.

use std::time::Duration;

use proptest::prelude::*;
use tasksync_proto::tombstone::{TOMBSTONE_RETENTION, Tombstones};

/// Small id space so that generated maps overlap often.
fn arb_tombstones() -> impl Strategy<Value = Tombstones<u8>> {
    prop::collection::vec((0u8..16, 0u64..10_000), 0..24)
        .prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    #[test]
    fn merge_is_commutative(a in arb_tombstones(), b in arb_tombstones()) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_associative(
        a in arb_tombstones(),
        b in arb_tombstones(),
        c in arb_tombstones(),
    ) {
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn merge_is_idempotent(a in arb_tombstones(), b in arb_tombstones()) {
        let once = a.merge(&b);
        prop_assert_eq!(once.merge(&b), once.clone());
        prop_assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn merge_keeps_earliest_time(a in arb_tombstones(), b in arb_tombstones()) {
        let merged = a.merge(&b);
        for (id, when) in merged.iter() {
            let expected = match (a.deleted_at(id), b.deleted_at(id)) {
                (Some(x), Some(y)) => x.min(y),
                (Some(x), None) | (None, Some(x)) => x,
                (None, None) => unreachable!("merged id must come from an input"),
            };
            prop_assert_eq!(when, expected);
        }
        prop_assert!(a.iter().all(|(id, _)| merged.is_deleted(id)));
        prop_assert!(b.iter().all(|(id, _)| merged.is_deleted(id)));
    }

    #[test]
    fn prune_keeps_records_inside_window(
        mut t in arb_tombstones(),
        age_ms in 0u64..5_000,
    ) {
        let now = 10_000;
        let before = t.clone();
        t.prune(now, Duration::from_millis(age_ms));
        for (id, when) in before.iter() {
            prop_assert_eq!(t.is_deleted(id), when >= now - age_ms);
        }
    }

    #[test]
    fn default_retention_keeps_recent_records(t in arb_tombstones()) {
        let mut pruned = t.clone();
        prop_assert_eq!(pruned.prune(10_000, TOMBSTONE_RETENTION), 0);
        prop_assert_eq!(pruned, t);
    }
}
