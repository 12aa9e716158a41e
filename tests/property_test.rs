// tests/property_test.rs

//! Property-based tests for the CRDS conflict-resolution rule and the
//! request queue's capacity accounting.

use peridot::core::gossip::crds::{Crds, CrdsRoute};
use peridot::core::gossip::crds_value::{CrdsData, CrdsValue, CrdsValueLabel};
use peridot::core::router::queue::RequestQueue;
use proptest::prelude::*;

fn lowest_slot(lowest: u64, wallclock: u64) -> CrdsValue {
    CrdsValue::new_signed(
        CrdsData::LowestSlot {
            origin: "origin".into(),
            lowest,
            wallclock_ms: wallclock,
        },
        &None,
    )
}

proptest! {
    /// Whatever order conflicting values arrive in, the same one survives.
    #[test]
    fn crds_override_is_commutative(
        payloads in proptest::collection::vec((0u64..50, 0u64..50), 2..8)
    ) {
        let values: Vec<CrdsValue> = payloads
            .iter()
            .map(|(lowest, wallclock)| lowest_slot(*lowest, *wallclock))
            .collect();

        let forward = Crds::new("me".into(), None, 16);
        for value in &values {
            let _ = forward.insert(value.clone(), 0, CrdsRoute::PushMessage);
        }
        let reverse = Crds::new("me".into(), None, 16);
        for value in values.iter().rev() {
            let _ = reverse.insert(value.clone(), 0, CrdsRoute::PushMessage);
        }

        let label = CrdsValueLabel::LowestSlot("origin".into());
        let left = forward.get(&label).unwrap();
        let right = reverse.get(&label).unwrap();
        prop_assert_eq!(left.value.hash(), right.value.hash());
    }

    /// The queue never exceeds capacity, and every rejected push is counted.
    #[test]
    fn queue_respects_capacity(capacity in 1usize..32, pushes in 1usize..64) {
        let queue = RequestQueue::new(capacity);
        let mut rejected = 0u64;
        for i in 0..pushes {
            if queue.push(i).is_err() {
                rejected += 1;
            }
        }
        let metrics = queue.metrics();
        prop_assert!(metrics.allocated_count <= capacity);
        prop_assert_eq!(metrics.allocated_count, pushes.min(capacity));
        prop_assert_eq!(metrics.push_failure_count, rejected);
        prop_assert_eq!(rejected as usize, pushes.saturating_sub(capacity));
    }
}
