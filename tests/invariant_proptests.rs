//! Property-based coverage of the arithmetic invariants spec §8 calls out
//! explicitly: shard intersection and correlation id wraparound.

use proptest::prelude::*;
use schemat_runtime::atlas::Shard;
use schemat_runtime::ids::{CorrelationId, MAX_CORRELATION_ID};

proptest! {
    /// `x` belongs to the intersection of two shards exactly when it
    /// belongs to both.
    #[test]
    fn shard_intersection_matches_membership_in_both(
        base1 in 1u32..20,
        offset1 in 0u32..20,
        base2 in 1u32..20,
        offset2 in 0u32..20,
        samples in prop::collection::vec(0u64..2000, 1..50),
    ) {
        let s1 = Shard::new(base1, offset1);
        let s2 = Shard::new(base2, offset2);
        if let Some(merged) = s1.intersect(&s2) {
            for x in samples {
                prop_assert_eq!(merged.contains(x), s1.contains(x) && s2.contains(x));
            }
        } else {
            // No common solution: no x can satisfy both congruences.
            for x in samples {
                prop_assert!(!(s1.contains(x) && s2.contains(x)));
            }
        }
    }

    /// Coprime bases always intersect, with `base1 * base2` as the merged
    /// base and exactly one residue mod that base.
    #[test]
    fn coprime_bases_always_intersect_with_product_base(
        base1 in 1u32..15,
        base2 in 1u32..15,
        offset1 in 0u32..15,
        offset2 in 0u32..15,
    ) {
        prop_assume!(gcd(base1, base2) == 1);
        let s1 = Shard::new(base1, offset1);
        let s2 = Shard::new(base2, offset2);
        let merged = s1.intersect(&s2).expect("coprime bases always have a common solution");
        prop_assert_eq!(merged.base, base1 * base2);
    }

    /// `CorrelationId::next` never yields the reserved `0` sentinel and
    /// wraps back to `1` once it would exceed the wire-safe ceiling.
    #[test]
    fn correlation_id_never_zero_and_wraps_at_ceiling(prev in 0u64..=MAX_CORRELATION_ID) {
        let next = CorrelationId::next(prev);
        prop_assert!(next.value() >= 1);
        prop_assert!(next.value() <= MAX_CORRELATION_ID);
        if prev == MAX_CORRELATION_ID {
            prop_assert_eq!(next.value(), 1);
        } else {
            prop_assert_eq!(next.value(), prev + 1);
        }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}
