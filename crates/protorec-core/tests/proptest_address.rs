//! Property-based tests for address containment arithmetic.
//!
//! - `justified_contain` and `contained_by` agree on whether a range is inside another
//! - the justified offset of a range plus its size never exceeds the container
//! - `overlap` of a contained start address is its distance from the base

use proptest::prelude::*;

use protorec_core::{AddrSpace, Address, SpaceKind};

// =============================================================================
// Generators
// =============================================================================

fn arb_space() -> impl Strategy<Value = AddrSpace> {
    prop::bool::ANY
        .prop_map(|big_endian| AddrSpace::new(3, "register", SpaceKind::Processor, big_endian, 4))
}

fn arb_size() -> impl Strategy<Value = u32> {
    prop::sample::select(vec![1u32, 2, 4, 8, 16])
}

// =============================================================================
// Containment Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    /// A range is justified-contained exactly when it is contained.
    #[test]
    fn justified_contain_agrees_with_contained_by(
        space in arb_space(),
        base in 0u64..0x100,
        size in arb_size(),
        other in 0u64..0x120,
        other_size in arb_size(),
        force_left in prop::bool::ANY,
    ) {
        let a = Address::new(space, base);
        let b = Address::new(space, other);
        let just = a.justified_contain(size, &b, other_size, force_left);
        prop_assert_eq!(just.is_some(), b.contained_by(other_size, &a, size));
        if let Some(k) = just {
            prop_assert!(k + other_size <= size);
        }
    }

    /// Little-endian justification is the plain distance from the base.
    #[test]
    fn little_endian_justification_is_distance(
        base in 0u64..0x100,
        delta in 0u64..8,
        other_size in prop::sample::select(vec![1u32, 2, 4]),
    ) {
        let space = AddrSpace::new(3, "register", SpaceKind::Processor, false, 4);
        let a = Address::new(space, base);
        let b = a.add(delta as i64);
        let size = 16;
        prop_assert_eq!(a.justified_contain(size, &b, other_size, false), Some(delta as u32));
        prop_assert_eq!(b.overlap(0, &a, size), Some(delta as u32));
    }

    /// Two adjacent halves are contiguous in exactly one order.
    #[test]
    fn contiguity_is_ordered(
        space in arb_space(),
        base in 0u64..0x100,
        half in prop::sample::select(vec![1u32, 2, 4, 8]),
    ) {
        let low_addr = Address::new(space, base);
        let high_addr = low_addr.add(i64::from(half));
        let forward = high_addr.is_contiguous(half, &low_addr, half);
        let backward = low_addr.is_contiguous(half, &high_addr, half);
        prop_assert!(forward != backward);
        prop_assert_eq!(forward, !space.is_big_endian());
    }
}
