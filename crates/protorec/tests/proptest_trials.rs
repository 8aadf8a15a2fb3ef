//! Property-based tests for trial bookkeeping across passes.
//!
//! These tests verify that:
//! - Terminal verdicts survive every pass
//! - The pass budget is honoured exactly
//! - Deleting unused trials leaves contiguous operand slots
//! - Fixed-position sorting is stable

use proptest::prelude::*;

use protorec::{ParamActive, TrialStatus};
use protorec_core::{Address, SpaceManager};

// =============================================================================
// Generators
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Unchecked,
    Active,
    Inactive,
    NoUse,
}

fn arb_verdict() -> impl Strategy<Value = Verdict> {
    prop_oneof![
        Just(Verdict::Unchecked),
        Just(Verdict::Active),
        Just(Verdict::Inactive),
        Just(Verdict::NoUse),
    ]
}

/// Trials on consecutive 4-byte registers with the given verdicts.
fn build_active(verdicts: &[Verdict]) -> ParamActive {
    let regs = SpaceManager::standard(false, 4)
        .space_by_name("register")
        .expect("standard spaces include registers");
    let mut active = ParamActive::new(true);
    for i in 0..verdicts.len() {
        active.register_trial(Address::new(regs, 4 * i as u64), 4);
    }
    for (trial, verdict) in active.trials_mut().iter_mut().zip(verdicts) {
        match verdict {
            Verdict::Unchecked => {}
            Verdict::Active => trial.mark_active(),
            Verdict::Inactive => trial.mark_inactive(),
            Verdict::NoUse => trial.mark_no_use(),
        }
    }
    active
}

// =============================================================================
// Pass properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Definitely-unused trials stay that way on every pass, while the
    /// per-pass verdicts are cleared until the budget runs out.
    #[test]
    fn next_pass_keeps_terminal_verdicts(verdicts in prop::collection::vec(arb_verdict(), 1..8), max_pass in 0u32..4) {
        let mut active = build_active(&verdicts);
        active.set_max_pass(max_pass);
        let mut passes = 0;
        while !active.is_fully_checked() {
            active = active.next_pass();
            passes += 1;
            for (trial, verdict) in active.trials().iter().zip(&verdicts) {
                match verdict {
                    Verdict::NoUse => prop_assert!(trial.is_definitely_not_used()),
                    _ if active.is_fully_checked() => {}
                    _ => prop_assert_eq!(trial.status(), TrialStatus::Unchecked),
                }
            }
        }
        prop_assert_eq!(passes, max_pass + 1);
        prop_assert_eq!(active.num_passes(), max_pass + 1);
    }

    /// The final snapshot keeps the verdicts it was given.
    #[test]
    fn fully_checked_snapshot_keeps_verdicts(verdicts in prop::collection::vec(arb_verdict(), 1..8)) {
        let active = build_active(&verdicts);
        let next = active.next_pass();
        prop_assert!(next.is_fully_checked());
        for (a, b) in active.trials().iter().zip(next.trials()) {
            prop_assert_eq!(a.status(), b.status());
        }
    }
}

// =============================================================================
// Trimming properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Only used trials survive, renumbered to consecutive operand slots.
    #[test]
    fn delete_unused_leaves_contiguous_slots(used in prop::collection::vec(any::<bool>(), 0..10)) {
        let verdicts = vec![Verdict::Active; used.len()];
        let mut active = build_active(&verdicts);
        for (trial, &keep) in active.trials_mut().iter_mut().zip(&used) {
            if keep {
                trial.mark_used();
            }
        }
        let expected: Vec<u64> = used
            .iter()
            .enumerate()
            .filter(|&(_, &keep)| keep)
            .map(|(i, _)| 4 * i as u64)
            .collect();

        active.delete_unused_trials();
        prop_assert_eq!(active.num_trials(), expected.len());
        prop_assert_eq!(active.num_used(), expected.len());
        for (i, trial) in active.trials().iter().enumerate() {
            prop_assert_eq!(trial.slot(), Some(i + 1));
            prop_assert_eq!(trial.addr().offset(), expected[i]);
        }
    }

    /// Fixed-position trials come first in position order; the rest keep
    /// their relative order.
    #[test]
    fn sort_fixed_position_is_stable(positions in prop::collection::vec(prop::option::of(0usize..8), 1..10)) {
        let verdicts = vec![Verdict::Unchecked; positions.len()];
        let mut active = build_active(&verdicts);
        for (trial, pos) in active.trials_mut().iter_mut().zip(&positions) {
            if let Some(p) = pos {
                trial.set_fixed_position(*p);
            }
        }
        active.sort_fixed_position();

        let fixed: Vec<usize> = active.trials().iter().filter_map(|t| t.fixed_position()).collect();
        let mut sorted = fixed.clone();
        sorted.sort();
        prop_assert_eq!(&fixed, &sorted);
        let leading = active.trials().iter().take_while(|t| t.fixed_position().is_some()).count();
        prop_assert_eq!(leading, fixed.len());

        let floating: Vec<u64> = active
            .trials()
            .iter()
            .filter(|t| t.fixed_position().is_none())
            .map(|t| t.addr().offset())
            .collect();
        let mut in_order = floating.clone();
        in_order.sort();
        prop_assert_eq!(floating, in_order);
    }
}
