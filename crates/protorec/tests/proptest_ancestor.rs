//! Property-based tests for the ancestor walk.
//!
//! The walk keeps its visited set outside the graph, so running it again on
//! the same graph and trial must give the same verdict and the same trial
//! evidence, whether the walker is reused or fresh.

use proptest::prelude::*;

use protorec::{AncestorRealistic, ParamTrial};
use protorec_core::{AddrSpace, Address, BlockId, Funcdata, OpCode, OpId, SpaceManager, VarnodeFlags, VarnodeId};

// =============================================================================
// Graph generators
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Origin {
    Constant,
    Unaffected,
    DirectWrite,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    /// Copy into a temporary.
    Temp,
    /// Pass-through across an earlier call.
    Indirect,
    /// Merge with the value two steps back.
    Merge,
    /// Arithmetic producing a new value.
    Add,
}

fn arb_origin() -> impl Strategy<Value = Origin> {
    prop_oneof![Just(Origin::Constant), Just(Origin::Unaffected), Just(Origin::DirectWrite)]
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![Just(Step::Temp), Just(Step::Indirect), Just(Step::Merge), Just(Step::Add)]
}

struct Built {
    fd: Funcdata,
    call: OpId,
    reg0: Address,
}

fn build(origin: Origin, steps: &[Step]) -> Built {
    let spaces = SpaceManager::standard(false, 4);
    let regs: AddrSpace = spaces.space_by_name("register").expect("registers");
    let ram = spaces.space_by_name("ram").expect("ram");
    let reg0 = Address::new(regs, 0);
    let at = Address::new(ram, 0x1000);
    let mut fd = Funcdata::new("walk", at, spaces);
    let block: BlockId = fd.new_block();

    let first = match origin {
        Origin::Constant => {
            let c = fd.new_constant(4, 1);
            let copy = fd.new_op(OpCode::Copy, at, &[c]);
            let out = fd.new_varnode_out(4, reg0, copy).expect("fresh output");
            fd.op_insert_end(copy, block).expect("insert");
            out
        }
        Origin::Unaffected | Origin::DirectWrite => {
            let input = fd.new_input(4, reg0);
            let flag = match origin {
                Origin::Unaffected => VarnodeFlags::UNAFFECTED,
                _ => VarnodeFlags::DIRECT_WRITE,
            };
            fd.set_varnode_flags(input, flag);
            input
        }
    };

    let mut history: Vec<VarnodeId> = vec![first];
    for step in steps {
        let prev = *history.last().expect("history starts non-empty");
        let out = match step {
            Step::Temp => {
                let copy = fd.new_op(OpCode::Copy, at, &[prev]);
                let out = fd.new_unique_out(4, copy).expect("fresh output");
                fd.op_insert_end(copy, block).expect("insert");
                out
            }
            Step::Indirect => {
                let iop = fd.new_constant(4, 0);
                let ind = fd.new_op(OpCode::Indirect, at, &[prev, iop]);
                let out = fd.new_varnode_out(4, reg0, ind).expect("fresh output");
                fd.op_insert_end(ind, block).expect("insert");
                out
            }
            Step::Merge => {
                let other = history[history.len().saturating_sub(2)];
                let phi = fd.new_op(OpCode::MultiEqual, at, &[prev, other]);
                let out = fd.new_varnode_out(4, reg0, phi).expect("fresh output");
                fd.op_insert_end(phi, block).expect("insert");
                out
            }
            Step::Add => {
                let one = fd.new_constant(4, 1);
                let add = fd.new_op(OpCode::IntAdd, at, &[prev, one]);
                let out = fd.new_varnode_out(4, reg0, add).expect("fresh output");
                fd.op_insert_end(add, block).expect("insert");
                out
            }
        };
        history.push(out);
    }

    let operand = *history.last().expect("history starts non-empty");
    let target = fd.new_varnode(1, Address::new(ram, 0x2000));
    let call = fd.new_op(OpCode::Call, at, &[target, operand]);
    fd.op_insert_end(call, block).expect("insert");
    Built { fd, call, reg0 }
}

// =============================================================================
// Determinism
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Reusing a walker gives the same answer as a fresh one, and repeated
    /// runs agree on verdict and evidence.
    #[test]
    fn walk_is_deterministic(
        origin in arb_origin(),
        steps in prop::collection::vec(arb_step(), 0..8),
        killed in any::<bool>(),
        allow_fail in any::<bool>(),
    ) {
        let built = build(origin, &steps);
        let mut template = ParamTrial::new(built.reg0, 4, 1);
        if killed {
            template.mark_killed_by_call();
        }

        let mut walker = AncestorRealistic::new();
        let mut first = template.clone();
        let r1 = walker.execute(&built.fd, built.call, 1, &mut first, allow_fail);
        let mut second = template.clone();
        let r2 = walker.execute(&built.fd, built.call, 1, &mut second, allow_fail);
        let mut fresh = template.clone();
        let r3 = AncestorRealistic::new().execute(&built.fd, built.call, 1, &mut fresh, allow_fail);

        prop_assert_eq!(r1, r2);
        prop_assert_eq!(r1, r3);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first, &fresh);
        prop_assert_eq!(r1, first.has_ancestor_realistic());
    }

    /// A value built from a constant with arithmetic and bookkeeping copies
    /// only is always a realistic parameter.
    #[test]
    fn constant_origin_is_realistic(steps in prop::collection::vec(prop_oneof![Just(Step::Temp), Just(Step::Add)], 0..6)) {
        let built = build(Origin::Constant, &steps);
        let mut trial = ParamTrial::new(built.reg0, 4, 1);
        prop_assert!(AncestorRealistic::new().execute(&built.fd, built.call, 1, &mut trial, false));
        prop_assert!(trial.has_ancestor_solid());
    }
}
