//! Backward data-flow test for "does this operand look like real parameter data".
//!
//! The walk follows the defining operations of one operand, passing through
//! bookkeeping copies, truncations and merges, and stops at the first
//! operation that actually moves data into the storage ("solid" movement)
//! or at evidence that the storage is stale: an unaffected register, a
//! value created out of nothing by a call, or a return-address slot.
//!
//! The traversal keeps an explicit stack of frames. Each frame names an
//! operation and the input slot being followed; merge frames additionally
//! collect the verdicts of their inputs. Visited varnodes are tracked in a
//! set owned by the walker, so nothing in the graph is marked.

use std::collections::HashSet;

use protorec_core::{Funcdata, OpCode, OpId, PcodeOp, SpaceKind, VarnodeId};

use crate::trial::ParamTrial;

/// What the traversal does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Examine the varnode named by the top frame.
    Enter,
    /// The path is plausible.
    Success,
    /// The path ends in real data movement.
    Solid,
    /// The path is not plausible.
    Fail,
    /// The path ends at a value killed by a call.
    FailKill,
}

#[derive(Debug, Clone, Copy, Default)]
struct MergeFlags {
    solid0: bool,
    solid1: bool,
    kill: bool,
}

impl MergeFlags {
    fn mark_solid(&mut self, slot: usize) {
        if slot == 0 {
            self.solid0 = true;
        } else {
            self.solid1 = true;
        }
    }

    fn seen_solid(&self) -> bool {
        self.solid0 || self.solid1
    }

    fn solid_slot(&self) -> usize {
        if self.solid0 {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    op: OpId,
    slot: usize,
    flags: MergeFlags,
    offset: u32,
}

impl Frame {
    fn new(op: OpId, slot: usize, offset: u32) -> Self {
        Self {
            op,
            slot,
            flags: MergeFlags::default(),
            offset,
        }
    }
}

/// Reusable walker. Buffers are cleared at the start of every run.
#[derive(Debug, Default)]
pub struct AncestorRealistic {
    stack: Vec<Frame>,
    visited: HashSet<VarnodeId>,
    allow_fail: bool,
}

impl AncestorRealistic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tests whether the operand in `slot` of `op` has realistic ancestry.
    ///
    /// On success the trial is flagged ancestor-realistic, and also
    /// ancestor-solid when the walk ended in real data movement. With
    /// `allow_fail` set, a merge that mixes solid movement with a killed
    /// path is accepted when the killed path can be blamed on conditional
    /// execution; the trial is then flagged for a final recheck.
    pub fn execute(
        &mut self,
        data: &Funcdata,
        op: OpId,
        slot: usize,
        trial: &mut ParamTrial,
        allow_fail: bool,
    ) -> bool {
        self.stack.clear();
        self.visited.clear();
        self.allow_fail = allow_fail;

        let Some(start) = data.op(op).input(slot) else {
            return false;
        };
        // An operand that is itself a function input shows no movement into
        // the storage at all. Only a recheck may look further.
        if data.varnode(start).is_input() && !trial.has_cond_exe_effect() {
            return false;
        }

        let mut command = Command::Enter;
        self.stack.push(Frame::new(op, slot, 0));
        while !self.stack.is_empty() {
            command = match command {
                Command::Enter => self.enter_node(data, trial),
                other => self.upon_pop(data, trial, other),
            };
        }

        log::trace!("ancestor walk for {} slot {}: {:?}", op, slot, command);
        match command {
            Command::Success => {
                trial.set_ancestor_realistic();
                true
            }
            Command::Solid => {
                trial.set_ancestor_realistic();
                trial.set_ancestor_solid();
                true
            }
            _ => false,
        }
    }

    fn enter_node(&mut self, data: &Funcdata, trial: &mut ParamTrial) -> Command {
        let Some(&state) = self.stack.last() else {
            return Command::Fail;
        };
        let Some(vn_id) = data.op(state.op).input(state.slot) else {
            return Command::Fail;
        };
        if self.visited.contains(&vn_id) {
            return Command::Success;
        }
        let vn = data.varnode(vn_id);
        let Some(def) = vn.def() else {
            if vn.is_input() {
                if vn.is_unaffected() {
                    return Command::Fail;
                }
                if vn.is_persist() {
                    return Command::Success;
                }
                if !vn.is_direct_write() {
                    return Command::Fail;
                }
            }
            return Command::Success;
        };
        self.visited.insert(vn_id);
        let def = data.op(def);
        match def.code() {
            OpCode::Indirect => {
                if def.is_indirect_creation() {
                    trial.set_ind_create_formed();
                    let zero = def.input(0).is_some_and(|v| data.varnode(v).is_indirect_zero());
                    return if zero { Command::FailKill } else { Command::Success };
                }
                if !def.is_indirect_store() {
                    if vn.is_return_address() || trial.is_killed_by_call() {
                        return Command::Fail;
                    }
                }
                self.stack.push(Frame::new(def.id(), 0, state.offset));
                Command::Enter
            }
            OpCode::Subpiece => {
                let Some(cut) = def.input(1).and_then(|c| data.varnode(c).constant_value()) else {
                    return Command::Solid;
                };
                if self.is_incidental(data, def) || Self::same_piece(data, def, vn_id, cut) {
                    let offset = state.offset.saturating_add(cut as u32);
                    self.stack.push(Frame::new(def.id(), 0, offset));
                    return Command::Enter;
                }
                self.scan_movement(data, def, true)
            }
            OpCode::Copy => {
                let same_addr = def.input(0).is_some_and(|v| data.varnode(v).addr() == vn.addr());
                if self.is_incidental(data, def) || same_addr {
                    self.stack.push(Frame::new(def.id(), 0, state.offset));
                    return Command::Enter;
                }
                self.scan_movement(data, def, false)
            }
            OpCode::MultiEqual => {
                self.stack.push(Frame::new(def.id(), 0, state.offset));
                Command::Enter
            }
            OpCode::Piece => {
                if vn.size() > trial.size() {
                    let hi_size = def.input(0).map_or(0, |v| data.varnode(v).size());
                    let lo_size = def.input(1).map_or(0, |v| data.varnode(v).size());
                    if state.offset == 0 && lo_size <= trial.size() {
                        self.stack.push(Frame::new(def.id(), 1, 0));
                        return Command::Enter;
                    }
                    if state.offset == lo_size && hi_size <= trial.size() {
                        self.stack.push(Frame::new(def.id(), 0, 0));
                        return Command::Enter;
                    }
                    if vn.addr().space().kind() == SpaceKind::Spacebase {
                        return Command::Fail;
                    }
                }
                Command::Solid
            }
            _ => Command::Solid,
        }
    }

    /// Output in the internal space, or a copy flagged as bookkeeping.
    fn is_incidental(&self, data: &Funcdata, def: &PcodeOp) -> bool {
        let out_internal = def
            .output()
            .is_some_and(|o| data.varnode(o).addr().space().is_internal());
        let in_incidental = def
            .input(0)
            .is_some_and(|v| data.varnode(v).is_incidental_copy());
        out_internal || def.is_incidental_copy() || in_incidental
    }

    /// The truncation keeps exactly the bytes the output already aliases.
    fn same_piece(data: &Funcdata, def: &PcodeOp, out: VarnodeId, cut: u64) -> bool {
        let Some(whole) = def.input(0) else {
            return false;
        };
        data.varnode(out).overlap(data.varnode(whole)) == Some(cut as u32)
    }

    /// Short scan through a chain of copies, truncations and
    /// concatenations that only looks for inputs disqualifying the
    /// movement. A concatenation is followed through its most significant
    /// piece.
    fn scan_movement(&self, data: &Funcdata, start: &PcodeOp, truncation: bool) -> Command {
        let mut cur = Some(start);
        while let Some(op) = cur {
            let Some(vn_id) = op.input(0) else {
                break;
            };
            let vn = data.varnode(vn_id);
            if !self.visited.contains(&vn_id) && vn.is_input() {
                if !vn.is_direct_write() || (truncation && vn.is_unaffected()) {
                    return Command::Fail;
                }
            }
            cur = data
                .def_op(vn_id)
                .filter(|d| matches!(d.code(), OpCode::Copy | OpCode::Subpiece | OpCode::Piece));
        }
        Command::Solid
    }

    fn upon_pop(&mut self, data: &Funcdata, trial: &mut ParamTrial, command: Command) -> Command {
        let Some(top) = self.stack.last_mut() else {
            return command;
        };
        if data.op(top.op).code() != OpCode::MultiEqual {
            self.stack.pop();
            return command;
        }
        match command {
            Command::Fail => {
                self.stack.pop();
                return Command::Fail;
            }
            Command::Solid => top.flags.mark_solid(top.slot),
            Command::FailKill => top.flags.kill = true,
            _ => {}
        }
        top.slot += 1;
        if top.slot < data.op(top.op).num_inputs() {
            return Command::Enter;
        }

        let merge = *top;
        let verdict = if merge.flags.seen_solid() {
            if !merge.flags.kill {
                Command::Success
            } else if self.allow_fail && Self::check_conditional_exe(data, &merge) {
                trial.set_cond_exe_effect();
                Command::Success
            } else {
                Command::Fail
            }
        } else if merge.flags.kill {
            Command::FailKill
        } else {
            Command::Success
        };
        self.stack.pop();
        verdict
    }

    /// The killed path can be blamed on conditional execution when the merge
    /// has two predecessors and the solid side flows straight into it.
    fn check_conditional_exe(data: &Funcdata, merge: &Frame) -> bool {
        let Some(bl) = data.op(merge.op).parent() else {
            return false;
        };
        let block = data.block(bl);
        if block.in_size() != 2 {
            return false;
        }
        block
            .predecessors()
            .get(merge.flags.solid_slot())
            .is_some_and(|&pred| data.block(pred).out_size() == 1)
    }
}
