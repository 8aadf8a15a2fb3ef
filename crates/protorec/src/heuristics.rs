//! Caller-side evidence consulted while classifying input trials.

use std::collections::{HashSet, VecDeque};

use protorec_core::{AddrSpace, Address, Funcdata, OpCode, OpId, VarnodeData, VarnodeId};

use crate::trial::ParamTrial;

/// Questions about the calling function that trial classification asks.
pub trait CallerHeuristics {
    /// Returns true if the stack location `vn` may be reached through a
    /// pointer, so its value at the call is not this call's alone.
    fn has_local_alias(&self, data: &Funcdata, vn: VarnodeId) -> bool;

    /// Returns true if `[addr, addr+size)` lies in the caller's local stack
    /// region, where outgoing stack parameters are stored.
    fn in_local_range(&self, addr: &Address, size: u32) -> bool;

    /// Returns true if the value in `vn` looks like it exists only to be
    /// passed to `op`.
    fn ancestor_op_use(
        &self,
        data: &Funcdata,
        max_level: u32,
        vn: VarnodeId,
        op: OpId,
        trial: &mut ParamTrial,
        offset: u32,
    ) -> bool {
        ancestor_op_use(data, max_level, vn, op, trial, offset)
    }
}

/// Heuristics driven by a configured local stack window and alias list.
#[derive(Debug, Clone, Default)]
pub struct DefaultHeuristics {
    local_range: Option<(AddrSpace, u64, u64)>,
    aliased: Vec<VarnodeData>,
}

impl DefaultHeuristics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the local region to offsets `[start, end]` of `space`.
    pub fn with_local_range(mut self, space: AddrSpace, start: u64, end: u64) -> Self {
        self.local_range = Some((space, start, end));
        self
    }

    /// Marks a stack range as reachable through a pointer.
    pub fn with_alias(mut self, storage: VarnodeData) -> Self {
        self.aliased.push(storage);
        self
    }
}

impl CallerHeuristics for DefaultHeuristics {
    fn has_local_alias(&self, data: &Funcdata, vn: VarnodeId) -> bool {
        let storage = data.varnode(vn).storage();
        self.aliased.iter().any(|a| {
            a.space() == storage.space()
                && a.offset() <= storage.offset() + u64::from(storage.size) - 1
                && storage.offset() <= a.offset() + u64::from(a.size) - 1
        })
    }

    fn in_local_range(&self, addr: &Address, size: u32) -> bool {
        let Some((space, start, end)) = self.local_range else {
            return true;
        };
        if addr.space() != space {
            return false;
        }
        let last = addr.offset().saturating_add(u64::from(size.max(1)) - 1);
        addr.offset() >= start && last <= end
    }
}

/// Walks back from `vn` through bookkeeping operations to the operation
/// that produced the value, then checks that the value has no use other
/// than the call `op`.
pub fn ancestor_op_use(
    data: &Funcdata,
    max_level: u32,
    vn: VarnodeId,
    op: OpId,
    trial: &mut ParamTrial,
    offset: u32,
) -> bool {
    let mut on_path = HashSet::new();
    ancestor_use(data, max_level, vn, op, trial, offset, &mut on_path)
}

fn ancestor_use(
    data: &Funcdata,
    level: u32,
    vn_id: VarnodeId,
    op: OpId,
    trial: &mut ParamTrial,
    offset: u32,
    on_path: &mut HashSet<OpId>,
) -> bool {
    if level == 0 {
        return false;
    }
    let vn = data.varnode(vn_id);
    let Some(def) = data.def_op(vn_id) else {
        // A locked input counts when the call is its only real reader.
        return vn.is_input() && vn.is_type_locked() && only_op_use(data, vn_id, op, trial);
    };
    match def.code() {
        OpCode::Indirect => {
            // Only marks a possible kill by a call, not a use.
            if def.is_indirect_creation() {
                return false;
            }
            if let Some(prev) = def.input(0) {
                return ancestor_use(data, level - 1, prev, op, trial, offset, on_path);
            }
        }
        OpCode::MultiEqual => {
            if !on_path.insert(def.id()) {
                return false;
            }
            let found = def
                .inputs()
                .iter()
                .any(|&input| ancestor_use(data, level - 1, input, op, trial, offset, on_path));
            on_path.remove(&def.id());
            return found;
        }
        OpCode::Copy => {
            let incidental = vn.addr().space().is_internal()
                || def.is_incidental_copy()
                || def.input(0).is_some_and(|v| data.varnode(v).is_incidental_copy());
            if incidental {
                if let Some(prev) = def.input(0) {
                    return ancestor_use(data, level - 1, prev, op, trial, offset, on_path);
                }
            }
        }
        OpCode::Piece => {
            let (Some(hi), Some(lo)) = (def.input(0), def.input(1)) else {
                return false;
            };
            if offset == 0 {
                return ancestor_use(data, level - 1, lo, op, trial, 0, on_path);
            }
            if offset == data.varnode(lo).size() {
                return ancestor_use(data, level - 1, hi, op, trial, 0, on_path);
            }
            return false;
        }
        OpCode::Subpiece => {
            let (Some(whole), Some(cut)) = (def.input(0), def.input(1)) else {
                return false;
            };
            let cut = data.varnode(cut).constant_value().unwrap_or(0) as u32;
            // A division leaves its remainder in a register that looks like
            // the high half of a wide value.
            if cut == 0 {
                if let Some(rem) = data.def_op(whole) {
                    if matches!(rem.code(), OpCode::IntRem | OpCode::IntSRem) {
                        trial.set_rem_formed();
                    }
                }
            }
            let incidental = vn.addr().space().is_internal()
                || def.is_incidental_copy()
                || data.varnode(whole).is_incidental_copy()
                || vn.overlap(data.varnode(whole)) == Some(cut);
            if incidental {
                return ancestor_use(data, level - 1, whole, op, trial, offset + cut, on_path);
            }
        }
        OpCode::Call | OpCode::CallInd => return false,
        _ => {}
    }
    only_op_use(data, vn_id, op, trial)
}

/// Returns true if every flow of `start` ends at `target` in the trial's
/// slot, passing only through operations that do not count as a use.
fn only_op_use(data: &Funcdata, start: VarnodeId, target: OpId, trial: &ParamTrial) -> bool {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(vn) = queue.pop_front() {
        for &reader in data.varnode(vn).descendants() {
            let op = data.op(reader);
            if reader == target && trial.slot().is_some_and(|s| op.input(s) == Some(vn)) {
                continue;
            }
            match op.code() {
                OpCode::Branch
                | OpCode::CBranch
                | OpCode::BranchInd
                | OpCode::Load
                | OpCode::Store
                | OpCode::Return
                | OpCode::Call
                | OpCode::CallInd => return false,
                _ => {}
            }
            if let Some(out) = op.output() {
                if data.varnode(out).is_persist() {
                    return false;
                }
                if seen.insert(out) {
                    queue.push_back(out);
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use protorec_core::{SpaceManager, VarnodeFlags};

    fn setup() -> (Funcdata, AddrSpace, AddrSpace, Address) {
        let spaces = SpaceManager::standard(false, 4);
        let regs = spaces.space_by_name("register").unwrap();
        let stack = spaces.space_by_name("stack").unwrap();
        let ram = Address::new(spaces.space_by_name("ram").unwrap(), 0x1000);
        (Funcdata::new("caller", ram, spaces), regs, stack, ram)
    }

    #[test]
    fn test_local_range_and_alias() {
        let (mut fd, _, stack, _) = setup();
        let heur = DefaultHeuristics::new()
            .with_local_range(stack, 0, 0x40)
            .with_alias(VarnodeData::new(Address::new(stack, 8), 4));
        assert!(heur.in_local_range(&Address::new(stack, 4), 4));
        assert!(!heur.in_local_range(&Address::new(stack, 0x40), 4));

        let aliased = fd.new_varnode(4, Address::new(stack, 10));
        let clean = fd.new_varnode(4, Address::new(stack, 12));
        assert!(heur.has_local_alias(&fd, aliased));
        assert!(!heur.has_local_alias(&fd, clean));
        assert!(DefaultHeuristics::new().in_local_range(&Address::new(stack, 0x1000), 4));
    }

    #[test]
    fn test_only_use_is_the_call() {
        let (mut fd, regs, _, ram) = setup();
        let bl = fd.new_block();
        let c = fd.new_constant(4, 3);
        let copy = fd.new_op(OpCode::Copy, ram, &[c]);
        let r0 = fd.new_varnode_out(4, Address::new(regs, 0), copy).unwrap();
        fd.op_insert_end(copy, bl).unwrap();
        let target = fd.new_varnode(1, ram);
        let call = fd.new_op(OpCode::Call, ram, &[target, r0]);
        fd.op_insert_end(call, bl).unwrap();

        let mut trial = ParamTrial::new(Address::new(regs, 0), 4, 1);
        assert!(ancestor_op_use(&fd, 5, r0, call, &mut trial, 0));

        // A second reader that branches on the value counts as a real use.
        let cb = fd.new_op(OpCode::CBranch, ram, &[target, r0]);
        fd.op_insert_end(cb, bl).unwrap();
        assert!(!ancestor_op_use(&fd, 5, r0, call, &mut trial, 0));
    }

    #[test]
    fn test_indirect_creation_is_not_use() {
        let (mut fd, regs, _, ram) = setup();
        let bl = fd.new_block();
        let zero = fd.new_constant(4, 0);
        let iop = fd.new_constant(4, 0);
        let ind = fd.new_op(OpCode::Indirect, ram, &[zero, iop]);
        fd.op_set_flags(ind, protorec_core::OpFlags::INDIRECT_CREATION);
        let r0 = fd.new_varnode_out(4, Address::new(regs, 0), ind).unwrap();
        fd.op_insert_end(ind, bl).unwrap();
        let mut trial = ParamTrial::new(Address::new(regs, 0), 4, 1);
        assert!(!ancestor_op_use(&fd, 5, r0, ind, &mut trial, 0));
    }

    #[test]
    fn test_locked_input_counts_and_depth_bound() {
        let (mut fd, regs, _, ram) = setup();
        let input = fd.new_input(4, Address::new(regs, 0));
        let mut trial = ParamTrial::new(Address::new(regs, 0), 4, 1);
        let bl = fd.new_block();
        let target = fd.new_varnode(1, ram);
        let call = fd.new_op(OpCode::Call, ram, &[target, input]);
        fd.op_insert_end(call, bl).unwrap();
        assert!(!ancestor_op_use(&fd, 5, input, call, &mut trial, 0));
        fd.set_varnode_flags(input, VarnodeFlags::TYPE_LOCK);
        assert!(ancestor_op_use(&fd, 5, input, call, &mut trial, 0));
        assert!(!ancestor_op_use(&fd, 0, input, call, &mut trial, 0));

        // Once something else reads the locked input, it is no longer
        // evidence for the call.
        let ret = fd.new_op(OpCode::Return, ram, &[target, input]);
        fd.op_insert_end(ret, bl).unwrap();
        assert!(!ancestor_op_use(&fd, 5, input, call, &mut trial, 0));
    }

    #[test]
    fn test_remainder_marks_trial() {
        let (mut fd, regs, _, ram) = setup();
        let bl = fd.new_block();
        let a = fd.new_constant(8, 10);
        let b = fd.new_constant(8, 3);
        let rem = fd.new_op(OpCode::IntRem, ram, &[a, b]);
        let wide = fd.new_unique_out(8, rem).unwrap();
        fd.op_insert_end(rem, bl).unwrap();
        let cut = fd.new_constant(4, 0);
        let sub = fd.new_op(OpCode::Subpiece, ram, &[wide, cut]);
        let r0 = fd.new_varnode_out(4, Address::new(regs, 0), sub).unwrap();
        fd.op_insert_end(sub, bl).unwrap();
        let target = fd.new_varnode(1, ram);
        let call = fd.new_op(OpCode::Call, ram, &[target, r0]);
        fd.op_insert_end(call, bl).unwrap();

        let mut trial = ParamTrial::new(Address::new(regs, 0), 4, 1);
        assert!(ancestor_op_use(&fd, 5, r0, call, &mut trial, 0));
        assert!(trial.is_rem_formed());
    }
}
