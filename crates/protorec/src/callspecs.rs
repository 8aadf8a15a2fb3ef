//! Prototype recovery at a single call site.
//!
//! A [`FuncCallSpecs`] pairs a call operation with the prototype believed to
//! govern it. While recovery is active, every operand after the call target
//! is a *trial*: a storage location that might carry an argument. Passes
//! classify the trials from caller-side evidence, the model decides which
//! form the final parameter list, and the call's operands are rebuilt from
//! that decision. Outputs are handled the same way, with trials represented
//! by indirect-creation operations placed just before the call.
//!
//! The usual input sequence is:
//!
//! 1. [`init_active_input`](FuncCallSpecs::init_active_input)
//! 2. [`add_input_trial`](FuncCallSpecs::add_input_trial) per candidate
//! 3. optionally [`init_stack_placeholder`](FuncCallSpecs::init_stack_placeholder)
//! 4. [`run_input_pass`](FuncCallSpecs::run_input_pass) until it reports no change

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use protorec_core::{Address, Funcdata, OpCode, OpFlags, OpId, VarnodeFlags, VarnodeId};

use crate::ancestor::AncestorRealistic;
use crate::config::RecoveryConfig;
use crate::error::{ProtoError, Result};
use crate::heuristics::CallerHeuristics;
use crate::proto::FuncProto;
use crate::store::ProtoParameter;
use crate::trial::ParamActive;

/// Operands to carry over when a call adopts a locked prototype.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    /// One operand per locked parameter; `None` entries are loaded from the
    /// stack when committed. `None` overall when inputs are not transferred.
    pub inputs: Option<Vec<Option<VarnodeId>>>,
    /// Existing varnode to become the call's output.
    pub output: Option<VarnodeId>,
}

enum InputTransfer {
    Reuse(usize),
    StackLoad,
    Fail,
}

/// A call site and the prototype recovered for it.
#[derive(Debug, Clone)]
pub struct FuncCallSpecs {
    proto: FuncProto,
    op: OpId,
    name: String,
    entry: Option<Address>,
    effective_extrapop: Option<i32>,
    stack_offset: Option<u64>,
    stack_placeholder_slot: Option<usize>,
    paramshift: usize,
    match_call_count: usize,
    active_input: ParamActive,
    active_output: ParamActive,
    input_active: bool,
    output_active: bool,
    input_consume: Vec<u32>,
    bad_jumptable: bool,
}

impl FuncCallSpecs {
    /// Creates the specs for call `op` governed by `proto`.
    ///
    /// A direct call takes its entry point from the target operand. An
    /// indirect call takes it from an override recorded by an earlier
    /// attempt, if any.
    pub fn new(data: &Funcdata, op: OpId, proto: FuncProto, config: &RecoveryConfig) -> Result<Self> {
        let call = data.op(op);
        if !call.is_call() {
            return Err(ProtoError::inconsistent(format!("{} is not a call", op)));
        }
        let entry = match call.code() {
            OpCode::Call => call
                .input(0)
                .map(|t| data.varnode(t))
                .filter(|t| !t.is_constant())
                .map(|t| t.addr()),
            _ => data.indirect_override(&call.addr()),
        };
        let effective_extrapop = proto.model_extra_pop();
        Ok(Self {
            proto,
            op,
            name: String::new(),
            entry,
            effective_extrapop,
            stack_offset: None,
            stack_placeholder_slot: None,
            paramshift: 0,
            match_call_count: 1,
            active_input: ParamActive::new(config.recover_subcall),
            active_output: ParamActive::new(config.recover_subcall),
            input_active: false,
            output_active: false,
            input_consume: Vec::new(),
            bad_jumptable: false,
        })
    }

    pub fn proto(&self) -> &FuncProto {
        &self.proto
    }

    pub fn proto_mut(&mut self) -> &mut FuncProto {
        &mut self.proto
    }

    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn entry(&self) -> Option<Address> {
        self.entry
    }

    pub fn effective_extra_pop(&self) -> Option<i32> {
        self.effective_extrapop
    }

    pub fn set_effective_extra_pop(&mut self, pop: Option<i32>) {
        self.effective_extrapop = pop;
    }

    /// Caller stack pointer offset at the call, once known.
    pub fn stack_offset(&self) -> Option<u64> {
        self.stack_offset
    }

    pub fn set_stack_offset(&mut self, offset: Option<u64>) {
        self.stack_offset = offset;
    }

    pub fn paramshift(&self) -> usize {
        self.paramshift
    }

    pub fn set_paramshift(&mut self, count: usize) {
        self.paramshift = count;
    }

    /// Number of calls in the function sharing this call's entry point.
    pub fn match_call_count(&self) -> usize {
        self.match_call_count
    }

    pub fn is_bad_jumptable(&self) -> bool {
        self.bad_jumptable
    }

    pub fn set_bad_jumptable(&mut self, on: bool) {
        self.bad_jumptable = on;
    }

    pub fn is_input_active(&self) -> bool {
        self.input_active
    }

    pub fn is_output_active(&self) -> bool {
        self.output_active
    }

    pub fn active_input(&self) -> &ParamActive {
        &self.active_input
    }

    pub fn active_input_mut(&mut self) -> &mut ParamActive {
        &mut self.active_input
    }

    pub fn active_output(&self) -> &ParamActive {
        &self.active_output
    }

    pub fn active_output_mut(&mut self) -> &mut ParamActive {
        &mut self.active_output
    }

    // ==================== Activation ====================

    /// Starts input recovery. The pass budget comes from the model's delay.
    pub fn init_active_input(&mut self, config: &RecoveryConfig) {
        self.input_active = true;
        let max_pass = config.max_pass_for_delay(self.proto.max_input_delay());
        self.active_input.set_max_pass(max_pass);
    }

    /// Stops input recovery. The surviving trials stay available.
    pub fn clear_active_input(&mut self) {
        self.input_active = false;
    }

    pub fn init_active_output(&mut self, config: &RecoveryConfig) {
        self.output_active = true;
        let max_pass = config.max_pass_for_delay(self.proto.max_output_delay());
        self.active_output.set_max_pass(max_pass);
    }

    pub fn clear_active_output(&mut self) {
        self.output_active = false;
    }

    /// Appends `vn` as a call operand and registers a trial for it.
    ///
    /// Stack operands are addressed relative to the caller's frame; the
    /// trial records them relative to the stack pointer at the call.
    pub fn add_input_trial(&mut self, data: &mut Funcdata, vn: VarnodeId) -> Result<usize> {
        if !self.input_active {
            return Err(ProtoError::inconsistent("input recovery is not active"));
        }
        let varnode = data.varnode(vn);
        let (addr, size) = (varnode.addr(), varnode.size());
        let trial_addr = if addr.space().is_spacebase() {
            let base = self.stack_offset.unwrap_or(0);
            Address::new(addr.space(), addr.space().wrap_offset(addr.offset().wrapping_sub(base)))
        } else {
            addr
        };
        let slot = data.op(self.op).num_inputs();
        data.op_insert_input(self.op, vn, slot)?;
        self.active_input.register_trial(trial_addr, size);
        Ok(slot)
    }

    /// Creates an indirect-creation of `[addr, addr+size)` just before the
    /// call and registers it as an output trial.
    pub fn add_output_trial(&mut self, data: &mut Funcdata, addr: Address, size: u32) -> Result<VarnodeId> {
        if !self.output_active {
            return Err(ProtoError::inconsistent("output recovery is not active"));
        }
        let call_addr = data.op(self.op).addr();
        let zero = data.new_constant(size, 0);
        let iop = data.new_constant(4, u64::from(self.op.0));
        let ind = data.new_op(OpCode::Indirect, call_addr, &[zero, iop]);
        data.op_set_flags(ind, OpFlags::INDIRECT_CREATION);
        let out = data.new_varnode_out(size, addr, ind)?;
        data.op_insert_before(ind, self.op)?;
        self.active_output.register_trial(addr, size);
        Ok(out)
    }

    // ==================== Stack placeholder ====================

    pub fn stack_placeholder_slot(&self) -> Option<usize> {
        self.stack_placeholder_slot
    }

    pub fn set_stack_placeholder_slot(&mut self, slot: usize) {
        self.stack_placeholder_slot = Some(slot);
        if self.input_active {
            self.active_input.set_placeholder_slot();
        }
    }

    pub fn clear_stack_placeholder_slot(&mut self) {
        self.stack_placeholder_slot = None;
        if self.input_active {
            self.active_input.free_placeholder_slot();
        }
    }

    /// Appends a one-byte load from the stack pointer as a placeholder
    /// operand, so the stack pointer value at the call can be recovered.
    pub fn init_stack_placeholder(&mut self, data: &mut Funcdata, stackptr: Option<VarnodeId>) -> Result<VarnodeId> {
        let stack = self
            .proto
            .model()
            .and_then(|m| m.stack_space())
            .or_else(|| data.spaces().stack_space())
            .ok_or_else(|| ProtoError::inconsistent("no stack space for placeholder"))?;
        let load = data.op_stack_load(stack.index(), 0, 1, self.op, stackptr)?;
        let slot = data.op(self.op).num_inputs();
        data.op_insert_input(self.op, load, slot)?;
        data.set_varnode_flags(load, VarnodeFlags::SPACEBASE_PLACEHOLDER);
        self.set_stack_placeholder_slot(slot);
        Ok(load)
    }

    /// The stack pointer reference feeding the placeholder load.
    pub fn get_spacebase_relative(&self, data: &Funcdata) -> Option<VarnodeId> {
        let vn = data.op(self.op).input(self.stack_placeholder_slot?)?;
        if !data.varnode(vn).is_spacebase_placeholder() {
            return None;
        }
        let load = data.def_op(vn).filter(|op| op.code() == OpCode::Load)?;
        load.input(1)
    }

    /// Fixes the stack offset at the call from the resolved pointer behind
    /// `placeholder`.
    ///
    /// For the synthetic placeholder the pointer is the offset itself and
    /// the placeholder operand is then removed. For a locked stack
    /// parameter the parameter's own offset is subtracted.
    pub fn resolve_spacebase_relative(&mut self, data: &mut Funcdata, placeholder: VarnodeId) -> Result<()> {
        let load = data
            .def_op(placeholder)
            .filter(|op| op.code() == OpCode::Load)
            .ok_or_else(|| ProtoError::inconsistent("stack placeholder is not a load"))?;
        let ptr = load
            .input(1)
            .ok_or_else(|| ProtoError::inconsistent("stack placeholder load has no pointer"))?;
        let (reference, delta) = match data.def_op(ptr) {
            Some(add) if add.code() == OpCode::IntAdd => {
                match (add.input(0), add.input(1).and_then(|c| data.varnode(c).constant_value())) {
                    (Some(base), Some(delta)) => (base, delta),
                    _ => (ptr, 0),
                }
            }
            _ => (ptr, 0),
        };
        let reference = data.varnode(reference);
        let space = reference.addr().space();
        let total = space.wrap_offset(reference.offset().wrapping_add(delta));
        let is_synthetic = self
            .stack_placeholder_slot
            .is_some_and(|slot| data.op(self.op).input(slot) == Some(placeholder));
        let operand_slot = data.op(self.op).slot_of(placeholder);

        if !space.is_spacebase() {
            data.warning_header("This function may have set the stack pointer");
        }
        if is_synthetic {
            self.stack_offset = Some(total);
            log::debug!("{}: stack offset resolved to {:#x}", self.op, total);
            return self.abort_spacebase_relative(data);
        }
        if self.proto.is_input_locked() {
            let param = operand_slot
                .and_then(|slot| slot.checked_sub(1))
                .and_then(|i| self.proto.param(i))
                .ok_or_else(|| ProtoError::inconsistent("stack placeholder does not line up with locked parameter"))?;
            let addr = param
                .addr()
                .ok_or_else(|| ProtoError::inconsistent("locked parameter has no storage"))?;
            if addr.space() != space && space.is_spacebase() {
                return Err(ProtoError::inconsistent("stack placeholder does not match locked space"));
            }
            let offset = space.wrap_offset(total.wrapping_sub(addr.offset()));
            self.stack_offset = Some(offset);
            log::debug!("{}: stack offset resolved to {:#x} from locked parameter", self.op, offset);
            return Ok(());
        }
        Err(ProtoError::inconsistent("unresolved stack placeholder"))
    }

    /// Removes the placeholder operand, and the load that produced it when
    /// nothing else reads it.
    pub fn abort_spacebase_relative(&mut self, data: &mut Funcdata) -> Result<()> {
        let Some(slot) = self.stack_placeholder_slot else {
            return Ok(());
        };
        let vn = data.op_input(self.op, slot)?;
        data.op_remove_input(self.op, slot)?;
        self.clear_stack_placeholder_slot();
        let varnode = data.varnode(vn);
        if varnode.has_no_descend() && varnode.addr().space().is_internal() {
            if let Some(def) = varnode.def() {
                data.op_destroy(def)?;
            }
        }
        Ok(())
    }

    // ==================== Input recovery ====================

    /// Classifies every unchecked input trial from caller-side evidence.
    ///
    /// Trials found definitely unused have their operand replaced by a
    /// zero constant so the original data-flow is released.
    pub fn check_input_trial_use(
        &mut self,
        data: &mut Funcdata,
        heur: &dyn CallerHeuristics,
        config: &RecoveryConfig,
    ) -> Result<()> {
        let op = self.op;
        if data.op(op).is_dead() {
            return Err(ProtoError::inconsistent(format!("call {} is in dead code", op)));
        }
        let max_level = config.trim_recurse_max;
        // A callee that pops its own arguments, with a known pop size,
        // settles which stack trials are real.
        let callee_pop = match (self.proto.model(), self.proto.extra_pop()) {
            (Some(model), Some(pop)) if model.extra_pop().is_none() && pop > 4 => Some(i64::from(pop)),
            _ => None,
        };

        let mut ancestor = AncestorRealistic::new();
        let mut needs_final_check = false;
        for i in 0..self.active_input.num_trials() {
            let trial = &mut self.active_input.trials_mut()[i];
            if trial.is_checked() {
                continue;
            }
            let Some(slot) = trial.slot() else {
                continue;
            };
            let vn = data.op_input(op, slot)?;
            let (addr, size, is_input) = {
                let v = data.varnode(vn);
                (v.addr(), v.size(), v.is_input())
            };

            if addr.space().is_spacebase() {
                if heur.has_local_alias(data, vn) || !heur.in_local_range(&addr, 1) {
                    trial.mark_no_use();
                } else if let Some(expop) = callee_pop {
                    if trial.addr().space().signed_offset(trial.addr().offset()) + i64::from(trial.size()) - 1 < expop {
                        trial.mark_active();
                    } else {
                        trial.mark_no_use();
                    }
                } else if ancestor.execute(data, op, slot, trial, false) {
                    if heur.ancestor_op_use(data, max_level, vn, op, trial, 0) {
                        trial.mark_active();
                    } else {
                        trial.mark_inactive();
                    }
                } else {
                    trial.mark_no_use();
                }
            } else if ancestor.execute(data, op, slot, trial, true) {
                if heur.ancestor_op_use(data, max_level, vn, op, trial, 0) {
                    trial.mark_active();
                    if trial.has_cond_exe_effect() {
                        needs_final_check = true;
                    }
                } else {
                    trial.mark_inactive();
                }
            } else if is_input {
                // Unlikely, but possibly passed straight through.
                trial.mark_inactive();
            } else {
                trial.mark_no_use();
            }
            log::trace!("{}: {} -> {:?}", op, trial, trial.status());

            if trial.is_definitely_not_used() {
                let zero = data.new_constant(size, 0);
                data.op_set_input(op, zero, slot)?;
            }
        }
        if needs_final_check {
            self.active_input.mark_needs_final_check();
        }
        Ok(())
    }

    /// Rechecks active trials that were accepted on a conditional-execution
    /// exception, this time without the exception.
    pub fn final_input_check(&mut self, data: &Funcdata) {
        let mut ancestor = AncestorRealistic::new();
        for trial in self.active_input.trials_mut() {
            if !trial.is_active() || !trial.has_cond_exe_effect() {
                continue;
            }
            let Some(slot) = trial.slot() else {
                continue;
            };
            if !ancestor.execute(data, self.op, slot, trial, false) {
                log::debug!("{}: {} fails final check", self.op, trial);
                trial.mark_no_use();
            }
        }
    }

    /// Rebuilds the call's operands from the used trials.
    ///
    /// Unreferenced trials get a fresh varnode; operands wider than their
    /// trial are truncated through a `SUBPIECE`. Unused trials are then
    /// deleted and the rest renumbered to match the new operands.
    pub fn build_input_from_trials(&mut self, data: &mut Funcdata) -> Result<()> {
        let op = self.op;
        let op_addr = data.op(op).addr();
        let mut operands = vec![data.op_input(op, 0)?];
        let placeholder = self
            .stack_placeholder_slot
            .map(|slot| data.op_input(op, slot))
            .transpose()?;

        if self.proto.is_dotdotdot() && self.proto.is_input_locked() {
            self.active_input.sort_fixed_position();
        }

        for trial in self.active_input.trials().iter().filter(|t| t.is_used()) {
            let size = trial.size();
            let mut addr = trial.addr();
            let space = addr.space();
            if space.is_spacebase() {
                let base = self.stack_offset.unwrap_or(0);
                addr = Address::new(space, space.wrap_offset(base.wrapping_add(addr.offset())));
            }
            let vn = if trial.is_unref() {
                data.new_varnode(size, addr)
            } else {
                let slot = trial
                    .slot()
                    .ok_or_else(|| ProtoError::inconsistent("used trial has no operand"))?;
                let vn = data.op_input(op, slot)?;
                let (vaddr, vsize) = (data.varnode(vn).addr(), data.varnode(vn).size());
                if vsize > size {
                    let out_addr = if vaddr.space().is_big_endian() {
                        vaddr.add(i64::from(vsize - size))
                    } else {
                        vaddr
                    };
                    let zero = data.new_constant(4, 0);
                    let sub = data.new_op(OpCode::Subpiece, op_addr, &[vn, zero]);
                    let out = data.new_varnode_out(size, out_addr, sub)?;
                    data.op_insert_before(sub, op)?;
                    out
                } else {
                    vn
                }
            };
            operands.push(vn);
        }

        self.active_input.delete_unused_trials();
        if let Some(ph) = placeholder {
            operands.push(ph);
            self.stack_placeholder_slot = Some(operands.len() - 1);
            self.active_input.set_placeholder_slot();
        }
        log::debug!("{}: {} parameters recovered", op, self.active_input.num_trials());
        data.op_set_all_input(op, &operands)?;
        Ok(())
    }

    /// Replaces the input trials with the snapshot for the next pass.
    pub fn finish_input_pass(&mut self) {
        self.active_input = self.active_input.next_pass();
    }

    /// Runs one input pass and, once trials are fully checked, commits the
    /// parameter list. Returns true if anything changed.
    ///
    /// An indirect call is never committed on its first pass.
    pub fn run_input_pass(
        &mut self,
        data: &mut Funcdata,
        heur: &dyn CallerHeuristics,
        config: &RecoveryConfig,
    ) -> Result<bool> {
        if !self.input_active {
            return Ok(false);
        }
        let trimmable = self.active_input.num_passes() > 0 || data.op(self.op).code() != OpCode::CallInd;
        if !self.active_input.is_fully_checked() {
            self.check_input_trial_use(data, heur, config)?;
        }
        self.finish_input_pass();
        let mut changed = !self.active_input.is_fully_checked();

        if trimmable && self.active_input.is_fully_checked() {
            if self.active_input.needs_final_check() {
                self.final_input_check(data);
            }
            let model = self.proto.model().cloned().ok_or(ProtoError::MissingModel)?;
            model.derive_input_map(&mut self.active_input)?;
            self.build_input_from_trials(data)?;
            let operands = data.op(self.op).inputs()[1..].to_vec();
            self.proto.update_input_no_types(data, &operands, &self.active_input);
            self.clear_active_input();
            changed = true;
        }
        Ok(changed)
    }

    // ==================== Output recovery ====================

    /// Finds the indirect-creation varnode for each output trial. A trial
    /// whose varnode is never read has no entry.
    pub fn collect_output_trial_varnodes(&mut self, data: &Funcdata) -> Result<Vec<Option<VarnodeId>>> {
        if data.op(self.op).output().is_some() {
            return Err(ProtoError::inconsistent("output of call was determined prematurely"));
        }
        let mut found = vec![None; self.active_output.num_trials()];
        let mut cur = data.previous_op(self.op);
        while let Some(prev) = cur {
            let ind = data.op(prev);
            if ind.code() != OpCode::Indirect {
                break;
            }
            if ind.is_indirect_creation() {
                if let Some(out) = ind.output() {
                    let v = data.varnode(out);
                    if !v.has_no_descend() {
                        if let Some(idx) = self.active_output.which_trial(&v.addr(), v.size()) {
                            found[idx] = Some(out);
                            if let Some(trial) = self.active_output.trial_mut(idx) {
                                trial.set_address(v.addr(), v.size());
                            }
                        }
                    }
                }
            }
            cur = data.previous_op(prev);
        }
        Ok(found)
    }

    /// Marks output trials with a live varnode active and the rest
    /// inactive. A value that is never read may still be returned, so
    /// nothing is marked unused here.
    pub fn check_output_trial_use(&mut self, data: &Funcdata) -> Result<Vec<Option<VarnodeId>>> {
        let found = self.collect_output_trial_varnodes(data)?;
        for (trial, vn) in self.active_output.trials_mut().iter_mut().zip(&found) {
            if trial.is_checked() {
                return Err(ProtoError::inconsistent("output trial has been checked prematurely"));
            }
            if vn.is_some() {
                trial.mark_active();
            } else {
                trial.mark_inactive();
            }
        }
        Ok(found)
    }

    /// Moves the used output trials onto the call.
    ///
    /// A single trial becomes the output directly. Two trials form a wide
    /// value: an existing `PIECE` of exactly the two is reused, otherwise a
    /// join varnode is created and split back with `SUBPIECE`s.
    pub fn build_output_from_trials(
        &mut self,
        data: &mut Funcdata,
        found: &[Option<VarnodeId>],
        config: &RecoveryConfig,
    ) -> Result<()> {
        let op = self.op;
        let mut pieces = Vec::new();
        for trial in self.active_output.trials() {
            if !trial.is_used() {
                break;
            }
            let vn = trial
                .slot()
                .and_then(|slot| found.get(slot - 1).copied().flatten())
                .ok_or_else(|| ProtoError::inconsistent("used output trial has no varnode"))?;
            pieces.push(vn);
        }
        self.active_output.delete_unused_trials();

        let mut doomed = Vec::new();
        match pieces.as_slice() {
            [] => return Ok(()),
            &[single] => {
                doomed.extend(data.varnode(single).def());
                data.op_set_output(op, single)?;
            }
            &[lo, hi] => {
                if config.double_precision {
                    data.set_varnode_flags(lo, VarnodeFlags::PRECIS_LO);
                    data.set_varnode_flags(hi, VarnodeFlags::PRECIS_HI);
                }
                doomed.extend(data.varnode(hi).def());
                doomed.extend(data.varnode(lo).def());
                match find_preexisting_whole(data, hi, lo) {
                    Some(whole) => {
                        doomed.extend(data.varnode(whole).def());
                        data.op_set_output(op, whole)?;
                    }
                    None => {
                        let (hi_addr, hi_size) = (data.varnode(hi).addr(), data.varnode(hi).size());
                        let (lo_addr, lo_size) = (data.varnode(lo).addr(), data.varnode(lo).size());
                        let join = data.spaces_mut().construct_join_pair(hi_addr, hi_size, lo_addr, lo_size);
                        let whole = data.new_varnode(hi_size + lo_size, join);
                        data.op_set_output(op, whole)?;
                        let op_addr = data.op(op).addr();
                        let zero = data.new_constant(4, 0);
                        let sublo = data.new_op(OpCode::Subpiece, op_addr, &[whole, zero]);
                        data.op_set_output(sublo, lo)?;
                        data.op_insert_after(sublo, op)?;
                        let cut = data.new_constant(4, u64::from(lo_size));
                        let subhi = data.new_op(OpCode::Subpiece, op_addr, &[whole, cut]);
                        data.op_set_output(subhi, hi)?;
                        data.op_insert_after(subhi, op)?;
                    }
                }
            }
            _ => return Ok(()),
        }

        for dead in doomed {
            let inputs = data.op(dead).inputs().to_vec();
            data.op_destroy(dead)?;
            for vn in inputs {
                delete_if_free(data, vn)?;
            }
        }
        log::debug!("{}: output recovered from {} trial(s)", op, self.active_output.num_trials());
        Ok(())
    }

    /// Runs output recovery to completion. Returns true if it ran.
    pub fn run_output_pass(&mut self, data: &mut Funcdata, config: &RecoveryConfig) -> Result<bool> {
        if !self.output_active {
            return Ok(false);
        }
        let found = self.check_output_trial_use(data)?;
        let model = self.proto.model().cloned().ok_or(ProtoError::MissingModel)?;
        model.derive_output_map(&mut self.active_output)?;
        self.build_output_from_trials(data, &found, config)?;
        let outputs: Vec<_> = data.op(self.op).output().into_iter().collect();
        self.proto.update_output_no_types(data, &outputs);
        self.clear_active_output();
        Ok(true)
    }

    // ==================== Late restriction ====================

    fn transfer_locked_input_param(&self, param: &ProtoParameter) -> InputTransfer {
        let Some(start) = param.addr() else {
            return InputTransfer::Fail;
        };
        let last = start.add(i64::from(param.size().max(1)) - 1);
        for trial in self.active_input.trials() {
            if trial.addr().space() != start.space() || start < trial.addr() {
                continue;
            }
            let trial_end = trial.addr().add(i64::from(trial.size().max(1)) - 1);
            if trial_end < last {
                continue;
            }
            if trial.is_definitely_not_used() {
                return InputTransfer::Fail;
            }
            return trial.slot().map_or(InputTransfer::Fail, InputTransfer::Reuse);
        }
        if start.space().is_spacebase() {
            InputTransfer::StackLoad
        } else {
            InputTransfer::Fail
        }
    }

    /// Maps each locked parameter of `source` onto an existing operand, or
    /// onto a stack load when a stack reference is available.
    ///
    /// Fails if a parameter has no match, or if a live operand would be
    /// left without a parameter.
    pub fn transfer_locked_input(&self, data: &Funcdata, source: &FuncProto) -> Option<Vec<Option<VarnodeId>>> {
        let call = data.op(self.op);
        let mut inputs = Vec::with_capacity(source.num_params());
        let mut reused = HashSet::new();
        for param in source.params() {
            match self.transfer_locked_input_param(param) {
                InputTransfer::Reuse(slot) => {
                    inputs.push(Some(call.input(slot)?));
                    reused.insert(slot);
                }
                InputTransfer::StackLoad => {
                    self.get_spacebase_relative(data)?;
                    inputs.push(None);
                }
                InputTransfer::Fail => return None,
            }
        }
        if !source.is_dotdotdot() {
            let dropped = self.active_input.trials().iter().any(|t| {
                (t.is_active() || t.is_used()) && t.slot().is_some_and(|s| !reused.contains(&s))
            });
            if dropped {
                return None;
            }
        }
        Some(inputs)
    }

    /// Finds the existing varnode for the locked output of `source`. The
    /// outer `None` means failure; an inner `None` means nothing to move.
    pub fn transfer_locked_output(&self, data: &Funcdata, source: &FuncProto) -> Option<Option<VarnodeId>> {
        let param = source.output();
        if param.ty().is_void() {
            return Some(None);
        }
        let Some(addr) = param.addr() else {
            return Some(None);
        };
        let matches = |vn: VarnodeId| {
            let v = data.varnode(vn);
            v.size() == param.size() && addr.justified_contain(param.size(), &v.addr(), v.size(), false) == Some(0)
        };
        if let Some(out) = data.op(self.op).output() {
            return Some(matches(out).then_some(out));
        }
        let mut cur = data.previous_op(self.op);
        while let Some(prev) = cur {
            let ind = data.op(prev);
            if ind.code() != OpCode::Indirect {
                break;
            }
            if ind.is_indirect_creation() {
                if let Some(out) = ind.output().filter(|&o| matches(o)) {
                    return Some(Some(out));
                }
            }
            cur = data.previous_op(prev);
        }
        Some(None)
    }

    /// Tries to adopt `restricted` without invalidating the data-flow built
    /// so far. On success the prototype is replaced and the returned plan
    /// must be committed; on failure nothing changes.
    pub fn late_restriction(&mut self, data: &Funcdata, restricted: &FuncProto) -> Option<TransferPlan> {
        if !self.proto.has_model() {
            self.proto.copy(restricted);
            return Some(TransferPlan::default());
        }
        if !self.proto.is_compatible(restricted) {
            return None;
        }
        if restricted.is_dotdotdot() && !self.input_active {
            return None;
        }
        let mut plan = TransferPlan::default();
        if restricted.is_input_locked() {
            plan.inputs = Some(self.transfer_locked_input(data, restricted)?);
        }
        if restricted.is_output_locked() {
            plan.output = self.transfer_locked_output(data, restricted)?;
        }
        self.proto.copy(restricted);
        Some(plan)
    }

    /// Rewrites the operands for a locked prototype and restarts trials
    /// from its parameters, which are all active.
    pub fn commit_new_inputs(&mut self, data: &mut Funcdata, plan: &TransferPlan) -> Result<()> {
        if !self.proto.is_input_locked() {
            return Ok(());
        }
        let Some(inputs) = &plan.inputs else {
            return Ok(());
        };
        if inputs.len() != self.proto.num_params() {
            return Err(ProtoError::inconsistent("transferred operands do not match locked parameters"));
        }
        let op = self.op;
        let stackref = self.get_spacebase_relative(data);
        let mut placeholder = self
            .stack_placeholder_slot
            .map(|slot| data.op_input(op, slot))
            .transpose()?;
        self.stack_placeholder_slot = None;
        // Until the stack offset is known, the first stack parameter stands
        // in for the placeholder.
        let mut needs_placeholder = placeholder.is_some() || self.stack_offset.is_none();
        let num_passes = self.active_input.num_passes();
        self.active_input.clear();

        let mut operands = vec![data.op_input(op, 0)?];
        for (i, existing) in inputs.iter().enumerate() {
            let (addr, size) = self
                .proto
                .param(i)
                .and_then(|p| Some((p.addr()?, p.size())))
                .ok_or_else(|| ProtoError::inconsistent("locked parameter has no storage"))?;
            let vn = match *existing {
                Some(vn) => vn,
                None => {
                    let stackref = stackref.ok_or_else(|| ProtoError::inconsistent("no stack reference for locked parameter"))?;
                    data.op_stack_load(addr.space().index(), addr.offset(), size, op, Some(stackref))?
                }
            };
            self.active_input.register_trial(addr, size);
            if let Some(trial) = self.active_input.trial_mut(i) {
                trial.mark_active();
            }
            if needs_placeholder && addr.space().is_spacebase() {
                data.set_varnode_flags(vn, VarnodeFlags::SPACEBASE_PLACEHOLDER);
                needs_placeholder = false;
                placeholder = None;
            }
            operands.push(vn);
        }
        if let Some(ph) = placeholder {
            operands.push(ph);
            self.set_stack_placeholder_slot(operands.len() - 1);
        }
        data.op_set_all_input(op, &operands)?;
        if !self.proto.is_dotdotdot() {
            self.clear_active_input();
        } else if num_passes > 0 {
            self.active_input.finish_pass();
        }
        Ok(())
    }

    /// Moves the planned output varnode onto the call.
    pub fn commit_new_outputs(&mut self, data: &mut Funcdata, plan: &TransferPlan) -> Result<()> {
        if !self.proto.is_output_locked() {
            return Ok(());
        }
        self.active_output.clear();
        let Some(out) = plan.output else {
            return Ok(());
        };
        let (addr, size) = match self.proto.output().addr() {
            Some(addr) => (addr, self.proto.output().size()),
            None => return Ok(()),
        };
        self.active_output.register_trial(addr, size);
        let def = data.varnode(out).def();
        if def != Some(self.op) {
            if let Some(ind) = def {
                let inputs = data.op(ind).inputs().to_vec();
                data.op_unset_output(ind)?;
                data.op_destroy(ind)?;
                for vn in inputs {
                    delete_if_free(data, vn)?;
                }
            }
            data.op_set_output(self.op, out)?;
        }
        Ok(())
    }

    /// Turns an indirect call into a direct call of `entry`, adopting the
    /// callee's prototype if that can be done safely.
    ///
    /// The override is recorded either way. If the prototype cannot be
    /// adopted the call is left untouched, a restart is requested and
    /// `false` is returned.
    pub fn deindirect(
        &mut self,
        data: &mut Funcdata,
        name: impl Into<String>,
        entry: Address,
        callee: &FuncProto,
    ) -> Result<bool> {
        self.entry = Some(entry);
        self.name = name.into();
        let call_addr = data.op(self.op).addr();
        data.set_indirect_override(call_addr, entry);

        if !callee.is_no_return() && !callee.is_inline() {
            if self.proto.is_override() {
                self.convert_to_direct(data, entry)?;
                return Ok(true);
            }
            if let Some(plan) = self.late_restriction(data, callee) {
                self.convert_to_direct(data, entry)?;
                self.commit_new_inputs(data, &plan)?;
                self.commit_new_outputs(data, &plan)?;
                return Ok(true);
            }
        }
        log::debug!("{}: cannot adopt prototype of {}, restarting", self.op, self.name);
        data.set_restart_pending(true);
        Ok(false)
    }

    fn convert_to_direct(&mut self, data: &mut Funcdata, entry: Address) -> Result<()> {
        let target = data.new_varnode(1, entry);
        data.op_set_input(self.op, target, 0)?;
        data.op_set_opcode(self.op, OpCode::Call)?;
        Ok(())
    }

    /// Forces `proto` onto this call. If it cannot be adopted without
    /// breaking the data-flow a restart is requested. The prototype ends up
    /// input-locked and marked as an override either way.
    pub fn force_set(&mut self, data: &mut Funcdata, proto: &FuncProto) -> Result<bool> {
        let adopted = match self.late_restriction(data, proto) {
            Some(plan) => {
                self.commit_new_inputs(data, &plan)?;
                self.commit_new_outputs(data, &plan)?;
                true
            }
            None => {
                data.set_restart_pending(true);
                false
            }
        };
        self.proto.set_input_lock(true);
        self.proto.set_input_errors(proto.has_input_errors());
        self.proto.set_output_errors(proto.has_output_errors());
        self.proto.set_override(true);
        Ok(adopted)
    }

    // ==================== Joins ====================

    /// Returns true if operands `slot1` and `slot1 + 1`, currently `vn1`
    /// and `vn2`, may be joined into a single parameter.
    pub fn check_input_join(&self, data: &Funcdata, slot1: usize, is_hi_slot: bool, vn1: VarnodeId, vn2: VarnodeId) -> bool {
        if self.input_active {
            return false;
        }
        let (Some(first), Some(second)) = (
            self.active_input.trial_for_operand(slot1),
            self.active_input.trial_for_operand(slot1 + 1),
        ) else {
            return false;
        };
        if first.size() != data.varnode(vn1).size() || second.size() != data.varnode(vn2).size() {
            return false;
        }
        let (hi, lo) = if is_hi_slot { (first, second) } else { (second, first) };
        self.proto.check_input_join(&hi.addr(), hi.size(), &lo.addr(), lo.size())
    }

    /// Merges the trials for operands `slot1` and `slot1 + 1` into one
    /// trial on their join address. The caller replaces the two operands.
    pub fn do_input_join(&mut self, data: &mut Funcdata, slot1: usize, is_hi_slot: bool) -> Result<()> {
        if self.proto.is_input_locked() {
            return Err(ProtoError::inconsistent("trying to join parameters on locked function prototype"));
        }
        let (first, second) = match (
            self.active_input.trial_for_operand(slot1),
            self.active_input.trial_for_operand(slot1 + 1),
        ) {
            (Some(a), Some(b)) => ((a.addr(), a.size()), (b.addr(), b.size())),
            _ => return Err(ProtoError::inconsistent("no trials to join")),
        };
        let ((hi, hi_size), (lo, lo_size)) = if is_hi_slot { (first, second) } else { (second, first) };
        let join = data.spaces_mut().construct_join_pair(hi, hi_size, lo, lo_size);
        self.active_input.join_trial(slot1, join, hi_size + lo_size)
    }

    // ==================== Parameter shift ====================

    /// Inserts the synthetic leading parameters into the prototype.
    pub fn paramshift_modify_start(&mut self) -> Result<()> {
        if self.paramshift == 0 {
            return Ok(());
        }
        self.proto.param_shift(self.paramshift)
    }

    /// Removes the synthetic leading parameters from the prototype and the
    /// call's operands. Returns true if it did anything.
    pub fn paramshift_modify_stop(&mut self, data: &mut Funcdata) -> Result<bool> {
        if self.paramshift == 0 || self.proto.is_paramshift_applied() {
            return Ok(false);
        }
        self.proto.set_paramshift_applied(true);
        if data.op(self.op).num_inputs() < self.paramshift + 1 {
            return Err(ProtoError::inconsistent("paramshift mechanism is confused"));
        }
        for _ in 0..self.paramshift {
            data.op_remove_input(self.op, 1)?;
            self.proto.remove_param(0);
        }
        Ok(true)
    }

    // ==================== Consumption ====================

    /// Bytes of the operand in `slot` known to be consumed; 0 if unknown.
    pub fn input_bytes_consumed(&self, slot: usize) -> u32 {
        self.input_consume.get(slot).copied().unwrap_or(0)
    }

    /// Records that only `val` bytes of the operand in `slot` are read.
    /// Keeps the smallest value and returns true if it changed.
    pub fn set_input_bytes_consumed(&mut self, slot: usize, val: u32) -> bool {
        if self.input_consume.len() <= slot {
            self.input_consume.resize(slot + 1, 0);
        }
        let old = self.input_consume[slot];
        if old == 0 || val < old {
            self.input_consume[slot] = val;
            return true;
        }
        false
    }
}

/// Sets the match count of every call to the number of calls sharing its
/// entry point. Calls with no known entry count only themselves.
pub fn count_matching_calls(calls: &mut [FuncCallSpecs]) {
    let mut counts: IndexMap<Address, usize> = IndexMap::new();
    for entry in calls.iter().filter_map(FuncCallSpecs::entry) {
        *counts.entry(entry).or_insert(0) += 1;
    }
    for call in calls.iter_mut() {
        call.match_call_count = call
            .entry
            .and_then(|e| counts.get(&e).copied())
            .unwrap_or(1);
    }
}

/// The output of a `PIECE` that is the only reader of both `hi` and `lo`.
fn find_preexisting_whole(data: &Funcdata, hi: VarnodeId, lo: VarnodeId) -> Option<VarnodeId> {
    let op1 = data.lone_descend(hi)?;
    let op2 = data.lone_descend(lo)?;
    if op1 != op2 {
        return None;
    }
    let piece = data.op(op1);
    if piece.code() != OpCode::Piece {
        return None;
    }
    piece.output()
}

fn delete_if_free(data: &mut Funcdata, vn: VarnodeId) -> Result<()> {
    let v = data.varnode(vn);
    if !v.is_written() && v.has_no_descend() && !v.is_input() && !v.is_deleted() {
        data.delete_varnode(vn)?;
    }
    Ok(())
}

impl fmt::Display for FuncCallSpecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.op)?;
        if self.name.is_empty() {
            write!(f, "<unknown>")?;
        } else {
            write!(f, "{}", self.name)?;
        }
        if let Some(entry) = self.entry {
            write!(f, " @ {}", entry)?;
        }
        write!(f, " {}", self.proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ParamEntry;
    use crate::heuristics::DefaultHeuristics;
    use crate::model::{ProtoModel, StandardModel};
    use crate::proto::PrototypePieces;
    use crate::types::{DataType, TypeClass};
    use protorec_core::{AddrSpace, BlockId, SpaceManager};
    use std::sync::Arc;

    struct Fixture {
        fd: Funcdata,
        regs: AddrSpace,
        stack: AddrSpace,
        ram: AddrSpace,
        block: BlockId,
        model: Arc<dyn ProtoModel>,
    }

    fn fixture() -> Fixture {
        let mut spaces = SpaceManager::standard(false, 4);
        let regs = spaces.space_by_name("register").unwrap();
        let stack = spaces.space_by_name("stack").unwrap();
        let ram = spaces.space_by_name("ram").unwrap();
        let pair = spaces.construct_join_pair(Address::new(regs, 4), 4, Address::new(regs, 0), 4);
        let model = StandardModel::builder("cdecl")
            .input(ParamEntry::exclusive(regs, 0, 4).with_type_class(TypeClass::General))
            .input(ParamEntry::exclusive(regs, 4, 4).with_type_class(TypeClass::General))
            .input(ParamEntry::sliced(stack, 4, 64, 4))
            .output(ParamEntry::exclusive(regs, 0, 4).with_type_class(TypeClass::General))
            .output(ParamEntry::join(pair, 8))
            .stack_space(stack)
            .build(&spaces)
            .unwrap();
        let mut fd = Funcdata::new("caller", Address::new(ram, 0x1000), spaces);
        let block = fd.new_block();
        Fixture {
            fd,
            regs,
            stack,
            ram,
            block,
            model: Arc::new(model),
        }
    }

    impl Fixture {
        /// Writes a constant into `[addr, addr+size)` at the end of the block.
        fn define(&mut self, addr: Address, size: u32, value: u64) -> VarnodeId {
            let c = self.fd.new_constant(size, value);
            let copy = self.fd.new_op(OpCode::Copy, Address::new(self.ram, 0x1000), &[c]);
            let vn = self.fd.new_varnode_out(size, addr, copy).unwrap();
            self.fd.op_insert_end(copy, self.block).unwrap();
            vn
        }

        fn call(&mut self, code: OpCode) -> OpId {
            let target = if code == OpCode::Call {
                self.fd.new_varnode(1, Address::new(self.ram, 0x2000))
            } else {
                self.fd.new_unique(4)
            };
            let call = self.fd.new_op(code, Address::new(self.ram, 0x1010), &[target]);
            self.fd.op_insert_end(call, self.block).unwrap();
            call
        }

        fn specs(&self, call: OpId) -> FuncCallSpecs {
            self.specs_with(call, Arc::clone(&self.model))
        }

        fn specs_with(&self, call: OpId, model: Arc<dyn ProtoModel>) -> FuncCallSpecs {
            let proto = FuncProto::with_model(model);
            FuncCallSpecs::new(&self.fd, call, proto, &RecoveryConfig::default()).unwrap()
        }
    }

    #[test]
    fn test_new_requires_call() {
        let mut fx = fixture();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 1);
        let copy = fx.fd.varnode(r0).def().unwrap();
        let proto = FuncProto::new();
        assert!(FuncCallSpecs::new(&fx.fd, copy, proto, &RecoveryConfig::default()).is_err());

        let call = fx.call(OpCode::Call);
        let specs = fx.specs(call);
        assert_eq!(specs.entry(), Some(Address::new(fx.ram, 0x2000)));
        assert_eq!(specs.effective_extra_pop(), Some(0));
    }

    #[test]
    fn test_input_recovery_drops_unused_trial() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 7);
        let r1 = fx.fd.new_input(4, Address::new(fx.regs, 4));
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);

        specs.init_active_input(&config);
        assert_eq!(specs.add_input_trial(&mut fx.fd, r0).unwrap(), 1);
        assert_eq!(specs.add_input_trial(&mut fx.fd, r1).unwrap(), 2);

        let heur = DefaultHeuristics::new();
        assert!(specs.run_input_pass(&mut fx.fd, &heur, &config).unwrap());
        assert!(!specs.is_input_active());
        // r1 is an untouched input: inactive, so it is not kept.
        assert_eq!(&fx.fd.op(call).inputs()[1..], &[r0]);
        assert_eq!(specs.proto().num_params(), 1);
        assert_eq!(specs.proto().param(0).unwrap().addr(), Some(Address::new(fx.regs, 0)));
        assert!(!specs.run_input_pass(&mut fx.fd, &heur, &config).unwrap());
    }

    #[test]
    fn test_indirect_call_waits_one_pass() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 7);
        let call = fx.call(OpCode::CallInd);
        let mut specs = fx.specs(call);
        specs.init_active_input(&config);
        specs.add_input_trial(&mut fx.fd, r0).unwrap();

        let heur = DefaultHeuristics::new();
        assert!(!specs.run_input_pass(&mut fx.fd, &heur, &config).unwrap());
        assert!(specs.is_input_active());
        assert!(specs.active_input().is_fully_checked());
        assert!(specs.run_input_pass(&mut fx.fd, &heur, &config).unwrap());
        assert!(!specs.is_input_active());
        assert_eq!(specs.proto().num_params(), 1);
    }

    #[test]
    fn test_no_use_operand_replaced_by_zero() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 7);
        // The second value is a pass-through of an unaffected register.
        let saved = fx.fd.new_input(4, Address::new(fx.regs, 4));
        fx.fd.set_varnode_flags(saved, VarnodeFlags::UNAFFECTED);
        let iop = fx.fd.new_constant(4, 0);
        let ind = fx.fd.new_op(OpCode::Indirect, Address::new(fx.ram, 0x1004), &[saved, iop]);
        let r1 = fx.fd.new_varnode_out(4, Address::new(fx.regs, 4), ind).unwrap();
        fx.fd.op_insert_end(ind, fx.block).unwrap();
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);
        specs.init_active_input(&config);
        specs.add_input_trial(&mut fx.fd, r0).unwrap();
        specs.add_input_trial(&mut fx.fd, r1).unwrap();

        specs
            .check_input_trial_use(&mut fx.fd, &DefaultHeuristics::new(), &config)
            .unwrap();
        assert!(specs.active_input().trial(0).unwrap().is_active());
        assert!(specs.active_input().trial(1).unwrap().is_definitely_not_used());
        let replaced = fx.fd.op(call).input(2).unwrap();
        assert_eq!(fx.fd.varnode(replaced).constant_value(), Some(0));
        assert!(fx.fd.varnode(r1).has_no_descend());
    }

    #[test]
    fn test_output_single_and_join() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);
        specs.init_active_output(&config);
        let out0 = specs.add_output_trial(&mut fx.fd, Address::new(fx.regs, 0), 4).unwrap();
        let out1 = specs.add_output_trial(&mut fx.fd, Address::new(fx.regs, 4), 4).unwrap();
        // Both halves are read after the call.
        let ret = fx.fd.new_op(OpCode::Return, Address::new(fx.ram, 0x1020), &[out0, out1]);
        fx.fd.op_insert_end(ret, fx.block).unwrap();

        assert!(specs.run_output_pass(&mut fx.fd, &config).unwrap());
        let whole = fx.fd.op(call).output().unwrap();
        assert_eq!(fx.fd.varnode(whole).size(), 8);
        assert!(fx.fd.varnode(whole).addr().space().is_join());
        let lo_def = fx.fd.def_op(out0).unwrap();
        assert_eq!(lo_def.code(), OpCode::Subpiece);
        let hi_def = fx.fd.def_op(out1).unwrap();
        assert_eq!(fx.fd.varnode(hi_def.input(1).unwrap()).constant_value(), Some(4));
        assert_eq!(specs.proto().output().size(), 8);

        let mut fx = fixture();
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);
        specs.init_active_output(&config);
        let out0 = specs.add_output_trial(&mut fx.fd, Address::new(fx.regs, 0), 4).unwrap();
        specs.add_output_trial(&mut fx.fd, Address::new(fx.regs, 4), 4).unwrap();
        let ret = fx.fd.new_op(OpCode::Return, Address::new(fx.ram, 0x1020), &[out0]);
        fx.fd.op_insert_end(ret, fx.block).unwrap();
        specs.run_output_pass(&mut fx.fd, &config).unwrap();
        assert_eq!(fx.fd.op(call).output(), Some(out0));
        assert_eq!(fx.fd.varnode(out0).def(), Some(call));
        assert_eq!(specs.active_output().num_trials(), 1);
    }

    #[test]
    fn test_output_reuses_piece() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);
        specs.init_active_output(&config);
        let lo = specs.add_output_trial(&mut fx.fd, Address::new(fx.regs, 0), 4).unwrap();
        let hi = specs.add_output_trial(&mut fx.fd, Address::new(fx.regs, 4), 4).unwrap();
        let piece = fx.fd.new_op(OpCode::Piece, Address::new(fx.ram, 0x1014), &[hi, lo]);
        let whole = fx.fd.new_unique_out(8, piece).unwrap();
        fx.fd.op_insert_end(piece, fx.block).unwrap();
        let ret = fx.fd.new_op(OpCode::Return, Address::new(fx.ram, 0x1020), &[whole]);
        fx.fd.op_insert_end(ret, fx.block).unwrap();

        specs.run_output_pass(&mut fx.fd, &config).unwrap();
        assert_eq!(fx.fd.op(call).output(), Some(whole));
        assert!(fx.fd.op(piece).is_dead());
        assert!(fx.fd.varnode(lo).is_deleted());
        assert!(fx.fd.varnode(hi).is_deleted());
    }

    #[test]
    fn test_stack_placeholder_resolution() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 7);
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);
        specs.init_active_input(&config);
        specs.add_input_trial(&mut fx.fd, r0).unwrap();
        // Stack pointer is 0x20 below the frame base at the call.
        let sp = fx.fd.new_varnode(4, Address::new(fx.stack, 0xffff_ffe0));
        let ph = specs.init_stack_placeholder(&mut fx.fd, Some(sp)).unwrap();
        assert_eq!(specs.stack_placeholder_slot(), Some(2));
        assert_eq!(specs.active_input().placeholder_slot(), Some(2));
        assert_eq!(specs.get_spacebase_relative(&fx.fd), Some(sp));

        specs.resolve_spacebase_relative(&mut fx.fd, ph).unwrap();
        assert_eq!(specs.stack_offset(), Some(0xffff_ffe0));
        assert_eq!(specs.stack_placeholder_slot(), None);
        assert_eq!(fx.fd.op(call).num_inputs(), 2);
        assert!(fx.fd.varnode(ph).is_deleted());
        assert!(fx.fd.warnings().is_empty());
    }

    #[test]
    fn test_force_set_locks() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 7);
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);
        specs.init_active_input(&config);
        specs.add_input_trial(&mut fx.fd, r0).unwrap();

        let mut forced = FuncProto::new();
        forced
            .set_pieces(
                &PrototypePieces::new(DataType::void())
                    .with_model(Arc::clone(&fx.model))
                    .input("a", DataType::int(4, true)),
            )
            .unwrap();
        assert!(specs.force_set(&mut fx.fd, &forced).unwrap());
        assert!(specs.proto().is_input_locked());
        assert!(specs.proto().is_override());
        assert!(!specs.is_input_active());
        assert_eq!(&fx.fd.op(call).inputs()[1..], &[r0]);
        assert!(specs.active_input().trial(0).unwrap().is_active());
    }

    #[test]
    fn test_commit_flags_first_stack_param_without_placeholder() {
        for resolved in [false, true] {
            let mut fx = fixture();
            let config = RecoveryConfig::default();
            let r0 = fx.define(Address::new(fx.regs, 0), 4, 1);
            let r1 = fx.define(Address::new(fx.regs, 4), 4, 2);
            let s = fx.define(Address::new(fx.stack, 4), 4, 3);
            let call = fx.call(OpCode::Call);
            let mut specs = fx.specs(call);
            specs.init_active_input(&config);
            for vn in [r0, r1, s] {
                specs.add_input_trial(&mut fx.fd, vn).unwrap();
            }
            if resolved {
                specs.set_stack_offset(Some(0));
            }
            assert_eq!(specs.stack_placeholder_slot(), None);

            let mut pieces = PrototypePieces::new(DataType::void()).with_model(Arc::clone(&fx.model));
            for name in ["a", "b", "c"] {
                pieces = pieces.input(name, DataType::int(4, true));
            }
            let mut locked = FuncProto::new();
            locked.set_pieces(&pieces).unwrap();
            assert!(specs.force_set(&mut fx.fd, &locked).unwrap());

            assert_eq!(&fx.fd.op(call).inputs()[1..], &[r0, r1, s]);
            assert_eq!(fx.fd.varnode(s).is_spacebase_placeholder(), !resolved);
            assert!(!fx.fd.varnode(r0).is_spacebase_placeholder());
            assert!(!fx.fd.varnode(r1).is_spacebase_placeholder());
            assert_eq!(specs.stack_placeholder_slot(), None);
        }
    }

    #[test]
    fn test_callee_pop_reads_stack_offsets_signed() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let below = fx.define(Address::new(fx.stack, 0xffff_fffc), 4, 1);
        let above = fx.define(Address::new(fx.stack, 8), 4, 2);
        let call = fx.call(OpCode::Call);
        let unknown_pop = StandardModel::builder("stdcall")
            .input(ParamEntry::sliced(fx.stack, 4, 64, 4))
            .output(ParamEntry::exclusive(fx.regs, 0, 4))
            .stack_space(fx.stack)
            .extra_pop(None)
            .build(fx.fd.spaces())
            .unwrap();
        let mut specs = fx.specs_with(call, Arc::new(unknown_pop));
        specs.proto_mut().set_extra_pop(Some(8));
        specs.init_active_input(&config);
        specs.add_input_trial(&mut fx.fd, below).unwrap();
        specs.add_input_trial(&mut fx.fd, above).unwrap();

        specs
            .check_input_trial_use(&mut fx.fd, &DefaultHeuristics::new(), &config)
            .unwrap();
        assert!(specs.active_input().trial(0).unwrap().is_active());
        assert!(specs.active_input().trial(1).unwrap().is_definitely_not_used());
    }

    #[test]
    fn test_paramshift() {
        let mut fx = fixture();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 7);
        let r1 = fx.define(Address::new(fx.regs, 4), 4, 8);
        let call = fx.call(OpCode::Call);
        fx.fd.op_insert_input(call, r0, 1).unwrap();
        fx.fd.op_insert_input(call, r1, 2).unwrap();
        let mut specs = fx.specs(call);
        specs.set_paramshift(1);
        specs.paramshift_modify_start().unwrap();
        assert_eq!(specs.proto().num_params(), 1);
        assert!(specs.paramshift_modify_stop(&mut fx.fd).unwrap());
        assert_eq!(specs.proto().num_params(), 0);
        assert_eq!(&fx.fd.op(call).inputs()[1..], &[r1]);
        assert!(!specs.paramshift_modify_stop(&mut fx.fd).unwrap());
    }

    #[test]
    fn test_input_join() {
        let mut fx = fixture();
        let config = RecoveryConfig::default();
        let r0 = fx.define(Address::new(fx.regs, 0), 4, 7);
        let r1 = fx.define(Address::new(fx.regs, 4), 4, 8);
        let call = fx.call(OpCode::Call);
        // Registers handed out in 4-byte slices, so neighbours may pair up.
        let sliced = StandardModel::builder("sliced")
            .input(ParamEntry::sliced(fx.regs, 0, 16, 4))
            .output(ParamEntry::exclusive(fx.regs, 0, 4))
            .build(fx.fd.spaces())
            .unwrap();
        let mut specs = fx.specs_with(call, Arc::new(sliced));
        specs.init_active_input(&config);
        specs.add_input_trial(&mut fx.fd, r1).unwrap();
        specs.add_input_trial(&mut fx.fd, r0).unwrap();
        assert!(!specs.check_input_join(&fx.fd, 1, true, r1, r0));
        specs.clear_active_input();
        assert!(specs.check_input_join(&fx.fd, 1, true, r1, r0));
        assert!(!specs.check_input_join(&fx.fd, 1, true, r0, fx.fd.op(call).input(0).unwrap()));

        specs.do_input_join(&mut fx.fd, 1, true).unwrap();
        assert_eq!(specs.active_input().num_trials(), 1);
        let joined = specs.active_input().trial(0).unwrap();
        assert_eq!(joined.size(), 8);
        assert!(joined.addr().space().is_join());
    }

    #[test]
    fn test_count_matching_calls() {
        let mut fx = fixture();
        let a = fx.call(OpCode::Call);
        let b = fx.call(OpCode::Call);
        let c = fx.call(OpCode::CallInd);
        let mut calls = vec![fx.specs(a), fx.specs(b), fx.specs(c)];
        count_matching_calls(&mut calls);
        let counts: Vec<_> = calls.iter().map(FuncCallSpecs::match_call_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_bytes_consumed() {
        let mut fx = fixture();
        let call = fx.call(OpCode::Call);
        let mut specs = fx.specs(call);
        assert_eq!(specs.input_bytes_consumed(3), 0);
        assert!(specs.set_input_bytes_consumed(3, 4));
        assert!(!specs.set_input_bytes_consumed(3, 8));
        assert!(specs.set_input_bytes_consumed(3, 1));
        assert_eq!(specs.input_bytes_consumed(3), 1);
        assert!(specs.to_string().starts_with(&format!("{}: <unknown> @ ram:0x2000", call)));
    }
}
