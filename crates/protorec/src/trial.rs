//! Candidate parameter bindings and their per-call containers.

use std::cmp::Ordering;
use std::fmt;

use bitflags::bitflags;
use protorec_core::Address;

use crate::entry::ParamEntry;
use crate::error::{ProtoError, Result};

/// Activity status of a trial within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialStatus {
    /// Not yet examined this pass.
    Unchecked,
    /// Looks like a real parameter.
    Active,
    /// Not enough evidence either way.
    Inactive,
    /// Definitely not a parameter.
    NoUse,
    /// Synthesized to fill a gap; no operand backs it.
    Unreferenced,
}

bitflags! {
    /// Evidence gathered about a trial.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TrialFlags: u32 {
        /// Chosen as part of the final prototype.
        const USED = 1 << 0;
        /// The storage is probably overwritten by the callee.
        const KILLED_BY_CALL = 1 << 1;
        /// Formed by truncating a remainder operation.
        const REM_FORMED = 1 << 2;
        /// Reached through an indirect creation.
        const IND_CREATE_FORMED = 1 << 3;
        /// Acceptance depended on conditional execution and needs a recheck.
        const CONDEXE_EFFECT = 1 << 4;
        /// Data-flow ancestry looks like parameter data.
        const ANCESTOR_REALISTIC = 1 << 5;
        /// Ancestry includes solid movement into the storage.
        const ANCESTOR_SOLID = 1 << 6;
        /// No operand backs the trial.
        const UNREF = 1 << 7;
    }
}

/// A candidate binding of one call operand to a parameter slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamTrial {
    addr: Address,
    size: u32,
    slot: Option<usize>,
    status: TrialStatus,
    flags: TrialFlags,
    entry: Option<usize>,
    offset: Option<u32>,
    fixed_position: Option<usize>,
}

impl ParamTrial {
    /// Creates an unchecked trial for the operand in `slot`.
    pub fn new(addr: Address, size: u32, slot: usize) -> Self {
        Self {
            addr,
            size,
            slot: Some(slot),
            status: TrialStatus::Unchecked,
            flags: TrialFlags::empty(),
            entry: None,
            offset: None,
            fixed_position: None,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Operand slot on the call, or `None` for an unreferenced trial.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn set_slot(&mut self, slot: usize) {
        self.slot = Some(slot);
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn flags(&self) -> TrialFlags {
        self.flags
    }

    /// Index of the model entry this trial maps to.
    pub fn entry(&self) -> Option<usize> {
        self.entry
    }

    /// Justified offset of the trial within its entry.
    pub fn offset(&self) -> Option<u32> {
        self.offset
    }

    pub fn set_entry(&mut self, entry: Option<usize>, offset: u32) {
        self.entry = entry;
        self.offset = entry.map(|_| offset);
    }

    pub fn set_address(&mut self, addr: Address, size: u32) {
        self.addr = addr;
        self.size = size;
    }

    pub fn fixed_position(&self) -> Option<usize> {
        self.fixed_position
    }

    pub fn set_fixed_position(&mut self, pos: usize) {
        self.fixed_position = Some(pos);
    }

    // ==================== Status ====================

    pub fn mark_active(&mut self) {
        self.status = TrialStatus::Active;
    }

    pub fn mark_inactive(&mut self) {
        self.status = TrialStatus::Inactive;
    }

    pub fn mark_no_use(&mut self) {
        self.status = TrialStatus::NoUse;
        self.flags.remove(TrialFlags::USED);
    }

    pub fn mark_unreferenced(&mut self) {
        self.status = TrialStatus::Unreferenced;
        self.flags |= TrialFlags::UNREF;
        self.slot = None;
    }

    pub fn mark_used(&mut self) {
        self.flags |= TrialFlags::USED;
    }

    pub fn mark_killed_by_call(&mut self) {
        self.flags |= TrialFlags::KILLED_BY_CALL;
    }

    pub fn set_rem_formed(&mut self) {
        self.flags |= TrialFlags::REM_FORMED;
    }

    pub fn set_ind_create_formed(&mut self) {
        self.flags |= TrialFlags::IND_CREATE_FORMED;
    }

    pub fn set_cond_exe_effect(&mut self) {
        self.flags |= TrialFlags::CONDEXE_EFFECT;
    }

    pub fn set_ancestor_realistic(&mut self) {
        self.flags |= TrialFlags::ANCESTOR_REALISTIC;
    }

    pub fn set_ancestor_solid(&mut self) {
        self.flags |= TrialFlags::ANCESTOR_SOLID;
    }

    pub fn is_checked(&self) -> bool {
        self.status != TrialStatus::Unchecked
    }

    pub fn is_active(&self) -> bool {
        self.status == TrialStatus::Active
    }

    pub fn is_definitely_not_used(&self) -> bool {
        self.status == TrialStatus::NoUse
    }

    pub fn is_used(&self) -> bool {
        self.flags.contains(TrialFlags::USED)
    }

    pub fn is_unref(&self) -> bool {
        self.flags.contains(TrialFlags::UNREF)
    }

    pub fn is_killed_by_call(&self) -> bool {
        self.flags.contains(TrialFlags::KILLED_BY_CALL)
    }

    pub fn is_rem_formed(&self) -> bool {
        self.flags.contains(TrialFlags::REM_FORMED)
    }

    pub fn is_ind_create_formed(&self) -> bool {
        self.flags.contains(TrialFlags::IND_CREATE_FORMED)
    }

    pub fn has_cond_exe_effect(&self) -> bool {
        self.flags.contains(TrialFlags::CONDEXE_EFFECT)
    }

    pub fn has_ancestor_realistic(&self) -> bool {
        self.flags.contains(TrialFlags::ANCESTOR_REALISTIC)
    }

    pub fn has_ancestor_solid(&self) -> bool {
        self.flags.contains(TrialFlags::ANCESTOR_SOLID)
    }

    /// Clears per-pass evidence, keeping terminal and structural facts.
    fn reset_for_pass(&mut self) {
        if matches!(self.status, TrialStatus::Active | TrialStatus::Inactive) {
            self.status = TrialStatus::Unchecked;
        }
        self.flags.remove(
            TrialFlags::ANCESTOR_REALISTIC
                | TrialFlags::ANCESTOR_SOLID
                | TrialFlags::CONDEXE_EFFECT
                | TrialFlags::IND_CREATE_FORMED
                | TrialFlags::REM_FORMED,
        );
    }

    /// Most significant `sz` bytes of this trial.
    pub fn split_hi(&self, sz: u32) -> ParamTrial {
        let mut res = self.clone();
        if self.addr.space().is_big_endian() {
            res.size = sz;
        } else {
            res.addr = self.addr.add(i64::from(self.size - sz));
            res.size = sz;
        }
        res.flags.remove(TrialFlags::USED);
        res
    }

    /// Least significant `sz` bytes of this trial, one slot later.
    pub fn split_lo(&self, sz: u32) -> ParamTrial {
        let mut res = self.clone();
        if self.addr.space().is_big_endian() {
            res.addr = self.addr.add(i64::from(self.size - sz));
        }
        res.size = sz;
        res.slot = self.slot.map(|s| s + 1);
        res.flags.remove(TrialFlags::USED);
        res
    }

    /// Returns true if the trial could shrink to `[addr, addr+sz)`.
    pub fn test_shrink(&self, addr: &Address, sz: u32) -> bool {
        if addr.space() != self.addr.space() || addr.offset() < self.addr.offset() {
            return false;
        }
        let old_end = self.addr.offset() + u64::from(self.size) - 1;
        let new_end = addr.offset() + u64::from(sz) - 1;
        new_end <= old_end
    }

    /// Group (slot across the model) of the trial's last byte.
    pub fn slot_group(&self, entries: &[ParamEntry]) -> Option<u32> {
        let entry = entries.get(self.entry?)?;
        Some(entry.get_slot(&self.addr, self.size - 1))
    }

    /// Ordering by model storage: group, then entry, then position.
    pub fn compare_storage(&self, other: &ParamTrial, entries: &[ParamEntry]) -> Ordering {
        let (ea, eb) = match (self.entry, other.entry) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            (Some(a), Some(b)) => (a, b),
        };
        let (Some(entry_a), Some(entry_b)) = (entries.get(ea), entries.get(eb)) else {
            return ea.cmp(&eb);
        };
        entry_a
            .group()
            .cmp(&entry_b.group())
            .then(ea.cmp(&eb))
            .then_with(|| {
                if entry_a.is_exclusion() {
                    self.offset.cmp(&other.offset)
                } else if self.addr != other.addr {
                    if entry_a.is_reverse_stack() {
                        other.addr.cmp(&self.addr)
                    } else {
                        self.addr.cmp(&other.addr)
                    }
                } else {
                    self.size.cmp(&other.size)
                }
            })
    }
}

impl fmt::Display for ParamTrial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {:?}", self.addr, self.size, self.status)?;
        if let Some(slot) = self.slot {
            write!(f, " slot={}", slot)?;
        }
        Ok(())
    }
}

/// Ordered trials for one direction (inputs or outputs) of one call.
///
/// Slot numbers refer to call operands; slot 0 is the call target, so the
/// first trial sits in slot 1. A reserved stack placeholder operand, when
/// present, takes the slot it was registered in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamActive {
    trials: Vec<ParamTrial>,
    slot_base: usize,
    placeholder: Option<usize>,
    num_passes: u32,
    max_pass: u32,
    fully_checked: bool,
    needs_final_check: bool,
    recover_subcall: bool,
}

impl ParamActive {
    pub fn new(recover_subcall: bool) -> Self {
        Self {
            trials: Vec::new(),
            slot_base: 1,
            placeholder: None,
            num_passes: 0,
            max_pass: 0,
            fully_checked: false,
            needs_final_check: false,
            recover_subcall,
        }
    }

    /// Resets to the freshly constructed state.
    pub fn clear(&mut self) {
        *self = Self::new(self.recover_subcall);
    }

    /// Adds a trial for the next operand slot. Trials outside the stack are
    /// presumed killed by the call until proven otherwise.
    pub fn register_trial(&mut self, addr: Address, size: u32) {
        let mut trial = ParamTrial::new(addr, size, self.slot_base);
        if !addr.space().is_spacebase() {
            trial.mark_killed_by_call();
        }
        log::trace!("registered trial {}", trial);
        self.trials.push(trial);
        self.slot_base += 1;
    }

    pub fn num_trials(&self) -> usize {
        self.trials.len()
    }

    pub fn trials(&self) -> &[ParamTrial] {
        &self.trials
    }

    pub fn trial(&self, i: usize) -> Option<&ParamTrial> {
        self.trials.get(i)
    }

    pub fn trial_mut(&mut self, i: usize) -> Option<&mut ParamTrial> {
        self.trials.get_mut(i)
    }

    pub fn trials_mut(&mut self) -> &mut [ParamTrial] {
        &mut self.trials
    }

    /// Index of the trial backing call operand `slot`.
    pub fn trial_index_for_operand(&self, slot: usize) -> Option<usize> {
        let skip = match self.placeholder {
            Some(ph) if slot >= ph => 2,
            _ => 1,
        };
        let index = slot.checked_sub(skip)?;
        (index < self.trials.len()).then_some(index)
    }

    /// The trial backing call operand `slot`.
    pub fn trial_for_operand(&self, slot: usize) -> Option<&ParamTrial> {
        self.trial_index_for_operand(slot).and_then(|i| self.trials.get(i))
    }

    /// Index of the first trial overlapping `[addr, addr+sz)`.
    pub fn which_trial(&self, addr: &Address, sz: u32) -> Option<usize> {
        self.trials.iter().position(|t| {
            addr.overlap(0, &t.addr, t.size).is_some()
                || (sz > 1 && addr.add(i64::from(sz) - 1).overlap(0, &t.addr, t.size).is_some())
        })
    }

    pub fn needs_final_check(&self) -> bool {
        self.needs_final_check
    }

    pub fn mark_needs_final_check(&mut self) {
        self.needs_final_check = true;
    }

    pub fn is_recover_subcall(&self) -> bool {
        self.recover_subcall
    }

    pub fn is_fully_checked(&self) -> bool {
        self.fully_checked
    }

    pub fn mark_fully_checked(&mut self) {
        self.fully_checked = true;
    }

    pub fn placeholder_slot(&self) -> Option<usize> {
        self.placeholder
    }

    /// Reserves the next operand slot for the stack placeholder.
    pub fn set_placeholder_slot(&mut self) {
        self.placeholder = Some(self.slot_base);
        self.slot_base += 1;
    }

    /// Releases the placeholder slot, renumbering later trials. No further
    /// passes are allowed once the placeholder is gone.
    pub fn free_placeholder_slot(&mut self) {
        if let Some(ph) = self.placeholder.take() {
            for trial in &mut self.trials {
                if let Some(slot) = trial.slot {
                    if slot > ph {
                        trial.slot = Some(slot - 1);
                    }
                }
            }
            self.slot_base -= 1;
        }
        self.max_pass = 0;
    }

    pub fn num_passes(&self) -> u32 {
        self.num_passes
    }

    pub fn max_pass(&self) -> u32 {
        self.max_pass
    }

    pub fn set_max_pass(&mut self, max: u32) {
        self.max_pass = max;
    }

    /// Counts one completed pass.
    pub fn finish_pass(&mut self) {
        self.num_passes += 1;
    }

    /// Produces the state for the next pass.
    ///
    /// Once the pass budget is exhausted the snapshot is marked fully
    /// checked and keeps its verdicts. Otherwise per-pass verdicts are
    /// cleared so the next pass re-examines the trials; definitely-not-used
    /// and unreferenced trials stay terminal.
    pub fn next_pass(&self) -> ParamActive {
        let mut next = self.clone();
        next.num_passes += 1;
        if next.num_passes > next.max_pass {
            next.fully_checked = true;
        } else {
            next.needs_final_check = false;
            for trial in &mut next.trials {
                trial.reset_for_pass();
            }
        }
        next
    }

    /// Sorts trials into model storage order.
    pub fn sort_trials(&mut self, entries: &[ParamEntry]) {
        self.trials.sort_by(|a, b| a.compare_storage(b, entries));
    }

    /// Stable sort putting fixed-position trials first, in position order.
    pub fn sort_fixed_position(&mut self) {
        self.trials.sort_by(|a, b| match (a.fixed_position, b.fixed_position) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => x.cmp(&y),
        });
    }

    /// Drops unused trials and renumbers the rest from slot 1.
    pub fn delete_unused_trials(&mut self) {
        self.trials.retain(|t| t.is_used());
        for (i, trial) in self.trials.iter_mut().enumerate() {
            trial.slot = Some(i + 1);
        }
        self.slot_base = self.trials.len() + 1;
    }

    /// Splits trial `i` into a high piece of `sz` bytes and the remaining low piece.
    pub fn split_trial(&mut self, i: usize, sz: u32) -> Result<()> {
        if self.placeholder.is_some() {
            return Err(ProtoError::inconsistent(
                "cannot split parameter while the stack placeholder is present",
            ));
        }
        let target = self
            .trials
            .get(i)
            .cloned()
            .ok_or_else(|| ProtoError::inconsistent(format!("no trial {} to split", i)))?;
        if sz == 0 || sz >= target.size {
            return Err(ProtoError::inconsistent("split point outside the trial"));
        }
        let slot = target.slot;
        for trial in &mut self.trials {
            if let (Some(s), Some(base)) = (trial.slot, slot) {
                if s > base {
                    trial.slot = Some(s + 1);
                }
            }
        }
        let hi = target.split_hi(sz);
        let lo = target.split_lo(target.size - sz);
        self.trials.splice(i..=i, [hi, lo]);
        self.slot_base += 1;
        Ok(())
    }

    /// Merges the trials in operand slots `slot` and `slot + 1` into one
    /// used, active trial at `addr` covering `sz` bytes.
    pub fn join_trial(&mut self, slot: usize, addr: Address, sz: u32) -> Result<()> {
        if self.placeholder.is_some() {
            return Err(ProtoError::inconsistent(
                "cannot join parameters while the stack placeholder is present",
            ));
        }
        let mut size_left = i64::from(sz);
        let mut joined = Vec::with_capacity(self.trials.len());
        for trial in self.trials.drain(..) {
            match trial.slot {
                Some(s) if s == slot => {
                    size_left -= i64::from(trial.size);
                    let mut whole = ParamTrial::new(addr, sz, slot);
                    whole.mark_used();
                    whole.mark_active();
                    joined.push(whole);
                }
                Some(s) if s == slot + 1 => {
                    size_left -= i64::from(trial.size);
                }
                Some(s) if s > slot + 1 => {
                    let mut moved = trial;
                    moved.slot = Some(s - 1);
                    joined.push(moved);
                }
                _ => joined.push(trial),
            }
        }
        self.trials = joined;
        if size_left != 0 {
            return Err(ProtoError::inconsistent(
                "joined parameter size does not match the original trials",
            ));
        }
        self.slot_base -= 1;
        Ok(())
    }

    /// Number of trials marked used.
    pub fn num_used(&self) -> usize {
        self.trials.iter().filter(|t| t.is_used()).count()
    }
}
