//! Prototype models: the ABI rules for where parameters live.
//!
//! A model answers two kinds of question. Forward: given the declared types
//! of a prototype, which storage does each value occupy
//! ([`ProtoModel::assign_parameter_storage`]). Backward: given the candidate
//! storage locations observed at a call, which of them form a believable
//! parameter list ([`ProtoModel::derive_input_map`] and
//! [`ProtoModel::derive_output_map`]).
//!
//! [`StandardModel`] implements both directions over ordered lists of
//! [`ParamEntry`] resources. Each entry owns one or more *groups*; a group
//! is a unit of resource that is consumed as a whole by one parameter.

use std::fmt;

use protorec_core::{AddrSpace, Address, SpaceManager, VarnodeData};

use crate::entry::{Containment, Extension, ParamEntry};
use crate::error::{ProtoError, Result};
use crate::store::{ParamFlags, ParameterPieces};
use crate::trial::ParamActive;
use crate::types::{DataType, TypeClass};

/// How a call affects one storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectType {
    /// The callee preserves the value.
    Unaffected,
    /// The callee may overwrite the value.
    KilledByCall,
    /// The location holds the return address.
    ReturnAddress,
    /// Nothing is known.
    Unknown,
}

/// The effect a call has on a range of storage. A size of zero covers the
/// whole space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectRecord {
    addr: Address,
    size: u32,
    kind: EffectType,
}

impl EffectRecord {
    pub fn new(addr: Address, size: u32, kind: EffectType) -> Self {
        Self { addr, size, kind }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn kind(&self) -> EffectType {
        self.kind
    }
}

/// Looks up the effect on `[addr, addr+size)` in `records`.
///
/// Temporaries are never affected by a call. Otherwise the record with the
/// greatest address not above `addr` decides, provided it covers the whole
/// range.
pub fn lookup_effect(records: &[EffectRecord], addr: &Address, size: u32) -> EffectType {
    if addr.space().is_internal() {
        return EffectType::Unaffected;
    }
    let Some(hit) = records
        .iter()
        .filter(|r| r.addr <= *addr)
        .max_by(|a, b| a.addr.cmp(&b.addr))
    else {
        return EffectType::Unknown;
    };
    if hit.size == 0 && hit.addr.space() == addr.space() {
        return EffectType::Unaffected;
    }
    match addr.overlap(0, &hit.addr, hit.size) {
        Some(pos) if pos + size <= hit.size => hit.kind,
        _ => EffectType::Unknown,
    }
}

/// Storage assigned to every value of a prototype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAssignment {
    pub output: ParameterPieces,
    /// Inputs in order, including a hidden return pointer if one is needed.
    pub inputs: Vec<ParameterPieces>,
    pub input_error: bool,
    pub output_error: bool,
}

/// ABI description consumed by prototype recovery.
pub trait ProtoModel: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Bytes the callee removes from the stack, or `None` if unknown.
    fn extra_pop(&self) -> Option<i32>;

    /// The stack space parameters are passed in, if any.
    fn stack_space(&self) -> Option<AddrSpace>;

    /// Methods of this model take a `this` pointer first.
    fn has_this_pointer(&self) -> bool {
        false
    }

    fn input_entries(&self) -> &[ParamEntry];

    fn output_entries(&self) -> &[ParamEntry];

    /// Assigns storage to an output type and input types.
    fn assign_parameter_storage(&self, output: &DataType, inputs: &[DataType]) -> StorageAssignment;

    /// Decides which input trials form the parameter list. Chosen trials are
    /// marked used; trials that cannot be parameters are marked no-use.
    fn derive_input_map(&self, active: &mut ParamActive) -> Result<()>;

    /// Decides which output trials form the return value.
    fn derive_output_map(&self, active: &mut ParamActive) -> Result<()>;

    fn possible_input_param(&self, addr: &Address, size: u32) -> bool;

    fn possible_output_param(&self, addr: &Address, size: u32) -> bool;

    /// Group and number of groups an input at this storage would consume.
    fn possible_input_param_with_slot(&self, addr: &Address, size: u32) -> Option<(u32, u32)>;

    fn characterize_as_input_param(&self, addr: &Address, size: u32) -> Containment;

    fn characterize_as_output_param(&self, addr: &Address, size: u32) -> Containment;

    /// The full container of an input range that sits unjustified in an entry.
    fn unjustified_input_param(&self, addr: &Address, size: u32) -> Option<VarnodeData>;

    /// Could `(hi, lo)` be the two halves of one input parameter?
    fn check_input_join(&self, hi: &Address, hi_size: u32, lo: &Address, lo_size: u32) -> bool;

    /// Could the input at `addr` be split into two parameters at `split`?
    fn check_input_split(&self, addr: &Address, size: u32, split: u32) -> bool;

    fn assumed_input_extension(&self, addr: &Address, size: u32) -> (Extension, Option<VarnodeData>);

    fn effects(&self) -> &[EffectRecord];

    fn likely_trash(&self) -> &[VarnodeData];

    fn has_effect(&self, addr: &Address, size: u32) -> EffectType {
        lookup_effect(self.effects(), addr, size)
    }

    /// Passes to wait before trusting input recovery.
    fn max_input_delay(&self) -> u32 {
        0
    }

    fn max_output_delay(&self) -> u32 {
        0
    }

    /// Returns true if prototypes of `other` may stand in for this model.
    fn is_compatible(&self, other: &dyn ProtoModel) -> bool {
        self.name() == other.name()
    }
}

// ==================== Entry lists ====================

/// One direction (inputs or outputs) of a [`StandardModel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamList {
    entries: Vec<ParamEntry>,
    num_groups: u32,
    /// First group of each resource section, ascending.
    resource_start: Vec<u32>,
    max_delay: u32,
}

impl ParamList {
    /// Assigns groups and resolves joins and overlaps, in declaration order.
    fn build(mut entries: Vec<ParamEntry>, sections: &[usize], max_delay: u32, spaces: &SpaceManager) -> Result<Self> {
        let mut next_group = 0u32;
        let mut resource_start = vec![0];
        for i in 0..entries.len() {
            if sections.contains(&i) && i > 0 {
                resource_start.push(next_group);
            }
            let (earlier, rest) = entries.split_at_mut(i);
            let entry = &mut rest[0];
            entry.validate()?;
            let shares = entry.is_grouped() && !earlier.is_empty();
            match earlier.last() {
                Some(prev) if shares => entry.set_group(prev.group()),
                _ => entry.set_group(next_group),
            }
            entry.resolve_join(earlier, spaces)?;
            entry.resolve_overlap(earlier)?;
            if !shares && !entry.is_join() && !entry.is_overlap() {
                next_group += entry.num_slots().max(1);
            }
        }
        resource_start.dedup();
        Ok(Self {
            entries,
            num_groups: next_group,
            resource_start,
            max_delay,
        })
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn num_groups(&self) -> u32 {
        self.num_groups
    }

    pub fn max_delay(&self) -> u32 {
        self.max_delay
    }

    /// Index of the first entry in which `[addr, addr+size)` sits justified.
    pub fn find_entry(&self, addr: &Address, size: u32, allow_join: bool) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.min_size() <= size
                && (allow_join || !e.is_join())
                && e.justified_contain(addr, size) == Some(0)
        })
    }

    pub fn possible_param(&self, addr: &Address, size: u32) -> bool {
        self.find_entry(addr, size, true).is_some()
    }

    pub fn possible_param_with_slot(&self, addr: &Address, size: u32) -> Option<(u32, u32)> {
        let entry = &self.entries[self.find_entry(addr, size, true)?];
        let slot = entry.get_slot(addr, 0);
        let slot_size = if entry.is_exclusion() {
            entry.group_size()
        } else {
            (size - 1) / entry.alignment() + 1
        };
        Some((slot, slot_size))
    }

    pub fn characterize_as_param(&self, addr: &Address, size: u32) -> Containment {
        let mut contains = false;
        let mut contained_by = false;
        for entry in &self.entries {
            match entry.justified_contain(addr, size) {
                Some(0) => return Containment::ContainsJustified,
                Some(_) => contains = true,
                None => {}
            }
            if entry.is_exclusion() && entry.contained_by(addr, size) {
                contained_by = true;
            }
        }
        if contains {
            Containment::ContainsUnjustified
        } else if contained_by {
            Containment::ContainedBy
        } else {
            Containment::None
        }
    }

    pub fn unjustified_container(&self, addr: &Address, size: u32) -> Option<VarnodeData> {
        for entry in &self.entries {
            if entry.min_size() > size {
                continue;
            }
            match entry.justified_contain(addr, size) {
                None => continue,
                Some(0) => return None,
                Some(_) => return entry.get_container(addr, size),
            }
        }
        None
    }

    pub fn assumed_extension(&self, addr: &Address, size: u32) -> (Extension, Option<VarnodeData>) {
        for entry in &self.entries {
            if entry.min_size() > size {
                continue;
            }
            let res = entry.assumed_extension(addr, size);
            if res.0 != Extension::None {
                return res;
            }
        }
        (Extension::None, None)
    }

    pub fn check_join(&self, hi: &Address, hi_size: u32, lo: &Address, lo_size: u32) -> bool {
        let (Some(ehi), Some(elo)) = (
            self.find_entry(hi, hi_size, true),
            self.find_entry(lo, lo_size, true),
        ) else {
            return false;
        };
        let (ehi, elo) = (&self.entries[ehi], &self.entries[elo]);
        if ehi.group() == elo.group() {
            if ehi.is_exclusion() || elo.is_exclusion() {
                return false;
            }
            if !hi.is_contiguous(hi_size, lo, lo_size) {
                return false;
            }
            let aligned = |e: &ParamEntry, a: &Address| {
                a.offset().wrapping_sub(e.base()) % u64::from(e.alignment()) == 0
            };
            return aligned(ehi, hi) && aligned(elo, lo);
        }
        let total = hi_size + lo_size;
        self.entries.iter().any(|e| {
            e.size() >= total
                && e.justified_contain(lo, lo_size) == Some(0)
                && e.justified_contain(hi, hi_size) == Some(lo_size)
        })
    }

    pub fn check_split(&self, addr: &Address, size: u32, split: u32) -> bool {
        if split == 0 || split >= size {
            return false;
        }
        let rest = addr.add(i64::from(split));
        self.find_entry(addr, split, true).is_some() && self.find_entry(&rest, size - split, true).is_some()
    }

    // ==================== Storage assignment ====================

    /// Exact matching still lets pointers use general purpose entries.
    fn class_matches(entry: TypeClass, value: TypeClass, exact: bool) -> bool {
        if entry == TypeClass::Unknown || entry == value {
            return true;
        }
        if entry != TypeClass::General {
            return false;
        }
        !exact || matches!(value, TypeClass::Ptr | TypeClass::HiddenReturn)
    }

    /// Finds storage for one value, consuming slots in `status`.
    fn assign_address(&self, class: TypeClass, ty: &DataType, exact: bool, status: &mut [Option<u32>]) -> Option<Address> {
        for entry in &self.entries {
            let grp = entry.group() as usize;
            let Some(Some(slot)) = status.get(grp).copied() else {
                continue;
            };
            if !Self::class_matches(entry.type_class(), class, exact) {
                continue;
            }
            let mut next = slot;
            let Some(res) = entry.get_addr_by_slot(&mut next, ty.size(), ty.alignment()) else {
                continue;
            };
            if entry.is_exclusion() {
                for &g in entry.all_groups() {
                    if let Some(s) = status.get_mut(g as usize) {
                        *s = None;
                    }
                }
            } else {
                status[grp] = Some(next);
            }
            return Some(res.addr);
        }
        None
    }

    fn fresh_status(&self) -> Vec<Option<u32>> {
        vec![Some(0); self.num_groups.max(1) as usize]
    }

    // ==================== Trial maps ====================

    fn section_of(&self, group: u32) -> usize {
        self.resource_start
            .iter()
            .rposition(|&start| start <= group)
            .unwrap_or(0)
    }

    /// Maps trials to entries and synthesizes unreferenced trials for the
    /// resources the call skipped.
    fn build_trial_map(&self, active: &mut ParamActive) {
        let mut hitlist: Vec<Option<usize>> = Vec::new();
        let mut float_count = 0;
        let mut int_count = 0;

        for trial in active.trials_mut() {
            match self.find_entry(&trial.addr(), trial.size(), true) {
                None => {
                    trial.mark_no_use();
                    trial.set_entry(None, 0);
                }
                Some(idx) => {
                    trial.set_entry(Some(idx), 0);
                    let entry = &self.entries[idx];
                    if trial.is_active() {
                        if entry.type_class() == TypeClass::Float {
                            float_count += 1;
                        } else {
                            int_count += 1;
                        }
                    }
                    let grp = entry.group() as usize;
                    if hitlist.len() <= grp {
                        hitlist.resize(grp + 1, None);
                    }
                    hitlist[grp].get_or_insert(idx);
                }
            }
        }

        for (grp, hit) in hitlist.iter().enumerate() {
            match *hit {
                None => {
                    let Some(idx) = self.entries.iter().position(|e| e.group() as usize == grp) else {
                        continue;
                    };
                    let entry = &self.entries[idx];
                    if entry.is_exclusion() {
                        match entry.type_class() {
                            TypeClass::Float if float_count == 0 => continue,
                            TypeClass::General if int_count == 0 => continue,
                            _ => {}
                        }
                    }
                    let size = if entry.is_exclusion() { entry.size() } else { entry.alignment() };
                    let mut slot = 0;
                    if let Some(res) = entry.get_addr_by_slot(&mut slot, size, 1) {
                        Self::register_unref(active, res.addr, size, idx);
                    }
                }
                Some(idx) if !self.entries[idx].is_exclusion() => {
                    self.fill_slot_holes(active, idx);
                }
                Some(_) => {}
            }
        }
        active.sort_trials(&self.entries);
    }

    fn register_unref(active: &mut ParamActive, addr: Address, size: u32, entry: usize) {
        active.register_trial(addr, size);
        let pos = active.num_trials() - 1;
        if let Some(trial) = active.trial_mut(pos) {
            trial.mark_unreferenced();
            trial.set_entry(Some(entry), 0);
        }
    }

    /// Adds unreferenced trials for the slots of a sliced entry that sit
    /// below the highest slot any trial touches.
    fn fill_slot_holes(&self, active: &mut ParamActive, idx: usize) {
        let entry = &self.entries[idx];
        let mut covered: Vec<bool> = Vec::new();
        for trial in active.trials() {
            if trial.entry() != Some(idx) {
                continue;
            }
            let mut start = entry.get_slot(&trial.addr(), 0) - entry.group();
            let mut end = entry.get_slot(&trial.addr(), trial.size().saturating_sub(1)) - entry.group();
            if end < start {
                std::mem::swap(&mut start, &mut end);
            }
            if covered.len() <= end as usize {
                covered.resize(end as usize + 1, false);
            }
            for slot in start..=end {
                covered[slot as usize] = true;
            }
        }
        for (slot, _) in covered.iter().enumerate().filter(|(_, &c)| !c) {
            let mut next = slot as u32;
            if let Some(res) = entry.get_addr_by_slot(&mut next, entry.alignment(), 1) {
                Self::register_unref(active, res.addr, entry.alignment(), idx);
            }
        }
    }

    /// Keeps at most one trial alive per exclusion group.
    fn force_exclusion_group(&self, active: &mut ParamActive) {
        let mut cur_group: Option<u32> = None;
        let mut group_start = 0;
        let mut inactive_count = 0;
        for i in 0..active.num_trials() {
            let trial = &active.trials()[i];
            let Some(entry) = trial.entry().map(|e| &self.entries[e]) else {
                continue;
            };
            if trial.is_definitely_not_used() || !entry.is_exclusion() {
                continue;
            }
            let grp = entry.group();
            if cur_group != Some(grp) {
                if inactive_count > 1 {
                    if let Some(g) = cur_group {
                        self.mark_best_inactive(active, g, group_start, TypeClass::General);
                    }
                }
                cur_group = Some(grp);
                group_start = i;
                inactive_count = 0;
            }
            if active.trials()[i].is_active() {
                self.mark_group_no_use(active, i, group_start);
            } else {
                inactive_count += 1;
            }
        }
        if inactive_count > 1 {
            if let Some(g) = cur_group {
                self.mark_best_inactive(active, g, group_start, TypeClass::General);
            }
        }
    }

    fn mark_group_no_use(&self, active: &mut ParamActive, keep: usize, start: usize) {
        let Some(keep_entry) = active.trials()[keep].entry().map(|e| self.entries[e].clone()) else {
            return;
        };
        for i in start..active.num_trials() {
            if i == keep {
                continue;
            }
            let trial = &mut active.trials_mut()[i];
            if trial.is_definitely_not_used() {
                continue;
            }
            let overlaps = trial
                .entry()
                .is_some_and(|e| self.entries[e].group_overlap(&keep_entry));
            if !overlaps {
                break;
            }
            trial.mark_no_use();
        }
    }

    fn mark_best_inactive(&self, active: &mut ParamActive, group: u32, start: usize, preferred: TypeClass) {
        let mut best: Option<(usize, u32)> = None;
        for (i, trial) in active.trials().iter().enumerate().skip(start) {
            if trial.is_definitely_not_used() {
                continue;
            }
            let Some(entry) = trial.entry().map(|e| &self.entries[e]) else {
                break;
            };
            if entry.group() != group {
                break;
            }
            if entry.all_groups().len() > 1 {
                continue;
            }
            let mut score = 0;
            if trial.has_ancestor_realistic() {
                score += 5;
                if trial.has_ancestor_solid() {
                    score += 5;
                }
            }
            if entry.type_class() == preferred {
                score += 1;
            }
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        if let Some((i, _)) = best {
            self.mark_group_no_use(active, i, start);
        }
    }

    /// Once a whole group is definitely unused, everything after it is inactive.
    fn force_no_use(&self, active: &mut ParamActive, start: usize, stop: usize) {
        let mut seen_no_use = false;
        let mut cur_group: Option<u32> = None;
        let mut all_no_use = false;
        for trial in &mut active.trials_mut()[start..stop] {
            let Some(entry) = trial.entry().map(|e| &self.entries[e]) else {
                continue;
            };
            let grp = entry.group();
            let same_exclusive = entry.is_exclusion() && cur_group.is_some_and(|g| grp <= g);
            if same_exclusive {
                if !trial.is_definitely_not_used() {
                    all_no_use = false;
                }
            } else {
                if all_no_use {
                    seen_no_use = true;
                }
                all_no_use = trial.is_definitely_not_used();
                cur_group = Some(grp);
            }
            if seen_no_use {
                trial.mark_inactive();
            }
        }
    }

    /// A run of more than `max_chain` inactive groups ends the parameter
    /// list; inactive holes before the last active trial are filled in.
    fn force_inactive_chain(&self, active: &mut ParamActive, max_chain: u32, start: usize, stop: usize, group_start: u32) {
        let recover_subcall = active.is_recover_subcall();
        let mut seen_chain = false;
        let mut chain = 0u32;
        let mut last_active: Option<usize> = None;
        let mut prev_group = group_start.checked_sub(1);
        for i in start..stop {
            let trial = &mut active.trials_mut()[i];
            if trial.is_definitely_not_used() {
                continue;
            }
            let group = trial.slot_group(&self.entries).unwrap_or(group_start);
            if !trial.is_active() {
                if trial.is_unref() && recover_subcall && trial.addr().space().is_spacebase() {
                    seen_chain = true;
                }
                chain += match prev_group {
                    Some(p) => group.saturating_sub(p),
                    None => group.saturating_sub(group_start) + 1,
                };
                if chain > max_chain {
                    seen_chain = true;
                }
            } else {
                chain = 0;
                if !seen_chain {
                    last_active = Some(i);
                }
            }
            prev_group = Some(group);
            if seen_chain {
                trial.mark_inactive();
            }
        }
        if let Some(last) = last_active {
            for trial in &mut active.trials_mut()[start..=last] {
                if !trial.is_definitely_not_used() && !trial.is_active() {
                    trial.mark_active();
                }
            }
        }
    }

    /// Splits the sorted trial list at resource section boundaries.
    fn separate_sections(&self, active: &ParamActive) -> Vec<(usize, usize, u32)> {
        let mut sections = Vec::new();
        let mut begin = 0;
        let mut current: Option<usize> = None;
        for (i, trial) in active.trials().iter().enumerate() {
            let Some(entry) = trial.entry().map(|e| &self.entries[e]) else {
                continue;
            };
            let section = self.section_of(entry.group());
            match current {
                None => current = Some(section),
                Some(c) if c != section => {
                    sections.push((begin, i, self.resource_start[c]));
                    begin = i;
                    current = Some(section);
                }
                Some(_) => {}
            }
        }
        let last = current.unwrap_or(0);
        sections.push((begin, active.num_trials(), self.resource_start[last]));
        sections
    }

    /// Input direction of [`ProtoModel::derive_input_map`].
    pub fn fillin_map_input(&self, active: &mut ParamActive) -> Result<()> {
        if active.num_trials() == 0 {
            return Ok(());
        }
        if self.entries.is_empty() {
            return Err(ProtoError::bad_abi("model has no input parameter entries"));
        }
        self.build_trial_map(active);
        self.force_exclusion_group(active);
        let sections = self.separate_sections(active);
        for &(start, stop, _) in &sections {
            self.force_no_use(active, start, stop);
        }
        for &(start, stop, group) in &sections {
            self.force_inactive_chain(active, 2, start, stop, group);
        }
        for trial in active.trials_mut() {
            if trial.is_active() {
                trial.mark_used();
            }
        }
        Ok(())
    }

    /// Output direction of [`ProtoModel::derive_output_map`].
    pub fn fillin_map_output(&self, active: &mut ParamActive) -> Result<()> {
        if active.num_trials() == 0 {
            return Ok(());
        }
        let mut best: Option<(usize, u32)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let mut putative = false;
            for trial in active.trials_mut() {
                let off = if trial.is_active() {
                    entry.justified_contain(&trial.addr(), trial.size())
                } else {
                    None
                };
                match off {
                    Some(o) => {
                        trial.set_entry(Some(idx), o);
                        putative = true;
                    }
                    None => trial.set_entry(None, 0),
                }
            }
            if !putative {
                continue;
            }
            active.sort_trials(&self.entries);
            let mut covered = 0u32;
            let mut complete = true;
            for trial in active.trials() {
                if trial.entry().is_none() {
                    continue;
                }
                if trial.offset() != Some(covered) {
                    complete = false;
                    break;
                }
                let extra_check = (covered == 0 && entry.is_param_check_low())
                    || (covered != 0 && entry.is_param_check_high());
                if extra_check && (trial.is_rem_formed() || trial.is_ind_create_formed()) {
                    complete = false;
                    break;
                }
                covered += trial.size();
            }
            if covered < entry.min_size() {
                complete = false;
            }
            if complete && best.map_or(true, |(_, c)| covered > c) {
                best = Some((idx, covered));
            }
        }

        let best = best.map(|(idx, _)| idx);
        for trial in active.trials_mut() {
            let off = match best {
                Some(idx) if trial.is_active() => self.entries[idx].justified_contain(&trial.addr(), trial.size()),
                _ => None,
            };
            match off {
                Some(o) => {
                    trial.mark_used();
                    trial.set_entry(best, o);
                }
                None => {
                    trial.mark_no_use();
                    trial.set_entry(None, 0);
                }
            }
        }
        if best.is_some() {
            active.sort_trials(&self.entries);
        }
        Ok(())
    }
}

// ==================== Standard model ====================

/// A model built from register and stack [`ParamEntry`] lists.
#[derive(Debug, Clone)]
pub struct StandardModel {
    name: String,
    input: ParamList,
    output: ParamList,
    effects: Vec<EffectRecord>,
    likely_trash: Vec<VarnodeData>,
    extra_pop: Option<i32>,
    stack_space: Option<AddrSpace>,
    has_this: bool,
    pointer_size: u32,
    compatible: Vec<String>,
}

impl StandardModel {
    pub fn builder(name: impl Into<String>) -> StandardModelBuilder {
        StandardModelBuilder::new(name)
    }

    pub fn input_list(&self) -> &ParamList {
        &self.input
    }

    pub fn output_list(&self) -> &ParamList {
        &self.output
    }

    pub fn pointer_size(&self) -> u32 {
        self.pointer_size
    }
}

impl ProtoModel for StandardModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn extra_pop(&self) -> Option<i32> {
        self.extra_pop
    }

    fn stack_space(&self) -> Option<AddrSpace> {
        self.stack_space
    }

    fn has_this_pointer(&self) -> bool {
        self.has_this
    }

    fn input_entries(&self) -> &[ParamEntry] {
        self.input.entries()
    }

    fn output_entries(&self) -> &[ParamEntry] {
        self.output.entries()
    }

    fn assign_parameter_storage(&self, output: &DataType, inputs: &[DataType]) -> StorageAssignment {
        let mut res = StorageAssignment {
            output: ParameterPieces::void(),
            inputs: Vec::with_capacity(inputs.len() + 1),
            input_error: false,
            output_error: false,
        };

        if !output.is_void() {
            let mut status = self.output.fresh_status();
            match self.output.assign_address(output.type_class(), output, false, &mut status) {
                Some(addr) => res.output = ParameterPieces::new(Some(addr), output.clone()),
                None => {
                    // Too big for registers: returned through a caller supplied pointer.
                    let ptr = DataType::pointer(self.pointer_size, output);
                    let mut status = self.output.fresh_status();
                    match self.output.assign_address(TypeClass::Ptr, &ptr, false, &mut status) {
                        Some(addr) => {
                            res.output = ParameterPieces::new(Some(addr), ptr.clone())
                                .with_flags(ParamFlags::INDIRECT_STORAGE);
                        }
                        None => {
                            res.output_error = true;
                            res.output = ParameterPieces::new(None, output.clone());
                        }
                    }
                    res.inputs.push(ParameterPieces::new(None, ptr).with_flags(ParamFlags::HIDDEN_RETURN));
                }
            }
        }

        let mut status = self.input.fresh_status();
        if let Some(hidden) = res.inputs.first_mut() {
            hidden.addr = self
                .input
                .assign_address(TypeClass::HiddenReturn, &hidden.ty, false, &mut status);
            if hidden.addr.is_none() {
                res.input_error = true;
            }
        }
        for ty in inputs {
            let addr = self.input.assign_address(ty.type_class(), ty, true, &mut status);
            if addr.is_none() {
                log::warn!("{}: cannot assign storage for parameter of type {}", self.name, ty);
                res.input_error = true;
            }
            res.inputs.push(ParameterPieces::new(addr, ty.clone()));
        }

        if self.has_this {
            let this_index = usize::from(res.inputs.first().is_some_and(|p| p.flags.contains(ParamFlags::HIDDEN_RETURN)));
            if let Some(this) = res.inputs.get_mut(this_index) {
                this.flags |= ParamFlags::THIS_PTR;
            }
        }
        res
    }

    fn derive_input_map(&self, active: &mut ParamActive) -> Result<()> {
        self.input.fillin_map_input(active)
    }

    fn derive_output_map(&self, active: &mut ParamActive) -> Result<()> {
        self.output.fillin_map_output(active)
    }

    fn possible_input_param(&self, addr: &Address, size: u32) -> bool {
        self.input.possible_param(addr, size)
    }

    fn possible_output_param(&self, addr: &Address, size: u32) -> bool {
        self.output.possible_param(addr, size)
    }

    fn possible_input_param_with_slot(&self, addr: &Address, size: u32) -> Option<(u32, u32)> {
        self.input.possible_param_with_slot(addr, size)
    }

    fn characterize_as_input_param(&self, addr: &Address, size: u32) -> Containment {
        self.input.characterize_as_param(addr, size)
    }

    fn characterize_as_output_param(&self, addr: &Address, size: u32) -> Containment {
        self.output.characterize_as_param(addr, size)
    }

    fn unjustified_input_param(&self, addr: &Address, size: u32) -> Option<VarnodeData> {
        self.input.unjustified_container(addr, size)
    }

    fn check_input_join(&self, hi: &Address, hi_size: u32, lo: &Address, lo_size: u32) -> bool {
        self.input.check_join(hi, hi_size, lo, lo_size)
    }

    fn check_input_split(&self, addr: &Address, size: u32, split: u32) -> bool {
        self.input.check_split(addr, size, split)
    }

    fn assumed_input_extension(&self, addr: &Address, size: u32) -> (Extension, Option<VarnodeData>) {
        self.input.assumed_extension(addr, size)
    }

    fn effects(&self) -> &[EffectRecord] {
        &self.effects
    }

    fn likely_trash(&self) -> &[VarnodeData] {
        &self.likely_trash
    }

    fn max_input_delay(&self) -> u32 {
        self.input.max_delay()
    }

    fn max_output_delay(&self) -> u32 {
        self.output.max_delay()
    }

    fn is_compatible(&self, other: &dyn ProtoModel) -> bool {
        self.name == other.name() || self.compatible.iter().any(|n| n == other.name())
    }
}

/// Declares a [`StandardModel`] entry by entry.
#[derive(Debug, Clone)]
pub struct StandardModelBuilder {
    name: String,
    inputs: Vec<ParamEntry>,
    input_sections: Vec<usize>,
    outputs: Vec<ParamEntry>,
    effects: Vec<EffectRecord>,
    likely_trash: Vec<VarnodeData>,
    extra_pop: Option<i32>,
    stack_space: Option<AddrSpace>,
    has_this: bool,
    pointer_size: u32,
    input_delay: u32,
    output_delay: u32,
    compatible: Vec<String>,
}

impl StandardModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            input_sections: Vec::new(),
            outputs: Vec::new(),
            effects: Vec::new(),
            likely_trash: Vec::new(),
            extra_pop: Some(0),
            stack_space: None,
            has_this: false,
            pointer_size: 4,
            input_delay: 0,
            output_delay: 0,
            compatible: Vec::new(),
        }
    }

    pub fn input(mut self, entry: ParamEntry) -> Self {
        self.inputs.push(entry);
        self
    }

    /// Starts a new resource section (for example float registers) at the
    /// next input entry.
    pub fn input_section(mut self) -> Self {
        self.input_sections.push(self.inputs.len());
        self
    }

    pub fn output(mut self, entry: ParamEntry) -> Self {
        self.outputs.push(entry);
        self
    }

    pub fn effect(mut self, record: EffectRecord) -> Self {
        self.effects.push(record);
        self
    }

    pub fn likely_trash(mut self, storage: VarnodeData) -> Self {
        self.likely_trash.push(storage);
        self
    }

    /// `None` marks the extra-pop as unknown.
    pub fn extra_pop(mut self, pop: Option<i32>) -> Self {
        self.extra_pop = pop;
        self
    }

    pub fn stack_space(mut self, space: AddrSpace) -> Self {
        self.stack_space = Some(space);
        self
    }

    pub fn this_pointer(mut self, on: bool) -> Self {
        self.has_this = on;
        self
    }

    pub fn pointer_size(mut self, size: u32) -> Self {
        self.pointer_size = size;
        self
    }

    pub fn input_delay(mut self, delay: u32) -> Self {
        self.input_delay = delay;
        self
    }

    pub fn output_delay(mut self, delay: u32) -> Self {
        self.output_delay = delay;
        self
    }

    pub fn compatible_with(mut self, name: impl Into<String>) -> Self {
        self.compatible.push(name.into());
        self
    }

    /// Validates entries, assigns groups and resolves joins and overlaps.
    pub fn build(self, spaces: &SpaceManager) -> Result<StandardModel> {
        let input = ParamList::build(self.inputs, &self.input_sections, self.input_delay, spaces)?;
        let output = ParamList::build(self.outputs, &[], self.output_delay, spaces)?;
        let mut effects = self.effects;
        effects.sort_by(|a, b| a.addr.cmp(&b.addr));
        log::debug!(
            "built model {} with {} input and {} output entries",
            self.name,
            input.entries().len(),
            output.entries().len()
        );
        Ok(StandardModel {
            name: self.name,
            input,
            output,
            effects,
            likely_trash: self.likely_trash,
            extra_pop: self.extra_pop,
            stack_space: self.stack_space,
            has_this: self.has_this,
            pointer_size: self.pointer_size,
            compatible: self.compatible,
        })
    }
}
