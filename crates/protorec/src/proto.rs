//! Function prototypes.
//!
//! A [`FuncProto`] binds a prototype model to a parameter store and tracks
//! which parts of the prototype are locked (authoritative) versus still
//! open to recovery. Locking is per part: the inputs, the output and the
//! model each lock independently.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use protorec_core::{Address, Funcdata, VarnodeData, VarnodeId};

use crate::entry::Containment;
use crate::error::{ProtoError, Result};
use crate::model::{lookup_effect, EffectRecord, EffectType, ProtoModel};
use crate::store::{InternalStore, ParamFlags, ParameterPieces, ProtoParameter, ProtoStore};
use crate::trial::ParamActive;
use crate::types::{DataType, MetaType};

bitflags! {
    /// Boolean properties of a prototype.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtoFlags: u32 {
        /// Takes a variable number of arguments.
        const DOTDOTDOT = 1 << 0;
        /// Locked with no inputs at all.
        const VOID_INPUT_LOCK = 1 << 1;
        /// The model is authoritative.
        const MODEL_LOCK = 1 << 2;
        const IS_INLINE = 1 << 3;
        const NO_RETURN = 1 << 4;
        /// Synthetic leading parameters were inserted and later removed.
        const PARAMSHIFT_APPLIED = 1 << 5;
        /// Some input could not be assigned storage.
        const ERROR_INPUTPARAM = 1 << 6;
        /// The output could not be assigned storage.
        const ERROR_OUTPUTPARAM = 1 << 7;
        /// Storage was given explicitly rather than by the model.
        const CUSTOM_STORAGE = 1 << 8;
        const IS_CONSTRUCTOR = 1 << 9;
        const IS_DESTRUCTOR = 1 << 10;
        const HAS_THISPTR = 1 << 11;
        /// The prototype was forced at a specific call site.
        const IS_OVERRIDE = 1 << 12;
    }
}

/// A prototype described by its types alone, before storage is assigned.
#[derive(Debug, Clone)]
pub struct PrototypePieces {
    pub model: Option<Arc<dyn ProtoModel>>,
    pub output: DataType,
    pub inputs: Vec<DataType>,
    pub input_names: Vec<String>,
    pub variadic: bool,
}

impl PrototypePieces {
    pub fn new(output: DataType) -> Self {
        Self {
            model: None,
            output,
            inputs: Vec::new(),
            input_names: Vec::new(),
            variadic: false,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ProtoModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn input(mut self, name: impl Into<String>, ty: DataType) -> Self {
        self.input_names.push(name.into());
        self.inputs.push(ty);
        self
    }

    pub fn variadic(mut self, on: bool) -> Self {
        self.variadic = on;
        self
    }
}

/// A function prototype: model, parameters, output and effects.
#[derive(Debug, Clone)]
pub struct FuncProto {
    model: Option<Arc<dyn ProtoModel>>,
    store: Box<dyn ProtoStore>,
    extrapop: Option<i32>,
    flags: ProtoFlags,
    effects: Vec<EffectRecord>,
    likely_trash: Vec<VarnodeData>,
    inject_id: Option<u32>,
    return_bytes_consumed: u32,
}

impl Default for FuncProto {
    fn default() -> Self {
        Self::new()
    }
}

impl FuncProto {
    /// An empty prototype with no model.
    pub fn new() -> Self {
        Self {
            model: None,
            store: Box::new(InternalStore::new()),
            extrapop: None,
            flags: ProtoFlags::empty(),
            effects: Vec::new(),
            likely_trash: Vec::new(),
            inject_id: None,
            return_bytes_consumed: 0,
        }
    }

    pub fn with_model(model: Arc<dyn ProtoModel>) -> Self {
        let mut proto = Self::new();
        proto.set_model(model);
        proto
    }

    // ==================== Model ====================

    pub fn model(&self) -> Option<&Arc<dyn ProtoModel>> {
        self.model.as_ref()
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref().map(|m| m.name())
    }

    /// Attaches `model`, resetting the extra-pop to the model's value.
    pub fn set_model(&mut self, model: Arc<dyn ProtoModel>) {
        self.extrapop = model.extra_pop();
        if model.has_this_pointer() {
            self.flags |= ProtoFlags::HAS_THISPTR;
        }
        self.model = Some(model);
    }

    fn require_model(&self) -> Result<&Arc<dyn ProtoModel>> {
        self.model.as_ref().ok_or(ProtoError::MissingModel)
    }

    /// Extra-pop as given by the model, if any.
    pub fn model_extra_pop(&self) -> Option<i32> {
        self.model.as_deref().and_then(|m| m.extra_pop())
    }

    /// Bytes popped beyond the return address; `None` when unknown.
    pub fn extra_pop(&self) -> Option<i32> {
        self.extrapop
    }

    pub fn set_extra_pop(&mut self, pop: Option<i32>) {
        self.extrapop = pop;
    }

    // ==================== Flags ====================

    pub fn flags(&self) -> ProtoFlags {
        self.flags
    }

    pub fn is_dotdotdot(&self) -> bool {
        self.flags.contains(ProtoFlags::DOTDOTDOT)
    }

    pub fn set_dotdotdot(&mut self, on: bool) {
        self.flags.set(ProtoFlags::DOTDOTDOT, on);
    }

    pub fn is_inline(&self) -> bool {
        self.flags.contains(ProtoFlags::IS_INLINE)
    }

    pub fn set_inline(&mut self, on: bool) {
        self.flags.set(ProtoFlags::IS_INLINE, on);
    }

    pub fn is_no_return(&self) -> bool {
        self.flags.contains(ProtoFlags::NO_RETURN)
    }

    pub fn set_no_return(&mut self, on: bool) {
        self.flags.set(ProtoFlags::NO_RETURN, on);
    }

    pub fn has_this_pointer(&self) -> bool {
        self.flags.contains(ProtoFlags::HAS_THISPTR)
    }

    pub fn is_constructor(&self) -> bool {
        self.flags.contains(ProtoFlags::IS_CONSTRUCTOR)
    }

    pub fn set_constructor(&mut self, on: bool) {
        self.flags.set(ProtoFlags::IS_CONSTRUCTOR, on);
    }

    pub fn is_destructor(&self) -> bool {
        self.flags.contains(ProtoFlags::IS_DESTRUCTOR)
    }

    pub fn set_destructor(&mut self, on: bool) {
        self.flags.set(ProtoFlags::IS_DESTRUCTOR, on);
    }

    pub fn has_input_errors(&self) -> bool {
        self.flags.contains(ProtoFlags::ERROR_INPUTPARAM)
    }

    pub fn set_input_errors(&mut self, on: bool) {
        self.flags.set(ProtoFlags::ERROR_INPUTPARAM, on);
    }

    pub fn has_output_errors(&self) -> bool {
        self.flags.contains(ProtoFlags::ERROR_OUTPUTPARAM)
    }

    pub fn set_output_errors(&mut self, on: bool) {
        self.flags.set(ProtoFlags::ERROR_OUTPUTPARAM, on);
    }

    pub fn has_custom_storage(&self) -> bool {
        self.flags.contains(ProtoFlags::CUSTOM_STORAGE)
    }

    pub fn is_override(&self) -> bool {
        self.flags.contains(ProtoFlags::IS_OVERRIDE)
    }

    pub fn set_override(&mut self, on: bool) {
        self.flags.set(ProtoFlags::IS_OVERRIDE, on);
    }

    pub fn is_paramshift_applied(&self) -> bool {
        self.flags.contains(ProtoFlags::PARAMSHIFT_APPLIED)
    }

    pub fn set_paramshift_applied(&mut self, on: bool) {
        self.flags.set(ProtoFlags::PARAMSHIFT_APPLIED, on);
    }

    pub fn inject_id(&self) -> Option<u32> {
        self.inject_id
    }

    pub fn set_inject_id(&mut self, id: Option<u32>) {
        self.inject_id = id;
    }

    // ==================== Locks ====================

    pub fn is_model_locked(&self) -> bool {
        self.flags.contains(ProtoFlags::MODEL_LOCK)
    }

    pub fn set_model_lock(&mut self, on: bool) {
        self.flags.set(ProtoFlags::MODEL_LOCK, on);
    }

    /// Inputs are locked if the prototype is locked as taking no inputs, or
    /// if its first parameter is type-locked.
    pub fn is_input_locked(&self) -> bool {
        if self.flags.contains(ProtoFlags::VOID_INPUT_LOCK) {
            return true;
        }
        self.store.input(0).is_some_and(ProtoParameter::is_type_locked)
    }

    pub fn is_output_locked(&self) -> bool {
        self.store.output().is_type_locked()
    }

    /// Locks or unlocks every input. Locking also locks the model.
    pub fn set_input_lock(&mut self, on: bool) {
        if on {
            self.flags |= ProtoFlags::MODEL_LOCK;
        }
        let num = self.store.num_inputs();
        if num == 0 {
            self.flags.set(ProtoFlags::VOID_INPUT_LOCK, on);
            return;
        }
        for i in 0..num {
            if let Some(param) = self.store.input_mut(i) {
                param.set_type_lock(on);
            }
        }
    }

    /// Locks or unlocks the output. Locking also locks the model.
    pub fn set_output_lock(&mut self, on: bool) {
        if on {
            self.flags |= ProtoFlags::MODEL_LOCK;
        }
        self.store.output_mut().set_type_lock(on);
    }

    // ==================== Parameters ====================

    pub fn num_params(&self) -> usize {
        self.store.num_inputs()
    }

    pub fn param(&self, i: usize) -> Option<&ProtoParameter> {
        self.store.input(i)
    }

    pub fn param_mut(&mut self, i: usize) -> Option<&mut ProtoParameter> {
        self.store.input_mut(i)
    }

    pub fn params(&self) -> impl Iterator<Item = &ProtoParameter> + '_ {
        (0..self.store.num_inputs()).filter_map(|i| self.store.input(i))
    }

    pub fn set_param(&mut self, i: usize, name: &str, pieces: &ParameterPieces) -> &mut ProtoParameter {
        self.store.set_input(i, name, pieces)
    }

    /// Removes input `i`, shifting later inputs down.
    pub fn remove_param(&mut self, i: usize) {
        self.store.clear_input(i);
    }

    pub fn output(&self) -> &ProtoParameter {
        self.store.output()
    }

    pub fn output_mut(&mut self) -> &mut ProtoParameter {
        self.store.output_mut()
    }

    pub fn set_output(&mut self, pieces: &ParameterPieces) -> &mut ProtoParameter {
        self.store.set_output(pieces)
    }

    /// Clears the inputs unless they are locked.
    pub fn clear_unlocked_input(&mut self) {
        if self.is_input_locked() {
            return;
        }
        self.store.clear_all_inputs();
    }

    /// Clears the output unless it is locked, and forgets how many of its
    /// bytes are consumed.
    pub fn clear_unlocked_output(&mut self) {
        if !self.is_output_locked() {
            self.store.clear_output();
        }
        self.return_bytes_consumed = 0;
    }

    /// Clears the inputs and the void-input lock.
    pub fn clear_input(&mut self) {
        self.store.clear_all_inputs();
        self.flags.remove(ProtoFlags::VOID_INPUT_LOCK);
    }

    /// Prepends `count` synthetic 4-byte parameters of unknown type and
    /// reassigns storage for the whole list.
    ///
    /// Locked inputs are kept after the synthetic ones. Unlocked inputs are
    /// discarded and the prototype becomes variadic. The result is always
    /// input-locked and backed by an in-memory store.
    pub fn param_shift(&mut self, count: usize) -> Result<()> {
        let model = Arc::clone(self.require_model()?);

        let output = if self.is_output_locked() {
            self.output().ty().clone()
        } else {
            DataType::void()
        };
        let mut names = vec![String::new(); count];
        let mut types = vec![DataType::unknown(4); count];
        let variadic = !self.is_input_locked();
        if !variadic {
            for param in self.params() {
                names.push(param.name().to_string());
                types.push(param.ty().clone());
            }
        }

        let assigned = model.assign_parameter_storage(&output, &types);
        let output_locked = self.is_output_locked();
        self.store = Box::new(InternalStore::new());
        self.store.set_output(&assigned.output).set_type_lock(output_locked);
        let mut names = names.into_iter();
        for (i, pieces) in assigned.inputs.iter().enumerate() {
            let name = if pieces.flags.contains(ParamFlags::HIDDEN_RETURN) {
                "rethidden".to_string()
            } else {
                names.next().unwrap_or_default()
            };
            self.store.set_input(i, &name, pieces);
        }
        self.set_input_lock(true);
        self.set_dotdotdot(variadic);
        log::debug!("shifted {} synthetic parameters into prototype", count);
        Ok(())
    }

    /// Derives the extra-pop from locked stack parameters.
    ///
    /// At least the 4-byte return address is popped; every locked stack
    /// parameter extends that to its 4-aligned end. A locked variadic
    /// prototype with fixed parameters pops 4.
    pub fn resolve_extra_pop(&mut self) {
        if !self.is_input_locked() {
            return;
        }
        if self.is_dotdotdot() {
            if self.num_params() != 0 {
                self.extrapop = Some(4);
            }
            return;
        }
        let mut expop: i64 = 4;
        for param in self.params() {
            let Some(addr) = param.addr() else {
                continue;
            };
            if !addr.space().is_spacebase() {
                continue;
            }
            let end = addr.offset() as i64 + i64::from(param.size());
            let end = (end + 3) & !3;
            expop = expop.max(end);
        }
        self.extrapop = Some(expop as i32);
    }

    /// Returns true if `other` could describe the same function.
    ///
    /// Models must be compatible and locked outputs must agree. Extra-pops
    /// are compared only when both are known.
    pub fn is_compatible(&self, other: &FuncProto) -> bool {
        match (self.model.as_deref(), other.model.as_deref()) {
            (Some(a), Some(b)) => {
                if !a.is_compatible(b) {
                    return false;
                }
            }
            (None, None) => {}
            _ => return false,
        }
        if other.is_output_locked() && self.is_output_locked() && self.output() != other.output() {
            return false;
        }
        if let (Some(a), Some(b)) = (self.extrapop, other.extrapop) {
            if a != b {
                return false;
            }
        }
        if self.is_dotdotdot() != other.is_dotdotdot() {
            // A variadic replacement may still refine an unlocked prototype.
            if !other.is_dotdotdot() || self.is_input_locked() {
                return false;
            }
        }
        self.inject_id == other.inject_id
            && self.is_inline() == other.is_inline()
            && self.is_no_return() == other.is_no_return()
            && self.effects == other.effects
            && self.likely_trash == other.likely_trash
    }

    // ==================== Storage questions ====================

    /// Locked parameters tested against `[addr, addr+size)`. `None` means
    /// the locks say nothing and the model must answer.
    fn locked_params(&self) -> Option<Vec<&ProtoParameter>> {
        if self.is_dotdotdot() {
            return None;
        }
        if self.flags.contains(ProtoFlags::VOID_INPUT_LOCK) {
            return Some(Vec::new());
        }
        let locked: Vec<_> = self.params().filter(|p| p.is_type_locked()).collect();
        if locked.is_empty() {
            None
        } else {
            Some(locked)
        }
    }

    /// Returns true if `[addr, addr+size)` could hold an input.
    pub fn possible_input_param(&self, addr: &Address, size: u32) -> bool {
        if !self.is_dotdotdot() && self.flags.contains(ProtoFlags::VOID_INPUT_LOCK) {
            return false;
        }
        if let Some(locked) = self.locked_params() {
            let hit = locked.iter().any(|p| {
                p.addr()
                    .is_some_and(|a| a.justified_contain(p.size(), addr, size, false) == Some(0))
            });
            if hit {
                return true;
            }
            if locked.len() == self.num_params() {
                return false;
            }
        }
        self.model
            .as_deref()
            .is_some_and(|m| m.possible_input_param(addr, size))
    }

    /// Returns true if `[addr, addr+size)` could hold the output.
    pub fn possible_output_param(&self, addr: &Address, size: u32) -> bool {
        if self.is_output_locked() {
            let out = self.output();
            if out.ty().is_void() {
                return false;
            }
            return out
                .addr()
                .is_some_and(|a| a.justified_contain(out.size(), addr, size, false) == Some(0));
        }
        self.model
            .as_deref()
            .is_some_and(|m| m.possible_output_param(addr, size))
    }

    /// Group and slot count of the model entry that could hold an input at
    /// `[addr, addr+size)`.
    pub fn possible_input_param_with_slot(&self, addr: &Address, size: u32) -> Option<(u32, u32)> {
        self.model.as_deref()?.possible_input_param_with_slot(addr, size)
    }

    fn characterize_against(param: &ProtoParameter, addr: &Address, size: u32) -> Containment {
        let Some(paddr) = param.addr() else {
            return Containment::None;
        };
        match paddr.justified_contain(param.size(), addr, size, false) {
            Some(0) => Containment::ContainsJustified,
            Some(_) => Containment::ContainsUnjustified,
            None if paddr.contained_by(param.size(), addr, size) => Containment::ContainedBy,
            None => Containment::None,
        }
    }

    /// How `[addr, addr+size)` relates to input storage.
    pub fn characterize_as_input_param(&self, addr: &Address, size: u32) -> Containment {
        if let Some(locked) = self.locked_params() {
            let mut best = Containment::None;
            for param in locked {
                match Self::characterize_against(param, addr, size) {
                    Containment::ContainsJustified => return Containment::ContainsJustified,
                    Containment::ContainsUnjustified => best = Containment::ContainsUnjustified,
                    Containment::ContainedBy if best == Containment::None => best = Containment::ContainedBy,
                    _ => {}
                }
            }
            return best;
        }
        self.model
            .as_deref()
            .map_or(Containment::None, |m| m.characterize_as_input_param(addr, size))
    }

    /// How `[addr, addr+size)` relates to output storage.
    pub fn characterize_as_output_param(&self, addr: &Address, size: u32) -> Containment {
        if self.is_output_locked() {
            let out = self.output();
            if out.ty().is_void() {
                return Containment::None;
            }
            return Self::characterize_against(out, addr, size);
        }
        self.model
            .as_deref()
            .map_or(Containment::None, |m| m.characterize_as_output_param(addr, size))
    }

    /// The input storage properly containing `[addr, addr+size)` when the
    /// range is not justified within it.
    pub fn unjustified_input_param(&self, addr: &Address, size: u32) -> Option<VarnodeData> {
        if let Some(locked) = self.locked_params() {
            for param in locked {
                let Some(paddr) = param.addr() else {
                    continue;
                };
                match paddr.justified_contain(param.size(), addr, size, false) {
                    Some(0) => return None,
                    Some(_) => return Some(VarnodeData::new(paddr, param.size())),
                    None => {}
                }
            }
            return None;
        }
        self.model.as_deref()?.unjustified_input_param(addr, size)
    }

    /// Returns true if two adjacent inputs may be joined into one.
    pub fn check_input_join(&self, hi: &Address, hi_size: u32, lo: &Address, lo_size: u32) -> bool {
        if self.is_input_locked() {
            return false;
        }
        self.model
            .as_deref()
            .is_some_and(|m| m.check_input_join(hi, hi_size, lo, lo_size))
    }

    /// Returns true if an input may be split at `split` bytes.
    pub fn check_input_split(&self, addr: &Address, size: u32, split: u32) -> bool {
        self.model
            .as_deref()
            .is_some_and(|m| m.check_input_split(addr, size, split))
    }

    pub fn max_input_delay(&self) -> u32 {
        self.model.as_deref().map_or(0, |m| m.max_input_delay())
    }

    pub fn max_output_delay(&self) -> u32 {
        self.model.as_deref().map_or(0, |m| m.max_output_delay())
    }

    // ==================== Effects ====================

    /// Effect of a call on `[addr, addr+size)`. Prototype-specific effects
    /// override the model's list.
    pub fn get_effect(&self, addr: &Address, size: u32) -> EffectType {
        if !self.effects.is_empty() {
            return lookup_effect(&self.effects, addr, size);
        }
        self.model
            .as_deref()
            .map_or(EffectType::Unknown, |m| m.has_effect(addr, size))
    }

    pub fn effects(&self) -> &[EffectRecord] {
        match (&self.model, self.effects.is_empty()) {
            (Some(model), true) => model.effects(),
            _ => &self.effects,
        }
    }

    pub fn set_effects(&mut self, mut effects: Vec<EffectRecord>) {
        effects.sort_by_key(|e| e.addr());
        self.effects = effects;
    }

    pub fn likely_trash(&self) -> &[VarnodeData] {
        match (&self.model, self.likely_trash.is_empty()) {
            (Some(model), true) => model.likely_trash(),
            _ => &self.likely_trash,
        }
    }

    pub fn set_likely_trash(&mut self, trash: Vec<VarnodeData>) {
        self.likely_trash = trash;
    }

    pub fn return_bytes_consumed(&self) -> u32 {
        self.return_bytes_consumed
    }

    /// Records that only `val` bytes of the return value are read. Keeps the
    /// smallest non-zero value and returns true if it changed.
    pub fn set_return_bytes_consumed(&mut self, val: u32) -> bool {
        if val == 0 {
            return false;
        }
        if self.return_bytes_consumed == 0 || val < self.return_bytes_consumed {
            self.return_bytes_consumed = val;
            return true;
        }
        false
    }

    // ==================== Whole-prototype updates ====================

    /// Sets the full prototype from `pieces` and locks it.
    pub fn set_pieces(&mut self, pieces: &PrototypePieces) -> Result<()> {
        if let Some(model) = &pieces.model {
            self.set_model(Arc::clone(model));
        }
        self.update_all_types(&pieces.input_names, &pieces.output, &pieces.inputs, pieces.variadic)?;
        self.set_input_lock(true);
        self.set_output_lock(true);
        self.set_model_lock(true);
        Ok(())
    }

    /// The prototype as types and names. Hidden return inputs are omitted.
    pub fn get_pieces(&self) -> PrototypePieces {
        let mut pieces = PrototypePieces::new(self.output().ty().clone());
        pieces.model = self.model.clone();
        pieces.variadic = self.is_dotdotdot();
        for param in self.params().filter(|p| !p.is_hidden_return()) {
            pieces.inputs.push(param.ty().clone());
            pieces.input_names.push(param.name().to_string());
        }
        pieces
    }

    /// Replaces every parameter, asking the model to assign storage.
    ///
    /// Assignment failures are recorded in the error flags rather than
    /// returned; the parameter keeps its type with no address.
    pub fn update_all_types(
        &mut self,
        names: &[String],
        output: &DataType,
        inputs: &[DataType],
        variadic: bool,
    ) -> Result<()> {
        let model = Arc::clone(self.require_model()?);
        self.set_model(Arc::clone(&model));
        self.store.clear_all_inputs();
        self.store.clear_output();
        self.flags.remove(ProtoFlags::VOID_INPUT_LOCK);
        self.set_dotdotdot(variadic);

        let assigned = model.assign_parameter_storage(output, inputs);
        self.set_input_errors(assigned.input_error);
        self.set_output_errors(assigned.output_error);
        self.store.set_output(&assigned.output);
        let mut names = names.iter();
        for (i, pieces) in assigned.inputs.iter().enumerate() {
            if pieces.flags.contains(ParamFlags::HIDDEN_RETURN) {
                self.store.set_input(i, "rethidden", pieces);
                continue;
            }
            let name = names.next().map_or("", String::as_str);
            self.store.set_input(i, name, pieces);
        }
        self.update_this_pointer();
        Ok(())
    }

    /// Flags the first non-hidden input as the `this` pointer when the
    /// model passes one.
    pub fn update_this_pointer(&mut self) {
        if !self.model.as_deref().is_some_and(|m| m.has_this_pointer()) {
            return;
        }
        let index = match self.store.input(0) {
            None => return,
            Some(p) if p.is_hidden_return() => 1,
            Some(_) => 0,
        };
        if let Some(param) = self.store.input_mut(index) {
            param.set_this_pointer(true);
        }
    }

    /// Rebuilds unlocked inputs from the used trials of `active`, typing
    /// each with `type_of`. `operands` are the call's inputs after the
    /// target, indexed by trial slot minus one.
    pub fn update_input_types<F>(&mut self, data: &Funcdata, operands: &[VarnodeId], active: &ParamActive, type_of: F)
    where
        F: Fn(&Funcdata, VarnodeId) -> DataType,
    {
        if self.is_input_locked() {
            return;
        }
        self.store.clear_all_inputs();
        let mut seen = HashSet::new();
        let mut count = 0;
        for trial in active.trials().iter().filter(|t| t.is_used()) {
            let Some(&vn) = trial.slot().and_then(|s| operands.get(s - 1)) else {
                continue;
            };
            // A varnode passed twice is one parameter.
            if !seen.insert(vn) {
                continue;
            }
            let varnode = data.varnode(vn);
            let addr = if varnode.is_persist() {
                varnode.addr()
            } else {
                trial.addr()
            };
            let pieces = ParameterPieces::new(Some(addr), type_of(data, vn));
            self.store.set_input(count, "", &pieces);
            count += 1;
        }
        self.update_this_pointer();
    }

    /// Like [`update_input_types`](Self::update_input_types), typing every
    /// input as unknown of the varnode's size.
    pub fn update_input_no_types(&mut self, data: &Funcdata, operands: &[VarnodeId], active: &ParamActive) {
        self.update_input_types(data, operands, active, |data, vn| {
            DataType::base(data.varnode(vn).size(), MetaType::Unknown)
        });
    }

    /// Rebuilds an unlocked output from the first recovered varnode.
    pub fn update_output_types<F>(&mut self, data: &Funcdata, outputs: &[VarnodeId], type_of: F)
    where
        F: Fn(&Funcdata, VarnodeId) -> DataType,
    {
        if self.is_output_locked() {
            return;
        }
        let Some(&first) = outputs.first() else {
            self.store.clear_output();
            return;
        };
        let pieces = ParameterPieces::new(Some(data.varnode(first).addr()), type_of(data, first));
        self.store.set_output(&pieces);
    }

    pub fn update_output_no_types(&mut self, data: &Funcdata, outputs: &[VarnodeId]) {
        self.update_output_types(data, outputs, |data, vn| {
            DataType::base(data.varnode(vn).size(), MetaType::Unknown)
        });
    }

    /// Becomes a copy of `other`.
    pub fn copy(&mut self, other: &FuncProto) {
        *self = other.clone();
    }

    /// Takes the control-flow properties (inline, no-return, injection) of
    /// `other`.
    pub fn copy_flow_effects(&mut self, other: &FuncProto) {
        let flow = ProtoFlags::IS_INLINE | ProtoFlags::NO_RETURN;
        self.flags.remove(flow);
        self.flags |= other.flags & flow;
        self.inject_id = other.inject_id;
    }
}

impl fmt::Display for FuncProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.output().ty())?;
        if let Some(name) = self.model_name() {
            write!(f, "__{} ", name)?;
        }
        write!(f, "(")?;
        for (i, param) in self.params().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        if self.is_dotdotdot() {
            if self.num_params() > 0 {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}
