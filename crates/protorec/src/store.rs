//! Parameter storage for prototypes.

use std::fmt;

use bitflags::bitflags;
use protorec_core::{Address, VarnodeData};

use crate::types::DataType;

bitflags! {
    /// Properties of a single parameter or return value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamFlags: u32 {
        /// The data-type is authoritative.
        const TYPE_LOCK = 1 << 0;
        /// The name is authoritative.
        const NAME_LOCK = 1 << 1;
        /// The parameter is the `this` pointer of a method.
        const THIS_PTR = 1 << 2;
        /// A pointer to storage for the return value, passed as an input.
        const HIDDEN_RETURN = 1 << 3;
        /// The value lives in memory pointed to by the storage.
        const INDIRECT_STORAGE = 1 << 4;
    }
}

/// Raw storage and type for one parameter, as produced by storage assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterPieces {
    /// `None` when no storage could be assigned.
    pub addr: Option<Address>,
    pub ty: DataType,
    pub flags: ParamFlags,
}

impl ParameterPieces {
    pub fn new(addr: Option<Address>, ty: DataType) -> Self {
        Self {
            addr,
            ty,
            flags: ParamFlags::empty(),
        }
    }

    /// A void value with no storage.
    pub fn void() -> Self {
        Self::new(None, DataType::void())
    }

    pub fn with_flags(mut self, flags: ParamFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// A named, typed parameter bound to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoParameter {
    name: String,
    ty: DataType,
    addr: Option<Address>,
    flags: ParamFlags,
}

impl ProtoParameter {
    pub fn new(name: impl Into<String>, pieces: &ParameterPieces) -> Self {
        Self {
            name: name.into(),
            ty: pieces.ty.clone(),
            addr: pieces.addr,
            flags: pieces.flags,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &DataType {
        &self.ty
    }

    pub fn addr(&self) -> Option<Address> {
        self.addr
    }

    pub fn size(&self) -> u32 {
        self.ty.size()
    }

    /// Storage of the parameter, if it has an address.
    pub fn storage(&self) -> Option<VarnodeData> {
        self.addr.map(|a| VarnodeData::new(a, self.size()))
    }

    pub fn flags(&self) -> ParamFlags {
        self.flags
    }

    pub fn is_type_locked(&self) -> bool {
        self.flags.contains(ParamFlags::TYPE_LOCK)
    }

    pub fn is_name_locked(&self) -> bool {
        self.flags.contains(ParamFlags::NAME_LOCK)
    }

    pub fn is_this_pointer(&self) -> bool {
        self.flags.contains(ParamFlags::THIS_PTR)
    }

    pub fn is_hidden_return(&self) -> bool {
        self.flags.contains(ParamFlags::HIDDEN_RETURN)
    }

    pub fn is_indirect_storage(&self) -> bool {
        self.flags.contains(ParamFlags::INDIRECT_STORAGE)
    }

    pub fn set_type_lock(&mut self, on: bool) {
        self.flags.set(ParamFlags::TYPE_LOCK, on);
    }

    pub fn set_name_lock(&mut self, on: bool) {
        self.flags.set(ParamFlags::NAME_LOCK, on);
    }

    pub fn set_this_pointer(&mut self, on: bool) {
        self.flags.set(ParamFlags::THIS_PTR, on);
    }

    /// The pieces this parameter was built from.
    pub fn pieces(&self) -> ParameterPieces {
        ParameterPieces {
            addr: self.addr,
            ty: self.ty.clone(),
            flags: self.flags,
        }
    }
}

impl fmt::Display for ProtoParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        if let Some(addr) = self.addr {
            write!(f, " @ {}", addr)?;
        }
        Ok(())
    }
}

/// Backing store for the parameters of a prototype.
pub trait ProtoStore: fmt::Debug + Send + Sync {
    /// Sets input `i`, growing the list as needed.
    fn set_input(&mut self, i: usize, name: &str, pieces: &ParameterPieces) -> &mut ProtoParameter;

    /// Removes input `i`, shifting later inputs down.
    fn clear_input(&mut self, i: usize);

    fn clear_all_inputs(&mut self);

    fn num_inputs(&self) -> usize;

    fn input(&self, i: usize) -> Option<&ProtoParameter>;

    fn input_mut(&mut self, i: usize) -> Option<&mut ProtoParameter>;

    fn set_output(&mut self, pieces: &ParameterPieces) -> &mut ProtoParameter;

    /// Resets the output to void.
    fn clear_output(&mut self);

    fn output(&self) -> &ProtoParameter;

    fn output_mut(&mut self) -> &mut ProtoParameter;

    fn clone_box(&self) -> Box<dyn ProtoStore>;
}

impl Clone for Box<dyn ProtoStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A store that keeps parameters in memory only.
#[derive(Debug, Clone)]
pub struct InternalStore {
    inputs: Vec<Option<ProtoParameter>>,
    output: ProtoParameter,
}

impl InternalStore {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            output: ProtoParameter::new("", &ParameterPieces::void()),
        }
    }
}

impl Default for InternalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtoStore for InternalStore {
    fn set_input(&mut self, i: usize, name: &str, pieces: &ParameterPieces) -> &mut ProtoParameter {
        if self.inputs.len() <= i {
            self.inputs.resize(i + 1, None);
        }
        self.inputs[i].insert(ProtoParameter::new(name, pieces))
    }

    fn clear_input(&mut self, i: usize) {
        if i < self.inputs.len() {
            self.inputs.remove(i);
        }
    }

    fn clear_all_inputs(&mut self) {
        self.inputs.clear();
    }

    fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn input(&self, i: usize) -> Option<&ProtoParameter> {
        self.inputs.get(i).and_then(Option::as_ref)
    }

    fn input_mut(&mut self, i: usize) -> Option<&mut ProtoParameter> {
        self.inputs.get_mut(i).and_then(Option::as_mut)
    }

    fn set_output(&mut self, pieces: &ParameterPieces) -> &mut ProtoParameter {
        self.output = ProtoParameter::new("", pieces);
        &mut self.output
    }

    fn clear_output(&mut self) {
        self.output = ProtoParameter::new("", &ParameterPieces::void());
    }

    fn output(&self) -> &ProtoParameter {
        &self.output
    }

    fn output_mut(&mut self) -> &mut ProtoParameter {
        &mut self.output
    }

    fn clone_box(&self) -> Box<dyn ProtoStore> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protorec_core::SpaceManager;

    #[test]
    fn test_inputs_grow_and_shift() {
        let spaces = SpaceManager::standard(false, 4);
        let regs = spaces.space_by_name("register").unwrap();
        let mut store = InternalStore::new();
        let pieces = ParameterPieces::new(Some(Address::new(regs, 4)), DataType::int(4, true));
        store.set_input(2, "b", &pieces).set_type_lock(true);
        assert_eq!(store.num_inputs(), 3);
        assert!(store.input(0).is_none());
        assert!(store.input(2).unwrap().is_type_locked());

        store.clear_input(0);
        assert_eq!(store.num_inputs(), 2);
        assert_eq!(store.input(1).unwrap().name(), "b");
        assert_eq!(store.input(1).unwrap().to_string(), "int4 b @ register:0x4");
    }

    #[test]
    fn test_output_defaults_to_void() {
        let mut store = InternalStore::new();
        assert!(store.output().ty().is_void());
        store.set_output(&ParameterPieces::new(None, DataType::int(4, false)));
        assert_eq!(store.output().size(), 4);
        store.clear_output();
        assert!(store.output().ty().is_void());

        let boxed: Box<dyn ProtoStore> = Box::new(store);
        let copy = boxed.clone();
        assert_eq!(copy.num_inputs(), 0);
    }
}
