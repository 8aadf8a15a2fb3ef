//! Varnodes: the values of the data-flow graph.

use std::fmt;

use bitflags::bitflags;

use crate::address::{Address, VarnodeData};
use crate::pcode::OpId;

/// Unique identifier for a varnode within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VarnodeId(pub u32);

impl VarnodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

bitflags! {
    /// Boolean properties of a varnode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VarnodeFlags: u32 {
        /// Value flowing into the function from outside.
        const INPUT = 1 << 0;
        /// Global storage that persists beyond the function.
        const PERSIST = 1 << 1;
        /// Input storage known to hold the same value as on entry to the caller.
        const UNAFFECTED = 1 << 2;
        /// Written directly by real data-flow, not only via indirect effects.
        const DIRECT_WRITE = 1 << 3;
        /// Created by an indirect effect with no real predecessor.
        const INDIRECT_ZERO = 1 << 4;
        /// Holds the return address.
        const RETURN_ADDRESS = 1 << 5;
        /// Data-type is locked.
        const TYPE_LOCK = 1 << 6;
        /// Loaded stack value reserving the stack pointer reference at a call.
        const SPACEBASE_PLACEHOLDER = 1 << 7;
        /// Least significant half of a split double precision value.
        const PRECIS_LO = 1 << 8;
        /// Most significant half of a split double precision value.
        const PRECIS_HI = 1 << 9;
        /// Removed from the graph.
        const DELETED = 1 << 10;
        /// Produced by a copy that only exists for bookkeeping.
        const INCIDENTAL_COPY = 1 << 11;
    }
}

/// A value in the data-flow graph: storage plus def-use links.
#[derive(Debug, Clone)]
pub struct Varnode {
    pub(crate) id: VarnodeId,
    pub(crate) loc: VarnodeData,
    pub(crate) flags: VarnodeFlags,
    pub(crate) def: Option<OpId>,
    pub(crate) descend: Vec<OpId>,
}

impl Varnode {
    pub(crate) fn new(id: VarnodeId, loc: VarnodeData) -> Self {
        Self {
            id,
            loc,
            flags: VarnodeFlags::empty(),
            def: None,
            descend: Vec::new(),
        }
    }

    pub fn id(&self) -> VarnodeId {
        self.id
    }

    pub fn addr(&self) -> Address {
        self.loc.addr
    }

    pub fn size(&self) -> u32 {
        self.loc.size
    }

    pub fn offset(&self) -> u64 {
        self.loc.addr.offset()
    }

    /// Storage as a plain range.
    pub fn storage(&self) -> VarnodeData {
        self.loc
    }

    pub fn flags(&self) -> VarnodeFlags {
        self.flags
    }

    /// Defining operation, if the varnode is written.
    pub fn def(&self) -> Option<OpId> {
        self.def
    }

    /// Operations reading this varnode.
    pub fn descendants(&self) -> &[OpId] {
        &self.descend
    }

    pub fn is_written(&self) -> bool {
        self.def.is_some()
    }

    pub fn is_input(&self) -> bool {
        self.flags.contains(VarnodeFlags::INPUT)
    }

    pub fn is_constant(&self) -> bool {
        self.loc.addr.space().is_constant()
    }

    /// The value of a constant varnode.
    pub fn constant_value(&self) -> Option<u64> {
        self.is_constant().then(|| self.offset())
    }

    /// Returns true if the varnode is neither written nor an input.
    pub fn is_free(&self) -> bool {
        !self.is_written() && !self.is_input()
    }

    pub fn is_persist(&self) -> bool {
        self.flags.contains(VarnodeFlags::PERSIST)
    }

    pub fn is_unaffected(&self) -> bool {
        self.flags.contains(VarnodeFlags::UNAFFECTED)
    }

    pub fn is_direct_write(&self) -> bool {
        self.flags.contains(VarnodeFlags::DIRECT_WRITE)
    }

    pub fn is_indirect_zero(&self) -> bool {
        self.flags.contains(VarnodeFlags::INDIRECT_ZERO)
    }

    pub fn is_return_address(&self) -> bool {
        self.flags.contains(VarnodeFlags::RETURN_ADDRESS)
    }

    pub fn is_type_locked(&self) -> bool {
        self.flags.contains(VarnodeFlags::TYPE_LOCK)
    }

    pub fn is_spacebase_placeholder(&self) -> bool {
        self.flags.contains(VarnodeFlags::SPACEBASE_PLACEHOLDER)
    }

    pub fn is_incidental_copy(&self) -> bool {
        self.flags.contains(VarnodeFlags::INCIDENTAL_COPY)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(VarnodeFlags::DELETED)
    }

    pub fn has_no_descend(&self) -> bool {
        self.descend.is_empty()
    }

    /// Byte position of this varnode's least significant byte within
    /// `other`, counted from the least significant end of `other`.
    pub fn overlap(&self, other: &Varnode) -> Option<u32> {
        if !self.loc.addr.space().is_big_endian() {
            return self.loc.addr.overlap(0, &other.loc.addr, other.loc.size);
        }
        let over = self
            .loc
            .addr
            .overlap(i64::from(self.loc.size) - 1, &other.loc.addr, other.loc.size)?;
        Some(other.loc.size - 1 - over)
    }
}

impl fmt::Display for Varnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.constant_value() {
            write!(f, "#{:#x}:{}", value, self.size())
        } else {
            write!(f, "{}:{}", self.loc.addr, self.size())
        }
    }
}
