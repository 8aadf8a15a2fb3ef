//! P-code operations.

use std::fmt;

use bitflags::bitflags;

use crate::address::Address;
use crate::block::BlockId;
use crate::opcode::OpCode;
use crate::varnode::VarnodeId;

/// Unique identifier for an operation within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpId(pub u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

bitflags! {
    /// Boolean properties of an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u32 {
        /// An INDIRECT that creates its output out of nothing.
        const INDIRECT_CREATION = 1 << 0;
        /// An INDIRECT caused by a STORE rather than a call.
        const INDIRECT_STORE = 1 << 1;
        /// A COPY whose output is only incidentally related to its input.
        const INCIDENTAL_COPY = 1 << 2;
        /// Destroyed; the id is stale.
        const DEAD = 1 << 3;
    }
}

/// A single p-code operation.
#[derive(Debug, Clone)]
pub struct PcodeOp {
    pub(crate) id: OpId,
    pub(crate) code: OpCode,
    pub(crate) addr: Address,
    pub(crate) inputs: Vec<VarnodeId>,
    pub(crate) output: Option<VarnodeId>,
    pub(crate) block: Option<BlockId>,
    pub(crate) flags: OpFlags,
}

impl PcodeOp {
    pub(crate) fn new(id: OpId, code: OpCode, addr: Address) -> Self {
        Self {
            id,
            code,
            addr,
            inputs: Vec::new(),
            output: None,
            block: None,
            flags: OpFlags::empty(),
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn code(&self) -> OpCode {
        self.code
    }

    /// Address of the machine instruction this operation came from.
    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn inputs(&self) -> &[VarnodeId] {
        &self.inputs
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, slot: usize) -> Option<VarnodeId> {
        self.inputs.get(slot).copied()
    }

    pub fn output(&self) -> Option<VarnodeId> {
        self.output
    }

    /// Block holding the operation, if inserted.
    pub fn parent(&self) -> Option<BlockId> {
        self.block
    }

    pub fn flags(&self) -> OpFlags {
        self.flags
    }

    /// First input slot holding `vn`.
    pub fn slot_of(&self, vn: VarnodeId) -> Option<usize> {
        self.inputs.iter().position(|&v| v == vn)
    }

    pub fn is_call(&self) -> bool {
        self.code.is_call()
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(OpFlags::DEAD)
    }

    pub fn is_indirect_creation(&self) -> bool {
        self.flags.contains(OpFlags::INDIRECT_CREATION)
    }

    pub fn is_indirect_store(&self) -> bool {
        self.flags.contains(OpFlags::INDIRECT_STORE)
    }

    pub fn is_incidental_copy(&self) -> bool {
        self.flags.contains(OpFlags::INCIDENTAL_COPY)
    }
}

impl fmt::Display for PcodeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(out) = self.output {
            write!(f, "{} = ", out)?;
        }
        write!(f, "{}", self.code)?;
        for (i, vn) in self.inputs.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", vn)?;
            } else {
                write!(f, ", {}", vn)?;
            }
        }
        Ok(())
    }
}
