//! Basic blocks of the data-flow graph.

use std::fmt;

use crate::pcode::OpId;

/// Unique identifier for a basic block within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(pub u32);

impl BlockId {
    /// The entry block ID (always 0).
    pub const ENTRY: Self = Self(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// An ordered list of operations with control-flow edges.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub(crate) ops: Vec<OpId>,
    pub(crate) preds: Vec<BlockId>,
    pub(crate) succs: Vec<BlockId>,
}

impl Block {
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn predecessors(&self) -> &[BlockId] {
        &self.preds
    }

    pub fn successors(&self) -> &[BlockId] {
        &self.succs
    }

    pub fn in_size(&self) -> usize {
        self.preds.len()
    }

    pub fn out_size(&self) -> usize {
        self.succs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Position of an operation within the block.
    pub fn position(&self, op: OpId) -> Option<usize> {
        self.ops.iter().position(|&o| o == op)
    }
}
