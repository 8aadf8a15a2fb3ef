//! Error types for protorec-core.

use thiserror::Error;

use crate::{OpId, VarnodeId};

/// Core error type, raised by the graph edit API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An input slot index past the end of an operation's input list.
    #[error("input slot {slot} out of range for {op}")]
    SlotOutOfRange { op: OpId, slot: usize },

    /// The operation has already been destroyed.
    #[error("{0} has been destroyed")]
    DeadOp(OpId),

    /// The operation is not inserted into any block.
    #[error("{0} is not inserted in a block")]
    NotInserted(OpId),

    /// The operation is already inserted into a block.
    #[error("{0} is already inserted in a block")]
    AlreadyInserted(OpId),

    /// The varnode still has a defining operation or descendants.
    #[error("{0} is still in use and cannot be deleted")]
    VarnodeInUse(VarnodeId),

    /// No join record exists at the given join-space offset.
    #[error("no join record at offset {0:#x}")]
    UnknownJoin(u64),
}

/// Result alias for graph operations.
pub type Result<T> = std::result::Result<T, Error>;
