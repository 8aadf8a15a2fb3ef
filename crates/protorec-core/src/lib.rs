//! # protorec-core
//!
//! Core abstractions for parameter recovery. This crate defines the
//! address-space model used for storage containment arithmetic and the
//! arena-indexed p-code data-flow graph (varnodes, operations, blocks)
//! that the recovery engine inspects and edits.

pub mod address;
pub mod block;
pub mod error;
pub mod funcdata;
pub mod opcode;
pub mod pcode;
pub mod varnode;

pub use address::{AddrSpace, Address, JoinRecord, SpaceKind, SpaceManager, VarnodeData};
pub use block::{Block, BlockId};
pub use error::{Error, Result};
pub use funcdata::Funcdata;
pub use opcode::OpCode;
pub use pcode::{OpFlags, OpId, PcodeOp};
pub use varnode::{Varnode, VarnodeFlags, VarnodeId};
