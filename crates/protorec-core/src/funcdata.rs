//! The per-function data-flow graph and its edit API.
//!
//! `Funcdata` owns arenas of varnodes, operations and blocks. Ids are
//! stable for the life of the function: destroyed operations and deleted
//! varnodes keep their slot and are flagged instead of removed, so a stale
//! id is detectable rather than aliasing a newer node.
//!
//! All def-use links are maintained by the edit methods here. Callers never
//! touch `Varnode::descend` or `PcodeOp::inputs` directly.

use indexmap::IndexMap;

use crate::address::{Address, SpaceManager, VarnodeData};
use crate::block::{Block, BlockId};
use crate::error::{Error, Result};
use crate::opcode::OpCode;
use crate::pcode::{OpFlags, OpId, PcodeOp};
use crate::varnode::{Varnode, VarnodeFlags, VarnodeId};

/// Data-flow graph of one function, plus analysis-wide signals.
#[derive(Debug, Clone)]
pub struct Funcdata {
    name: String,
    entry: Address,
    spaces: SpaceManager,
    varnodes: Vec<Varnode>,
    ops: Vec<PcodeOp>,
    blocks: Vec<Block>,
    unique_offset: u64,
    restart_pending: bool,
    indirect_overrides: IndexMap<Address, Address>,
    warnings: Vec<String>,
}

impl Funcdata {
    /// Creates an empty function.
    pub fn new(name: impl Into<String>, entry: Address, spaces: SpaceManager) -> Self {
        Self {
            name: name.into(),
            entry,
            spaces,
            varnodes: Vec::new(),
            ops: Vec::new(),
            blocks: Vec::new(),
            unique_offset: 0x1000,
            restart_pending: false,
            indirect_overrides: IndexMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> Address {
        self.entry
    }

    pub fn spaces(&self) -> &SpaceManager {
        &self.spaces
    }

    pub fn spaces_mut(&mut self) -> &mut SpaceManager {
        &mut self.spaces
    }

    // ==================== Queries ====================

    /// Returns the varnode with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created by this function.
    pub fn varnode(&self, id: VarnodeId) -> &Varnode {
        &self.varnodes[id.index()]
    }

    /// Returns the operation with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created by this function.
    pub fn op(&self, id: OpId) -> &PcodeOp {
        &self.ops[id.index()]
    }

    /// Returns the block with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not created by this function.
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn num_varnodes(&self) -> usize {
        self.varnodes.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Live operations in block order.
    pub fn ops_in_order(&self) -> impl Iterator<Item = OpId> + '_ {
        self.blocks.iter().flat_map(|b| b.ops.iter().copied())
    }

    /// Live call operations in block order.
    pub fn call_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.ops_in_order().filter(|&op| self.op(op).is_call())
    }

    /// Varnodes flagged as function inputs.
    pub fn inputs(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.varnodes
            .iter()
            .filter(|v| v.is_input() && !v.is_deleted())
            .map(|v| v.id)
    }

    /// Finds the input varnode with exactly the given storage.
    pub fn find_input(&self, size: u32, addr: Address) -> Option<VarnodeId> {
        self.varnodes
            .iter()
            .find(|v| v.is_input() && !v.is_deleted() && v.addr() == addr && v.size() == size)
            .map(|v| v.id)
    }

    /// The defining operation of `vn`.
    pub fn def_op(&self, vn: VarnodeId) -> Option<&PcodeOp> {
        self.varnode(vn).def.map(|op| self.op(op))
    }

    /// The varnode read by `op` in the given input slot.
    pub fn op_input(&self, op: OpId, slot: usize) -> Result<VarnodeId> {
        self.op(op)
            .input(slot)
            .ok_or(Error::SlotOutOfRange { op, slot })
    }

    /// The single operation reading `vn`, if there is exactly one.
    pub fn lone_descend(&self, vn: VarnodeId) -> Option<OpId> {
        match self.varnode(vn).descend.as_slice() {
            [op] => Some(*op),
            _ => None,
        }
    }

    /// The operation preceding `op` in its block.
    pub fn previous_op(&self, op: OpId) -> Option<OpId> {
        let block = self.block(self.op(op).block?);
        let pos = block.position(op)?;
        pos.checked_sub(1).map(|p| block.ops[p])
    }

    /// The operation following `op` in its block.
    pub fn next_op(&self, op: OpId) -> Option<OpId> {
        let block = self.block(self.op(op).block?);
        let pos = block.position(op)?;
        block.ops.get(pos + 1).copied()
    }

    // ==================== Blocks ====================

    /// Adds an empty block.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        id
    }

    /// Adds a control-flow edge.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].succs.push(to);
        self.blocks[to.index()].preds.push(from);
    }

    // ==================== Varnode creation ====================

    fn push_varnode(&mut self, loc: VarnodeData) -> VarnodeId {
        let id = VarnodeId(self.varnodes.len() as u32);
        self.varnodes.push(Varnode::new(id, loc));
        id
    }

    /// Creates a free varnode with the given storage.
    pub fn new_varnode(&mut self, size: u32, addr: Address) -> VarnodeId {
        self.push_varnode(VarnodeData::new(addr, size))
    }

    /// Creates a function input with the given storage.
    pub fn new_input(&mut self, size: u32, addr: Address) -> VarnodeId {
        let id = self.new_varnode(size, addr);
        self.varnodes[id.index()].flags |= VarnodeFlags::INPUT;
        id
    }

    /// Creates a constant.
    pub fn new_constant(&mut self, size: u32, value: u64) -> VarnodeId {
        let addr = Address::new(self.spaces.constant_space(), value);
        self.new_varnode(size, addr)
    }

    /// Creates a fresh temporary.
    pub fn new_unique(&mut self, size: u32) -> VarnodeId {
        let addr = Address::new(self.spaces.unique_space(), self.unique_offset);
        self.unique_offset += u64::from(size.max(1) + 7) & !7;
        self.new_varnode(size, addr)
    }

    /// Creates a varnode and makes it the output of `op`.
    pub fn new_varnode_out(&mut self, size: u32, addr: Address, op: OpId) -> Result<VarnodeId> {
        let vn = self.new_varnode(size, addr);
        self.op_set_output(op, vn)?;
        Ok(vn)
    }

    /// Creates a temporary and makes it the output of `op`.
    pub fn new_unique_out(&mut self, size: u32, op: OpId) -> Result<VarnodeId> {
        let vn = self.new_unique(size);
        self.op_set_output(op, vn)?;
        Ok(vn)
    }

    pub fn set_varnode_flags(&mut self, vn: VarnodeId, flags: VarnodeFlags) {
        self.varnodes[vn.index()].flags |= flags;
    }

    pub fn clear_varnode_flags(&mut self, vn: VarnodeId, flags: VarnodeFlags) {
        self.varnodes[vn.index()].flags.remove(flags);
    }

    /// Deletes a varnode that is neither written nor read.
    pub fn delete_varnode(&mut self, vn: VarnodeId) -> Result<()> {
        let v = &mut self.varnodes[vn.index()];
        if v.def.is_some() || !v.descend.is_empty() {
            return Err(Error::VarnodeInUse(vn));
        }
        v.flags = VarnodeFlags::DELETED;
        Ok(())
    }

    // ==================== Operation editing ====================

    fn live_op(&self, op: OpId) -> Result<()> {
        if self.op(op).is_dead() {
            Err(Error::DeadOp(op))
        } else {
            Ok(())
        }
    }

    fn unlink_descend(&mut self, vn: VarnodeId, op: OpId) {
        let descend = &mut self.varnodes[vn.index()].descend;
        if let Some(pos) = descend.iter().position(|&o| o == op) {
            descend.remove(pos);
        }
    }

    /// Creates an uninserted operation reading `inputs`.
    pub fn new_op(&mut self, code: OpCode, addr: Address, inputs: &[VarnodeId]) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(PcodeOp::new(id, code, addr));
        for &vn in inputs {
            self.ops[id.index()].inputs.push(vn);
            self.varnodes[vn.index()].descend.push(id);
        }
        id
    }

    pub fn op_set_opcode(&mut self, op: OpId, code: OpCode) -> Result<()> {
        self.live_op(op)?;
        self.ops[op.index()].code = code;
        Ok(())
    }

    pub fn op_set_flags(&mut self, op: OpId, flags: OpFlags) {
        self.ops[op.index()].flags |= flags;
    }

    pub fn op_clear_flags(&mut self, op: OpId, flags: OpFlags) {
        self.ops[op.index()].flags.remove(flags);
    }

    /// Replaces the input in `slot` with `vn`.
    pub fn op_set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<()> {
        self.live_op(op)?;
        let old = self.op_input(op, slot)?;
        if old == vn {
            return Ok(());
        }
        self.unlink_descend(old, op);
        self.ops[op.index()].inputs[slot] = vn;
        self.varnodes[vn.index()].descend.push(op);
        Ok(())
    }

    /// Inserts `vn` as a new input at `slot`, shifting later inputs up.
    pub fn op_insert_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> Result<()> {
        self.live_op(op)?;
        if slot > self.op(op).num_inputs() {
            return Err(Error::SlotOutOfRange { op, slot });
        }
        self.ops[op.index()].inputs.insert(slot, vn);
        self.varnodes[vn.index()].descend.push(op);
        Ok(())
    }

    /// Removes the input at `slot`, shifting later inputs down.
    pub fn op_remove_input(&mut self, op: OpId, slot: usize) -> Result<()> {
        self.live_op(op)?;
        let old = self.op_input(op, slot)?;
        self.ops[op.index()].inputs.remove(slot);
        self.unlink_descend(old, op);
        Ok(())
    }

    /// Replaces the whole input list.
    pub fn op_set_all_input(&mut self, op: OpId, inputs: &[VarnodeId]) -> Result<()> {
        self.live_op(op)?;
        let old = std::mem::take(&mut self.ops[op.index()].inputs);
        for vn in old {
            self.unlink_descend(vn, op);
        }
        for &vn in inputs {
            self.ops[op.index()].inputs.push(vn);
            self.varnodes[vn.index()].descend.push(op);
        }
        Ok(())
    }

    /// Makes `vn` the output of `op`, detaching any previous output.
    pub fn op_set_output(&mut self, op: OpId, vn: VarnodeId) -> Result<()> {
        self.live_op(op)?;
        self.op_unset_output(op)?;
        if let Some(prev) = self.varnodes[vn.index()].def {
            self.ops[prev.index()].output = None;
        }
        self.ops[op.index()].output = Some(vn);
        self.varnodes[vn.index()].def = Some(op);
        Ok(())
    }

    /// Detaches the output of `op`, leaving the varnode free.
    pub fn op_unset_output(&mut self, op: OpId) -> Result<()> {
        self.live_op(op)?;
        if let Some(out) = self.ops[op.index()].output.take() {
            self.varnodes[out.index()].def = None;
        }
        Ok(())
    }

    fn block_of(&self, op: OpId) -> Result<BlockId> {
        self.op(op).block.ok_or(Error::NotInserted(op))
    }

    fn check_uninserted(&self, op: OpId) -> Result<()> {
        self.live_op(op)?;
        if self.op(op).block.is_some() {
            return Err(Error::AlreadyInserted(op));
        }
        Ok(())
    }

    /// Inserts `op` immediately before `follow`.
    pub fn op_insert_before(&mut self, op: OpId, follow: OpId) -> Result<()> {
        self.check_uninserted(op)?;
        let bl = self.block_of(follow)?;
        let pos = self.block(bl).position(follow).ok_or(Error::NotInserted(follow))?;
        self.blocks[bl.index()].ops.insert(pos, op);
        self.ops[op.index()].block = Some(bl);
        Ok(())
    }

    /// Inserts `op` immediately after `prev`.
    pub fn op_insert_after(&mut self, op: OpId, prev: OpId) -> Result<()> {
        self.check_uninserted(op)?;
        let bl = self.block_of(prev)?;
        let pos = self.block(bl).position(prev).ok_or(Error::NotInserted(prev))?;
        self.blocks[bl.index()].ops.insert(pos + 1, op);
        self.ops[op.index()].block = Some(bl);
        Ok(())
    }

    /// Appends `op` to the end of `block`.
    pub fn op_insert_end(&mut self, op: OpId, block: BlockId) -> Result<()> {
        self.check_uninserted(op)?;
        self.blocks[block.index()].ops.push(op);
        self.ops[op.index()].block = Some(block);
        Ok(())
    }

    /// Removes `op` from its block without touching its def-use links.
    pub fn op_uninsert(&mut self, op: OpId) -> Result<()> {
        let bl = self.block_of(op)?;
        self.blocks[bl.index()].ops.retain(|&o| o != op);
        self.ops[op.index()].block = None;
        Ok(())
    }

    /// Destroys `op`: unlinks all inputs, frees the output and removes it
    /// from its block. An output with no readers is deleted as well.
    pub fn op_destroy(&mut self, op: OpId) -> Result<()> {
        self.live_op(op)?;
        if self.op(op).block.is_some() {
            self.op_uninsert(op)?;
        }
        self.op_set_all_input(op, &[])?;
        if let Some(out) = self.op(op).output {
            self.op_unset_output(op)?;
            if self.varnode(out).has_no_descend() {
                self.delete_varnode(out)?;
            }
        }
        self.ops[op.index()].flags |= OpFlags::DEAD;
        Ok(())
    }

    /// Builds a load of `size` bytes from `stackptr + offset` in `space`,
    /// inserted before `follow`, and returns the loaded value.
    ///
    /// When `stackptr` is not supplied the reference is a fresh input at
    /// the stack base address.
    pub fn op_stack_load(
        &mut self,
        space_index: u16,
        offset: u64,
        size: u32,
        follow: OpId,
        stackptr: Option<VarnodeId>,
    ) -> Result<VarnodeId> {
        let addr = self.op(follow).addr;
        let ptr_size = u32::from(self.spaces.space_by_index(space_index).map_or(4, |s| s.addr_size()));
        let base = match stackptr {
            Some(vn) => vn,
            None => {
                let stack = self
                    .spaces
                    .space_by_index(space_index)
                    .unwrap_or_else(|| self.spaces.unique_space());
                self.new_varnode(ptr_size, Address::new(stack, 0))
            }
        };
        let ptr = if offset == 0 {
            base
        } else {
            let off = self.new_constant(ptr_size, offset);
            let add = self.new_op(OpCode::IntAdd, addr, &[base, off]);
            let sum = self.new_unique_out(ptr_size, add)?;
            self.op_insert_before(add, follow)?;
            sum
        };
        let spc = self.new_constant(8, u64::from(space_index));
        let load = self.new_op(OpCode::Load, addr, &[spc, ptr]);
        let out = self.new_unique_out(size, load)?;
        self.op_insert_before(load, follow)?;
        Ok(out)
    }

    // ==================== Analysis-wide state ====================

    /// Requests that analysis of the whole function be restarted.
    pub fn set_restart_pending(&mut self, pending: bool) {
        if pending && !self.restart_pending {
            log::warn!("{}: restart of analysis requested", self.name);
        }
        self.restart_pending = pending;
    }

    pub fn is_restart_pending(&self) -> bool {
        self.restart_pending
    }

    /// Records that the indirect call at `call_addr` resolves to `callee`.
    pub fn set_indirect_override(&mut self, call_addr: Address, callee: Address) {
        self.indirect_overrides.insert(call_addr, callee);
    }

    pub fn indirect_override(&self, call_addr: &Address) -> Option<Address> {
        self.indirect_overrides.get(call_addr).copied()
    }

    /// Records a warning attached to an address.
    pub fn warning(&mut self, text: impl Into<String>, addr: Address) {
        let text = format!("{} at {}", text.into(), addr);
        log::warn!("{}: {}", self.name, text);
        self.warnings.push(text);
    }

    /// Records a warning about the function as a whole.
    pub fn warning_header(&mut self, text: impl Into<String>) {
        let text = text.into();
        log::warn!("{}: {}", self.name, text);
        self.warnings.push(text);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
