//! End-to-end recovery scenarios on small hand-built functions.
//!
//! Each test builds a caller with a single block ending in a call and
//! drives [`FuncCallSpecs`] the way an analysis pass would.

use std::sync::Arc;

use protorec::{
    DataType, DefaultHeuristics, FuncCallSpecs, FuncProto, ParamEntry, ProtoModel, PrototypePieces,
    RecoveryConfig, StandardModel, TypeClass,
};
use protorec_core::{AddrSpace, Address, BlockId, Funcdata, OpCode, OpId, SpaceManager, VarnodeFlags, VarnodeId};

// =============================================================================
// Fixture
// =============================================================================

struct Caller {
    fd: Funcdata,
    regs: AddrSpace,
    stack: AddrSpace,
    ram: AddrSpace,
    block: BlockId,
    model: Arc<dyn ProtoModel>,
}

impl Caller {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let spaces = SpaceManager::standard(false, 4);
        let regs = spaces.space_by_name("register").unwrap();
        let stack = spaces.space_by_name("stack").unwrap();
        let ram = spaces.space_by_name("ram").unwrap();
        let model = StandardModel::builder("regparm")
            .input(ParamEntry::exclusive(regs, 0, 4).with_type_class(TypeClass::General))
            .input(ParamEntry::exclusive(regs, 4, 4).with_type_class(TypeClass::General))
            .input(ParamEntry::sliced(stack, 4, 64, 4))
            .output(ParamEntry::exclusive(regs, 0, 4).with_type_class(TypeClass::General))
            .stack_space(stack)
            .build(&spaces)
            .unwrap();
        let mut fd = Funcdata::new("caller", Address::new(ram, 0x1000), spaces);
        let block = fd.new_block();
        Self {
            fd,
            regs,
            stack,
            ram,
            block,
            model: Arc::new(model),
        }
    }

    fn reg(&self, offset: u64) -> Address {
        Address::new(self.regs, offset)
    }

    /// Stores a constant into `addr`, as an argument setup would.
    fn store_const(&mut self, addr: Address, value: u64) -> VarnodeId {
        let c = self.fd.new_constant(4, value);
        let copy = self.fd.new_op(OpCode::Copy, Address::new(self.ram, 0x1000), &[c]);
        let vn = self.fd.new_varnode_out(4, addr, copy).unwrap();
        self.fd.op_insert_end(copy, self.block).unwrap();
        vn
    }

    fn call(&mut self, code: OpCode) -> OpId {
        let target = match code {
            OpCode::Call => self.fd.new_varnode(1, Address::new(self.ram, 0x4000)),
            _ => self.fd.new_unique(4),
        };
        let call = self.fd.new_op(code, Address::new(self.ram, 0x1020), &[target]);
        self.fd.op_insert_end(call, self.block).unwrap();
        call
    }

    fn specs(&self, call: OpId) -> FuncCallSpecs {
        let proto = FuncProto::with_model(Arc::clone(&self.model));
        FuncCallSpecs::new(&self.fd, call, proto, &RecoveryConfig::default()).unwrap()
    }

    fn locked_callee(&self, params: usize) -> FuncProto {
        let mut pieces = PrototypePieces::new(DataType::int(4, true)).with_model(Arc::clone(&self.model));
        for i in 0..params {
            pieces = pieces.input(format!("arg{}", i), DataType::int(4, true));
        }
        let mut proto = FuncProto::new();
        proto.set_pieces(&pieces).unwrap();
        proto
    }
}

fn run_to_completion(caller: &mut Caller, specs: &mut FuncCallSpecs) {
    let config = RecoveryConfig::default();
    let heur = DefaultHeuristics::new();
    for _ in 0..8 {
        specs.run_input_pass(&mut caller.fd, &heur, &config).unwrap();
        if !specs.is_input_active() {
            return;
        }
    }
    panic!("input recovery did not finish");
}

// =============================================================================
// Input recovery
// =============================================================================

#[test]
fn both_registers_written_before_call_are_parameters() {
    let mut caller = Caller::new();
    let config = RecoveryConfig::default();
    let r0 = caller.store_const(caller.reg(0), 1);
    let r1 = caller.store_const(caller.reg(4), 2);
    let call = caller.call(OpCode::Call);
    let mut specs = caller.specs(call);
    specs.init_active_input(&config);
    specs.add_input_trial(&mut caller.fd, r0).unwrap();
    specs.add_input_trial(&mut caller.fd, r1).unwrap();

    run_to_completion(&mut caller, &mut specs);

    assert_eq!(&caller.fd.op(call).inputs()[1..], &[r0, r1]);
    assert_eq!(specs.proto().num_params(), 2);
    let storage: Vec<_> = specs.proto().params().map(|p| p.addr()).collect();
    assert_eq!(storage, vec![Some(caller.reg(0)), Some(caller.reg(4))]);
}

#[test]
fn register_preserved_from_entry_is_dropped() {
    let mut caller = Caller::new();
    let config = RecoveryConfig::default();
    let r0 = caller.store_const(caller.reg(0), 1);
    // The second register still holds the caller's own incoming value,
    // carried across an earlier call that leaves it alone.
    let incoming = caller.fd.new_input(4, caller.reg(4));
    caller.fd.set_varnode_flags(incoming, VarnodeFlags::UNAFFECTED);
    let iop = caller.fd.new_constant(4, 0);
    let ind = caller
        .fd
        .new_op(OpCode::Indirect, Address::new(caller.ram, 0x1008), &[incoming, iop]);
    let r1 = caller.fd.new_varnode_out(4, caller.reg(4), ind).unwrap();
    caller.fd.op_insert_end(ind, caller.block).unwrap();

    let call = caller.call(OpCode::Call);
    let mut specs = caller.specs(call);
    specs.init_active_input(&config);
    specs.add_input_trial(&mut caller.fd, r0).unwrap();
    specs.add_input_trial(&mut caller.fd, r1).unwrap();

    run_to_completion(&mut caller, &mut specs);

    assert_eq!(&caller.fd.op(call).inputs()[1..], &[r0]);
    assert_eq!(specs.proto().num_params(), 1);
    assert!(caller.fd.varnode(r1).has_no_descend());
}

#[test]
fn stack_argument_is_recovered_relative_to_call() {
    let mut caller = Caller::new();
    let config = RecoveryConfig::default();
    let r0 = caller.store_const(caller.reg(0), 1);
    let r1 = caller.store_const(caller.reg(4), 2);
    let s = caller.store_const(Address::new(caller.stack, 4), 3);
    let call = caller.call(OpCode::Call);
    let mut specs = caller.specs(call);
    specs.init_active_input(&config);
    for vn in [r0, r1, s] {
        specs.add_input_trial(&mut caller.fd, vn).unwrap();
    }

    run_to_completion(&mut caller, &mut specs);

    assert_eq!(&caller.fd.op(call).inputs()[1..], &[r0, r1, s]);
    let last = specs.proto().param(2).unwrap();
    assert_eq!(last.addr(), Some(Address::new(caller.stack, 4)));
}

// =============================================================================
// Slot allocation
// =============================================================================

#[test]
fn stack_slot_allocation_steps_by_alignment() {
    let caller = Caller::new();
    let entry = ParamEntry::sliced(caller.stack, 0x20, 16, 4);
    let mut slot = 1;
    let got = entry.get_addr_by_slot(&mut slot, 4, 1).unwrap();
    assert_eq!(got.addr, Address::new(caller.stack, 0x24));
    assert_eq!(slot, 2);

    let mut slot = 3;
    assert!(entry.get_addr_by_slot(&mut slot, 8, 1).is_none());
    assert_eq!(slot, 3);
}

// =============================================================================
// Late restriction
// =============================================================================

#[test]
fn deindirect_refuses_prototype_that_drops_live_argument() {
    let mut caller = Caller::new();
    let config = RecoveryConfig::default();
    let r0 = caller.store_const(caller.reg(0), 1);
    let r1 = caller.store_const(caller.reg(4), 2);
    let s = caller.store_const(Address::new(caller.stack, 4), 3);
    let call = caller.call(OpCode::CallInd);
    let mut specs = caller.specs(call);
    specs.init_active_input(&config);
    for vn in [r0, r1, s] {
        specs.add_input_trial(&mut caller.fd, vn).unwrap();
    }
    specs
        .check_input_trial_use(&mut caller.fd, &DefaultHeuristics::new(), &config)
        .unwrap();
    assert!(specs.active_input().trials().iter().all(|t| t.is_active()));

    let before = caller.fd.op(call).inputs().to_vec();
    let entry = Address::new(caller.ram, 0x5000);
    let callee = caller.locked_callee(2);
    let adopted = specs.deindirect(&mut caller.fd, "callee", entry, &callee).unwrap();

    assert!(!adopted);
    assert!(caller.fd.is_restart_pending());
    assert_eq!(caller.fd.op(call).inputs(), before.as_slice());
    assert_eq!(caller.fd.op(call).code(), OpCode::CallInd);
    assert_eq!(caller.fd.indirect_override(&Address::new(caller.ram, 0x1020)), Some(entry));
    assert!(!specs.proto().is_input_locked());
}

#[test]
fn deindirect_adopts_matching_prototype() {
    let mut caller = Caller::new();
    let config = RecoveryConfig::default();
    let r0 = caller.store_const(caller.reg(0), 1);
    let r1 = caller.store_const(caller.reg(4), 2);
    let s = caller.store_const(Address::new(caller.stack, 4), 3);
    let call = caller.call(OpCode::CallInd);
    let mut specs = caller.specs(call);
    specs.init_active_input(&config);
    for vn in [r0, r1, s] {
        specs.add_input_trial(&mut caller.fd, vn).unwrap();
    }
    specs
        .check_input_trial_use(&mut caller.fd, &DefaultHeuristics::new(), &config)
        .unwrap();

    let entry = Address::new(caller.ram, 0x5000);
    let callee = caller.locked_callee(3);
    assert!(specs.deindirect(&mut caller.fd, "callee", entry, &callee).unwrap());

    assert!(!caller.fd.is_restart_pending());
    let op = caller.fd.op(call);
    assert_eq!(op.code(), OpCode::Call);
    assert_eq!(caller.fd.varnode(op.input(0).unwrap()).addr(), entry);
    assert_eq!(&op.inputs()[1..], &[r0, r1, s]);
    assert!(specs.proto().is_input_locked());
    assert!(!specs.is_input_active());
    assert_eq!(specs.name(), "callee");
    assert_eq!(specs.entry(), Some(entry));
}
