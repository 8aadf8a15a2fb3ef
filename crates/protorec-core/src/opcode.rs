//! P-code operation codes.

use std::fmt;

/// The operation performed by a [`PcodeOp`](crate::PcodeOp).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OpCode {
    Copy,
    Load,
    Store,
    Branch,
    CBranch,
    BranchInd,
    Call,
    CallInd,
    Return,
    IntEqual,
    IntNotEqual,
    IntLess,
    IntSLess,
    IntZext,
    IntSext,
    IntAdd,
    IntSub,
    IntAnd,
    IntOr,
    IntXor,
    IntMult,
    IntDiv,
    IntRem,
    IntSRem,
    IntLeft,
    IntRight,
    IntSRight,
    IntNegate,
    FloatAdd,
    FloatSub,
    FloatMult,
    FloatDiv,
    FloatFloat2Float,
    FloatInt2Float,
    MultiEqual,
    Indirect,
    Piece,
    Subpiece,
    Cast,
    PtrAdd,
    PtrSub,
}

impl OpCode {
    /// Returns true for operations that transfer control to a subroutine.
    pub fn is_call(self) -> bool {
        matches!(self, OpCode::Call | OpCode::CallInd)
    }

    /// Returns true for operations that end a basic block.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OpCode::Branch | OpCode::CBranch | OpCode::BranchInd | OpCode::Return
        )
    }

    /// Returns true for the two phi-like merge operations.
    pub fn is_marker(self) -> bool {
        matches!(self, OpCode::MultiEqual | OpCode::Indirect)
    }

    /// Returns true if the operation never produces an output.
    pub fn has_no_output(self) -> bool {
        matches!(
            self,
            OpCode::Store
                | OpCode::Branch
                | OpCode::CBranch
                | OpCode::BranchInd
                | OpCode::Return
        )
    }

    /// The conventional p-code mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Copy => "COPY",
            OpCode::Load => "LOAD",
            OpCode::Store => "STORE",
            OpCode::Branch => "BRANCH",
            OpCode::CBranch => "CBRANCH",
            OpCode::BranchInd => "BRANCHIND",
            OpCode::Call => "CALL",
            OpCode::CallInd => "CALLIND",
            OpCode::Return => "RETURN",
            OpCode::IntEqual => "INT_EQUAL",
            OpCode::IntNotEqual => "INT_NOTEQUAL",
            OpCode::IntLess => "INT_LESS",
            OpCode::IntSLess => "INT_SLESS",
            OpCode::IntZext => "INT_ZEXT",
            OpCode::IntSext => "INT_SEXT",
            OpCode::IntAdd => "INT_ADD",
            OpCode::IntSub => "INT_SUB",
            OpCode::IntAnd => "INT_AND",
            OpCode::IntOr => "INT_OR",
            OpCode::IntXor => "INT_XOR",
            OpCode::IntMult => "INT_MULT",
            OpCode::IntDiv => "INT_DIV",
            OpCode::IntRem => "INT_REM",
            OpCode::IntSRem => "INT_SREM",
            OpCode::IntLeft => "INT_LEFT",
            OpCode::IntRight => "INT_RIGHT",
            OpCode::IntSRight => "INT_SRIGHT",
            OpCode::IntNegate => "INT_NEGATE",
            OpCode::FloatAdd => "FLOAT_ADD",
            OpCode::FloatSub => "FLOAT_SUB",
            OpCode::FloatMult => "FLOAT_MULT",
            OpCode::FloatDiv => "FLOAT_DIV",
            OpCode::FloatFloat2Float => "FLOAT2FLOAT",
            OpCode::FloatInt2Float => "INT2FLOAT",
            OpCode::MultiEqual => "MULTIEQUAL",
            OpCode::Indirect => "INDIRECT",
            OpCode::Piece => "PIECE",
            OpCode::Subpiece => "SUBPIECE",
            OpCode::Cast => "CAST",
            OpCode::PtrAdd => "PTRADD",
            OpCode::PtrSub => "PTRSUB",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
