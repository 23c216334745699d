//! Quartet opcode vocabulary and word packing.
//!
//! Every opcode in a function image is a quartet of native words. The first
//! word packs the opcode family in bits 0..2, a family-specific subop in
//! bits 2..7, and a single flag in bit 7; the remaining three words are
//! family-dependent operands. The layout is shared with the kernel verifier,
//! so the numeric values here are wire constants, not implementation detail.

use crate::{Word, symbols::VarKind};

/// Opcode family, bits 0..2 of the first quartet word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
#[repr(u8)]
pub enum OpFamily {
    Function = 0,
    Variable = 1,
    Flow = 2,
    Expression = 3,
}

impl OpFamily {
    /// Decodes the family from a first quartet word.
    #[must_use]
    pub fn from_word(w0: Word) -> Self {
        match w0 & 0b11 {
            0 => Self::Function,
            1 => Self::Variable,
            2 => Self::Flow,
            _ => Self::Expression,
        }
    }
}

/// Flow opcode kinds, bits 2..7 of a flow quartet's first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum FlowKind {
    Assign = 0,
    AssignOffset = 1,
    If = 2,
    Try = 3,
    While = 4,
    DynFree = 5,
    BlockEnd = 6,
    Throw = 7,
    Ret = 8,
}

/// Expression opcode kinds, bits 2..7 of an expression quartet's first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ExprKind {
    Word = 0,
    Var = 1,
    String = 2,
    ExceptionVar = 3,
    AddressOf = 4,
    Deref = 5,
    BufOffset = 6,
    Add = 7,
    Sub = 8,
    Mul = 9,
    Div = 10,
    And = 11,
    Xor = 12,
    Or = 13,
    BoolAnd = 14,
    BoolOr = 15,
    Not = 16,
    BoolNot = 17,
    Mod = 18,
    CallString = 19,
    CallPtr = 20,
    CallEnd = 21,
    CmpEq = 22,
    CmpUnsign = 23,
    CmpSign = 24,
    DynAlloc = 25,
    Args = 26,
    Exp = 27,
}

bitflags::bitflags! {
    /// Function-type flags, carried in the function quartet and on call
    /// opcodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FuncFlags: Word {
        /// The callee takes a variable number of arguments.
        const VARIABLE_ARGUMENT = 1;
        /// The callee is resolved outside the module (kernel callable or
        /// function pointer); its arguments are emitted reversed.
        const EXTERNAL = 2;
    }
}

/// Four consecutive native words forming one opcode in a function image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quartet(pub [Word; 4]);

impl Quartet {
    /// The function header quartet.
    pub(crate) fn function(
        min_args: Word,
        return_exception_value: bool,
        name_id: Word,
        error_return: Word,
        function_type: FuncFlags,
    ) -> Self {
        Self([
            OpFamily::Function as Word | (min_args << 2) | (Word::from(return_exception_value) << 7),
            name_id,
            error_return,
            function_type.bits(),
        ])
    }

    /// One declared-variable quartet. `Undef` entries are emitted as `Word`.
    pub(crate) fn variable(kind: VarKind, is_arg: bool, size: Word, init: Word, flags: Word) -> Self {
        Self([
            OpFamily::Variable as Word | (kind.code() << 2) | (Word::from(is_arg) << 7),
            size,
            init,
            flags,
        ])
    }

    /// The opcode family of this quartet.
    #[must_use]
    pub fn family(self) -> OpFamily {
        OpFamily::from_word(self.0[0])
    }

    /// The subop field (bits 2..7): flow kind, expression kind, variable
    /// kind, or the function header's minimum-argument count.
    #[must_use]
    pub fn subop(self) -> Word {
        (self.0[0] >> 2) & 0x1f
    }

    /// The bit-7 flag: `is_arg` for variables, the return-on-unhandled-
    /// exception flag for the function header.
    #[must_use]
    pub fn flag(self) -> bool {
        self.0[0] & (1 << 7) != 0
    }

    /// Appends the quartet's little-endian wire form.
    pub fn write_le(self, out: &mut Vec<u8>) {
        for word in self.0 {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
}
