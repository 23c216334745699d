#![doc = include_str!("../../../README.md")]

mod bytecode;
mod device;
mod errors;
mod expressions;
mod function;
mod intern;
mod parse;
mod session;
mod symbols;
pub mod tracer;

pub use crate::{
    bytecode::op::{ExprKind, FlowKind, FuncFlags, OpFamily, Quartet},
    device::{
        CallArg, DEVICE_PATH, DeviceChannel, DeviceOp, ExceptionRecord, Header, KernelDevice, KernelError, VERSION,
        pack_header, unpack_header,
    },
    errors::{CompileError, CompileErrorKind, GraftError},
    function::Function,
    parse::{CodeLoc, CodeRange},
    session::{FunctionHandle, Session, SessionError},
    symbols::VarKind,
    tracer::{NoopTracer, StderrTracer, Tracer},
};

/// The native machine word. Every wire field -- opcode words, request frames,
/// argument arrays -- is one of these, little-endian.
pub type Word = usize;

/// Size of one [`Word`] in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();
