//! Wire codec and device transport.
//!
//! Requests and replies are fixed frames of five native words, little-endian.
//! The kernel signals an error by refusing the request write; the reply then
//! carries the error code in its fourth word. All pointers crossing the
//! boundary are user-space addresses the kernel reads from (or, for the
//! exception record, writes into) during the write syscall, so every staged
//! buffer must outlive its request.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
};

use crate::{Word, WORD_SIZE, errors::GraftError, tracer::{NoopTracer, Tracer}};

/// Default path of the kernel's character device.
pub const DEVICE_PATH: &str = "/dev/graft";

/// Protocol version, encoded in bytes 1 and 2 of the request header.
pub const VERSION: (u8, u8) = (1, 0);

/// Size of a request or reply frame in bytes.
pub(crate) const FRAME_BYTES: usize = 5 * WORD_SIZE;

/// Bit 7 of the header word is always set; the same bit inside the
/// operation byte marks a global-namespace request.
const HEADER_FIXED_BIT: Word = 1 << 7;
const GLOBAL_FLAG: u8 = 1 << 7;

/// Operation codes, carried in the top byte of the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
#[repr(u8)]
pub enum DeviceOp {
    Reply = 0,
    Load = 1,
    Execute = 2,
    ExecuteAnonymous = 3,
    Unload = 4,
    UnloadAnonymous = 5,
    GetLastException = 6,
}

impl DeviceOp {
    /// Decodes an operation code; out-of-table codes return `None`.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Reply),
            1 => Some(Self::Load),
            2 => Some(Self::Execute),
            3 => Some(Self::ExecuteAnonymous),
            4 => Some(Self::Unload),
            5 => Some(Self::UnloadAnonymous),
            6 => Some(Self::GetLastException),
            _ => None,
        }
    }
}

/// Packs a request header: word size in the low bits, the fixed high bit,
/// the version bytes, and the operation (with the global flag) in the top
/// byte.
#[must_use]
pub fn pack_header(op: DeviceOp, global: bool) -> Word {
    let op_byte = op as u8 | if global { GLOBAL_FLAG } else { 0 };
    WORD_SIZE | HEADER_FIXED_BIT | (Word::from(VERSION.0) << 8) | (Word::from(VERSION.1) << 16) | ((op_byte as Word) << 24)
}

/// A decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub word_size: Word,
    pub version: (u8, u8),
    /// The raw operation code; [`DeviceOp::from_code`] maps it back.
    pub op: u8,
    pub global: bool,
}

/// Unpacks a header word into its fields.
#[must_use]
pub fn unpack_header(word: Word) -> Header {
    let op_byte = ((word >> 24) & 0xff) as u8;
    Header {
        word_size: word & 0x7f,
        version: (((word >> 8) & 0xff) as u8, ((word >> 16) & 0xff) as u8),
        op: op_byte & !GLOBAL_FLAG,
        global: op_byte & GLOBAL_FLAG != 0,
    }
}

/// A five-word request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Request {
    pub words: [Word; 5],
}

impl Request {
    pub fn new(op: DeviceOp, global: bool, len1: Word, len2: Word, val1: Word, val2: Word) -> Self {
        Self {
            words: [pack_header(op, global), len1, len2, val1, val2],
        }
    }

    pub fn to_bytes(self) -> [u8; FRAME_BYTES] {
        let mut out = [0u8; FRAME_BYTES];
        for (slot, word) in self.words.iter().enumerate() {
            out[slot * WORD_SIZE..(slot + 1) * WORD_SIZE].copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// A five-word reply frame; the fourth word carries the value (or, on a
/// refused request, the error code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Response {
    pub words: [Word; 5],
}

impl Response {
    pub fn from_bytes(bytes: &[u8; FRAME_BYTES]) -> Self {
        let mut words = [0; 5];
        for (slot, chunk) in bytes.chunks_exact(WORD_SIZE).enumerate() {
            words[slot] = Word::from_le_bytes(chunk.try_into().expect("exact chunk"));
        }
        Self { words }
    }

    pub fn value(self) -> Word {
        self.words[3]
    }
}

/// The structured state of the last in-kernel exception, fetched after a
/// failed execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExceptionRecord {
    pub arg1: Word,
    pub arg2: Word,
}

/// Errors reported by the kernel, mapped from the reply's error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    NoMemory,
    RecursionTooDeep,
    WrongOperation,
    WrongVariable,
    WrongParameter,
    OperationReused,
    UnterminatedFlowBlock,
    UnexploredCode,
    BadFunctionName,
    FunctionExists,
    StackEmpty,
    BadPointer,
    BufferOutOfBounds,
    DivideByZero,
    UnknownFunction,
    BadArgCount,
    WrongArchitecture,
    UnsupportedVersion,
    NotDynamicMemory,
    /// An error code outside the fixed table.
    Unknown(Word),
}

impl KernelError {
    #[must_use]
    pub fn from_code(code: Word) -> Self {
        match code {
            1 => Self::NoMemory,
            2 => Self::RecursionTooDeep,
            3 => Self::WrongOperation,
            4 => Self::WrongVariable,
            5 => Self::WrongParameter,
            6 => Self::OperationReused,
            7 => Self::UnterminatedFlowBlock,
            8 => Self::UnexploredCode,
            9 => Self::BadFunctionName,
            10 => Self::FunctionExists,
            11 => Self::StackEmpty,
            12 => Self::BadPointer,
            13 => Self::BufferOutOfBounds,
            14 => Self::DivideByZero,
            15 => Self::UnknownFunction,
            16 => Self::BadArgCount,
            17 => Self::WrongArchitecture,
            18 => Self::UnsupportedVersion,
            19 => Self::NotDynamicMemory,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn code(self) -> Word {
        match self {
            Self::NoMemory => 1,
            Self::RecursionTooDeep => 2,
            Self::WrongOperation => 3,
            Self::WrongVariable => 4,
            Self::WrongParameter => 5,
            Self::OperationReused => 6,
            Self::UnterminatedFlowBlock => 7,
            Self::UnexploredCode => 8,
            Self::BadFunctionName => 9,
            Self::FunctionExists => 10,
            Self::StackEmpty => 11,
            Self::BadPointer => 12,
            Self::BufferOutOfBounds => 13,
            Self::DivideByZero => 14,
            Self::UnknownFunction => 15,
            Self::BadArgCount => 16,
            Self::WrongArchitecture => 17,
            Self::UnsupportedVersion => 18,
            Self::NotDynamicMemory => 19,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "no more memory"),
            Self::RecursionTooDeep => write!(f, "recursion too deep"),
            Self::WrongOperation => write!(f, "wrong operation"),
            Self::WrongVariable => write!(f, "wrong variable"),
            Self::WrongParameter => write!(f, "wrong parameter"),
            Self::OperationReused => write!(f, "an operation was used more than once"),
            Self::UnterminatedFlowBlock => write!(f, "a flow block was not terminated"),
            Self::UnexploredCode => write!(f, "some of the code was not explored"),
            Self::BadFunctionName => write!(f, "bad function name"),
            Self::FunctionExists => write!(f, "function already exists"),
            Self::StackEmpty => write!(f, "the stack is empty"),
            Self::BadPointer => write!(f, "bad pointer"),
            Self::BufferOutOfBounds => write!(f, "access outside of a buffer's limits"),
            Self::DivideByZero => write!(f, "divide by zero"),
            Self::UnknownFunction => write!(f, "unknown function"),
            Self::BadArgCount => write!(f, "bad number of arguments"),
            Self::WrongArchitecture => write!(f, "wrong architecture"),
            Self::UnsupportedVersion => write!(f, "unsupported version"),
            Self::NotDynamicMemory => write!(f, "not a dynamic memory"),
            Self::Unknown(code) => write!(f, "error {code:#x}"),
        }
    }
}

impl std::error::Error for KernelError {}

/// One argument to an executed function.
///
/// Strings are staged into NUL-terminated scratch buffers and replaced by
/// their addresses in the packed argument array; the buffers live until the
/// device write returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    Word(Word),
    Str(String),
}

impl From<Word> for CallArg {
    fn from(value: Word) -> Self {
        Self::Word(value)
    }
}

impl From<&str> for CallArg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for CallArg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// The byte channel to the kernel endpoint.
///
/// The real implementation is [`KernelDevice`]; tests substitute their own
/// to exercise the protocol without a kernel.
pub trait DeviceChannel {
    /// Writes one request frame. An `Err` is the kernel refusing the
    /// request; the reply then carries the error code.
    fn send(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Reads one reply frame, returning the number of bytes read (zero
    /// means the reply carried no value).
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// The kernel's character device.
#[derive(Debug)]
pub struct KernelDevice {
    file: File,
}

impl KernelDevice {
    /// Opens the default device node read-write.
    pub fn open() -> std::io::Result<Self> {
        Self::open_path(DEVICE_PATH)
    }

    pub fn open_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl DeviceChannel for KernelDevice {
    fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        // One write syscall per request; the driver consumes whole frames.
        let written = self.file.write(frame)?;
        if written != frame.len() {
            return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "short device write"));
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// Serializes request/reply pairs over a device channel.
///
/// A session owns one transport; requests are strictly paired with their
/// replies and never interleaved on the same handle.
pub(crate) struct Transport<D: DeviceChannel> {
    channel: D,
    tracer: Box<dyn Tracer>,
    last_exception: Option<ExceptionRecord>,
}

impl<D: DeviceChannel> Transport<D> {
    pub fn new(channel: D) -> Self {
        Self {
            channel,
            tracer: Box::new(NoopTracer),
            last_exception: None,
        }
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracer = tracer;
    }

    pub fn tracer_mut(&mut self) -> &mut dyn Tracer {
        &mut *self.tracer
    }

    /// The record fetched after the most recent failed execute.
    pub fn last_exception(&self) -> Option<ExceptionRecord> {
        self.last_exception
    }

    pub fn load(&mut self, image: &[u8], global: bool) -> Result<Option<Word>, GraftError> {
        self.exec_cmd(
            DeviceOp::Load,
            global,
            image.len() as Word,
            0,
            image.as_ptr() as Word,
            0,
        )
    }

    pub fn execute_named(&mut self, name: &str, args: &[CallArg], global: bool) -> Result<Option<Word>, GraftError> {
        let name_buf = nul_terminated(name);
        let staged = StagedArgs::new(args);
        self.exec_cmd(
            DeviceOp::Execute,
            global,
            name.len() as Word,
            staged.byte_len(),
            name_buf.as_ptr() as Word,
            staged.address(),
        )
    }

    pub fn execute_anonymous(&mut self, address: Word, args: &[CallArg], global: bool) -> Result<Option<Word>, GraftError> {
        let staged = StagedArgs::new(args);
        self.exec_cmd(DeviceOp::ExecuteAnonymous, global, 0, staged.byte_len(), address, staged.address())
    }

    pub fn unload_named(&mut self, name: &str, global: bool) -> Result<Option<Word>, GraftError> {
        let name_buf = nul_terminated(name);
        self.exec_cmd(DeviceOp::Unload, global, name.len() as Word, 0, name_buf.as_ptr() as Word, 0)
    }

    pub fn unload_anonymous(&mut self, address: Word, global: bool) -> Result<Option<Word>, GraftError> {
        self.exec_cmd(DeviceOp::UnloadAnonymous, global, 0, 0, address, 0)
    }

    /// One request/reply exchange. Returns the reply's value word, or
    /// `None` for an empty reply body.
    fn exec_cmd(
        &mut self,
        op: DeviceOp,
        global: bool,
        len1: Word,
        len2: Word,
        val1: Word,
        val2: Word,
    ) -> Result<Option<Word>, GraftError> {
        self.tracer.on_request(op, global);
        let frame = Request::new(op, global, len1, len2, val1, val2).to_bytes();
        if self.channel.send(&frame).is_err() {
            // The kernel refused the request; the reply carries the code.
            let mut buf = [0u8; FRAME_BYTES];
            self.channel.recv(&mut buf)?;
            let code = Response::from_bytes(&buf).value();
            if matches!(op, DeviceOp::Execute | DeviceOp::ExecuteAnonymous) {
                self.fetch_last_exception(code);
            }
            self.tracer.on_kernel_failure(code);
            return Err(KernelError::from_code(code).into());
        }
        let mut buf = [0u8; FRAME_BYTES];
        let read = self.channel.recv(&mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(Response::from_bytes(&buf).value()))
    }

    /// Fetches the kernel's last-exception record into a scratch buffer the
    /// kernel fills during the write; this op produces no reply frame, so no
    /// read is paired with it. The record only replaces the cached one when
    /// its code matches the failure just observed; an unrelated record (the
    /// execute failed for a non-exception reason) is ignored.
    fn fetch_last_exception(&mut self, code: Word) {
        let mut scratch: [Word; 4] = [0; 4];
        let frame = Request::new(
            DeviceOp::GetLastException,
            false,
            (WORD_SIZE * 4) as Word,
            0,
            scratch.as_mut_ptr() as Word,
            0,
        )
        .to_bytes();
        if self.channel.send(&frame).is_err() {
            // Not an exception failure after all; leave the record alone.
            return;
        }
        // SAFETY: the pointer is to our live, aligned scratch array. The
        // kernel wrote the record into it during the send syscall; the
        // volatile read keeps the compiler from assuming it is still zeroed.
        let record: [Word; 4] = unsafe { std::ptr::read_volatile(scratch.as_ptr().cast()) };
        if record[1] == code {
            self.last_exception = Some(ExceptionRecord {
                arg1: record[2],
                arg2: record[3],
            });
        }
    }
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf
}

/// Argument marshaling scratch for one execute call.
///
/// Owns the packed word array and every string staging buffer; dropping it
/// releases them, so it must outlive the device write it feeds.
struct StagedArgs {
    /// NUL-terminated string buffers referenced from `packed`.
    _strings: Vec<Vec<u8>>,
    packed: Vec<u8>,
    count: usize,
}

impl StagedArgs {
    fn new(args: &[CallArg]) -> Self {
        let mut strings = Vec::new();
        let mut words = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                CallArg::Word(word) => words.push(*word),
                CallArg::Str(s) => {
                    strings.push(nul_terminated(s));
                    words.push(strings.last().expect("just pushed").as_ptr() as Word);
                }
            }
        }
        let mut packed = Vec::with_capacity(words.len() * WORD_SIZE);
        for word in words {
            packed.extend_from_slice(&word.to_le_bytes());
        }
        Self {
            _strings: strings,
            packed,
            count: args.len(),
        }
    }

    fn byte_len(&self) -> Word {
        (self.count * WORD_SIZE) as Word
    }

    fn address(&self) -> Word {
        self.packed.as_ptr() as Word
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn header_roundtrip_for_every_op() {
        for op in DeviceOp::iter() {
            for global in [false, true] {
                let header = unpack_header(pack_header(op, global));
                assert_eq!(header.word_size, WORD_SIZE);
                assert_eq!(header.version, VERSION);
                assert_eq!(DeviceOp::from_code(header.op), Some(op));
                assert_eq!(header.global, global);
            }
        }
    }

    #[test]
    fn request_frame_layout() {
        let request = Request::new(DeviceOp::Load, true, 64, 0, 0x1000, 0);
        let bytes = request.to_bytes();
        let response = Response::from_bytes(&bytes);
        assert_eq!(response.words[1], 64);
        assert_eq!(response.words[3], 0x1000);
        let header = unpack_header(response.words[0]);
        assert_eq!(header.op, DeviceOp::Load as u8);
        assert!(header.global);
    }

    #[test]
    fn kernel_error_codes_roundtrip() {
        for code in 1..=19 {
            let error = KernelError::from_code(code);
            assert_ne!(error, KernelError::Unknown(code));
            assert_eq!(error.code(), code);
        }
        assert_eq!(KernelError::from_code(77), KernelError::Unknown(77));
        assert_eq!(KernelError::Unknown(77).code(), 77);
    }

    #[test]
    fn staged_args_pack_words_and_stage_strings() {
        let staged = StagedArgs::new(&[CallArg::Word(3), CallArg::Str("hi".into())]);
        assert_eq!(staged.byte_len(), (2 * WORD_SIZE) as Word);
        let first = Word::from_le_bytes(staged.packed[..WORD_SIZE].try_into().unwrap());
        assert_eq!(first, 3);
        let second = Word::from_le_bytes(staged.packed[WORD_SIZE..].try_into().unwrap());
        // SAFETY: the staged buffer is alive for the duration of the test.
        let staged_str = unsafe { std::slice::from_raw_parts(second as *const u8, 3) };
        assert_eq!(staged_str, b"hi\0");
    }
}
