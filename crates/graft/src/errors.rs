use std::{borrow::Cow, fmt};

use crate::{device::KernelError, parse::CodeRange, session::SessionError};

/// Classification of a compiler failure.
///
/// These are the errors that never reach the kernel: the compile aborts and
/// the session is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompileErrorKind {
    /// A function, constant, or variable name uses the reserved `KERNEL`
    /// prefix or a reserved keyword.
    ReservedName,
    /// A syntactic construct outside the supported subset.
    UnsupportedSyntax,
    /// A variable read before any assignment (arguments excepted).
    UseBeforeAssignment,
    /// A module constant defined twice, or assigned to inside a function.
    ConstantRedefinition,
    /// A malformed `word`/`pointer`/`buffer`/`array` declaration.
    BadDeclaration,
    /// A parameter default that is not an integer literal or a constant.
    BadDefault,
    /// Assignment to a buffer or array variable.
    NotAssignable,
    /// A comparison form the VM cannot evaluate (`>=`, chains, `is`, `in`).
    UnsupportedCompare,
    /// Malformed `new(...)` allocation syntax.
    BadNew,
    /// A `try` statement outside the single-`except` shape.
    UnsupportedTry,
    /// A function definition nested inside another function.
    NestedFunction,
    /// Module-level code that is not a constant, a marker, or a definition.
    NonFunctionCode,
    /// A string literal with interior NUL bytes.
    BadString,
    /// An operand whose variable kind does not fit the operation.
    TypeMismatch,
}

impl CompileErrorKind {
    fn label(self) -> &'static str {
        match self {
            Self::ReservedName => "reserved name",
            Self::UnsupportedSyntax => "unsupported syntax",
            Self::UseBeforeAssignment => "use before assignment",
            Self::ConstantRedefinition => "constant redefinition",
            Self::BadDeclaration => "bad declaration",
            Self::BadDefault => "bad default value",
            Self::NotAssignable => "not assignable",
            Self::UnsupportedCompare => "unsupported comparison",
            Self::BadNew => "bad allocation",
            Self::UnsupportedTry => "unsupported try form",
            Self::NestedFunction => "nested function",
            Self::NonFunctionCode => "code outside a function",
            Self::BadString => "bad string",
            Self::TypeMismatch => "type mismatch",
        }
    }
}

/// A compiler error with its classification and source position.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    message: Cow<'static, str>,
    position: Option<CodeRange>,
}

impl CompileError {
    pub(crate) fn new(kind: CompileErrorKind, message: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self {
            kind,
            message: message.into(),
            position: Some(position),
        }
    }

    /// An error with no single source position (module-shape problems).
    pub(crate) fn spanless(kind: CompileErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
        }
    }

    pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::new(CompileErrorKind::UnsupportedSyntax, message, position)
    }

    pub(crate) fn reserved_name(name: &str, position: CodeRange) -> Self {
        Self::new(CompileErrorKind::ReservedName, format!("illegal name `{name}`"), position)
    }

    pub(crate) fn use_before_assignment(name: &str, position: CodeRange) -> Self {
        Self::new(
            CompileErrorKind::UseBeforeAssignment,
            format!("variable `{name}` used before assignment"),
            position,
        )
    }

    pub(crate) fn constant_redefinition(name: &str, position: CodeRange) -> Self {
        Self::new(
            CompileErrorKind::ConstantRedefinition,
            format!("`{name}` is a constant"),
            position,
        )
    }

    pub(crate) fn bad_declaration(message: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::new(CompileErrorKind::BadDeclaration, message, position)
    }

    pub(crate) fn type_mismatch(message: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::new(CompileErrorKind::TypeMismatch, message, position)
    }

    /// The message without kind or position decoration.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The source position, when the error maps to one.
    #[must_use]
    pub fn position(&self) -> Option<CodeRange> {
        self.position
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => write!(f, "{}: {} at {position}", self.kind.label(), self.message),
            None => write!(f, "{}: {}", self.kind.label(), self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Any failure surfaced by this crate.
///
/// Compiler errors abort a compile before any device traffic; kernel errors
/// are mapped from the reply's error code; session errors are client-side
/// misuse; I/O errors come from the device handle itself.
#[derive(Debug)]
pub enum GraftError {
    Compile(CompileError),
    Kernel(KernelError),
    Session(SessionError),
    Io(std::io::Error),
}

impl fmt::Display for GraftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(e) => write!(f, "{e}"),
            Self::Kernel(e) => write!(f, "kernel error: {e}"),
            Self::Session(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "device i/o error: {e}"),
        }
    }
}

impl std::error::Error for GraftError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Compile(e) => Some(e),
            Self::Kernel(e) => Some(e),
            Self::Session(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<CompileError> for GraftError {
    fn from(error: CompileError) -> Self {
        Self::Compile(error)
    }
}

impl From<KernelError> for GraftError {
    fn from(error: KernelError) -> Self {
        Self::Kernel(error)
    }
}

impl From<SessionError> for GraftError {
    fn from(error: SessionError) -> Self {
        Self::Session(error)
    }
}

impl From<std::io::Error> for GraftError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}
