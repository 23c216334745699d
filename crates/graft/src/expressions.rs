use crate::{Word, parse::CodeRange};

/// An identifier (variable, function, or constant name) with source location.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct Identifier {
    pub position: CodeRange,
    pub name: String,
}

/// Binary operators accepted by the lowerer.
///
/// The subset is exactly what the kernel VM can evaluate: `+ - * / %` and the
/// bitwise `& |`. Everything else the parser rejects up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum Operator {
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    BitAnd,
    BitOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum UnaryOperator {
    /// Arithmetic negation, lowered as `0 - operand`.
    Neg,
    /// Bitwise complement (`~`).
    Invert,
    /// Boolean negation (`not`).
    Not,
}

/// Comparison operators with a direct lowering.
///
/// `>=` has none (the VM offers signed-less-than and equality only) and is
/// rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum CmpOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
}

/// An expression with its source location.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct ExprLoc {
    pub position: CodeRange,
    pub expr: Expr,
}

impl ExprLoc {
    pub fn new(position: CodeRange, expr: Expr) -> Self {
        Self { position, expr }
    }
}

/// The expression subset the lowerer consumes.
///
/// This is a sealed sum type: the parser maps every ruff AST expression onto
/// one of these variants or fails, so the lowerer dispatches exhaustively and
/// an unknown node kind cannot reach it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) enum Expr {
    /// Integer literal. Values are word-sized; negatives arrive as `Unary`.
    Int(Word),
    /// String literal, interned into the function's string table on emission.
    Str(String),
    /// `None`, which the VM has no notion of; it lowers to the word 0.
    None,
    Name(Identifier),
    Unary {
        op: UnaryOperator,
        operand: Box<ExprLoc>,
    },
    Binary {
        op: Operator,
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
    /// `and`/`or` chain; kept flat and folded during lowering.
    Bool {
        op: BoolOperator,
        values: Vec<ExprLoc>,
    },
    /// A single comparison (chains are rejected by the parser).
    Compare {
        op: CmpOperator,
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
    Call {
        func: Box<ExprLoc>,
        args: Vec<ExprLoc>,
    },
    /// Single-index subscript (`a[b]`).
    Subscript {
        value: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    /// Tuple or list display; legal only as the value of a parallel
    /// assignment.
    Tuple(Vec<ExprLoc>),
}

/// An assignment target.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) enum Target {
    Name(Identifier),
    /// `name[index] = ...`; the base must be a plain name.
    Subscript {
        name: Identifier,
        index: Box<ExprLoc>,
    },
    /// Parallel assignment; elements are names or subscripts, never nested
    /// tuples.
    Tuple(Vec<Target>),
}

/// The single `except` clause of a `try` statement.
///
/// `except word e:`, `except pointer e:`, bare-name `except e:` (implicitly
/// `word`), and handler-less `except:` are the accepted forms.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct ExceptHandler {
    /// The stated exception kind (`word`/`pointer`) or, in the bare-name
    /// form, the variable itself.
    pub exc_type: Option<Identifier>,
    /// Variable bound with `as`.
    pub name: Option<Identifier>,
    pub body: Vec<Node>,
}

/// One function parameter with its optional default expression.
///
/// Defaults are validated during lowering: only integer literals and module
/// constants are accepted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct Param {
    pub name: Identifier,
    pub default: Option<ExprLoc>,
}

/// A function definition as delivered by the parser, body unlowered.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct RawFunctionDef {
    pub name: Identifier,
    pub params: Vec<Param>,
    pub body: Vec<Node>,
}

/// The statement subset.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) enum Node {
    FunctionDef(RawFunctionDef),
    Assign {
        target: Target,
        value: ExprLoc,
    },
    AugAssign {
        target: Target,
        op: Operator,
        value: ExprLoc,
    },
    Expr(ExprLoc),
    If {
        test: ExprLoc,
        body: Vec<Node>,
        or_else: Vec<Node>,
    },
    While {
        test: ExprLoc,
        body: Vec<Node>,
    },
    Try {
        body: Vec<Node>,
        handler: ExceptHandler,
    },
    Pass,
    Return(Option<ExprLoc>),
    Raise(Option<ExprLoc>),
    Delete(Vec<ExprLoc>),
    /// Statement-position `print(...)` call, lowered to the kernel's
    /// formatted-print callable.
    Print(Vec<ExprLoc>),
}
