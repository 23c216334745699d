//! The AST lowerer: module walker and per-function statement/expression
//! emission.
//!
//! Module scope admits exactly four forms: integer constants, the
//! `VARIABLE_ARGUMENT`/`ANONYMOUS`/`STATIC` marker calls, function
//! definitions, and `pass`. Function bodies lower into nested flow frames of
//! pending opcodes; the offset resolver flattens them at image-build time.

use ahash::AHashSet;
use indexmap::IndexMap;

use super::{
    builder::{Operand, PendingOp},
    op::{ExprKind, FlowKind, FuncFlags},
};
use crate::{
    Word, WORD_SIZE,
    errors::{CompileError, CompileErrorKind, GraftError},
    expressions::{
        BoolOperator, CmpOperator, ExceptHandler, Expr, ExprLoc, Identifier, Node, Operator, RawFunctionDef, Target,
        UnaryOperator,
    },
    function::Function,
    parse::{self, CodeRange},
    session::FunctionHandle,
    symbols::{self, SINK_NAME, VarKind},
};

/// Callee names with this prefix are kernel-resident; the prefix is stripped
/// before the name reaches the string table.
const EXTERNAL_CALL_PREFIX: &str = "KERNEL_";

/// The kernel's formatted-print callable, used by print lowering.
const PRINTK: &str = "printk";

/// A compiled-and-loaded format helper, cached on its owning function.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadedHelper {
    pub handle: FunctionHandle,
    pub address: Word,
}

/// The lowerer's window onto the session while a module compiles.
///
/// Format-string lowering needs a loaded helper function whose kernel
/// address it can embed; the session provides one by compiling and loading
/// the helper source through itself.
pub(crate) trait HelperHost {
    /// Compiles and loads the `arity`-parameter format helper, returning its
    /// registry handle and kernel address.
    fn synthesize_format_helper(&mut self, arity: usize) -> Result<LoadedHelper, GraftError>;
}

/// Compiles a module's source into its functions, in definition order.
///
/// Compiler errors abort the whole compile; no function of a failed module
/// is returned. Only format helpers touch the device during this call.
pub(crate) fn compile_source<H: HelperHost>(source: &str, host: &mut H) -> Result<Vec<Function>, GraftError> {
    let nodes = parse::parse(source)?;
    let mut compiler = ModuleCompiler::new(host);
    for node in nodes {
        compiler.module_statement(&node)?;
    }
    Ok(compiler.functions)
}

/// Module-scope state: constants, the three marker sets, and the functions
/// compiled so far.
struct ModuleCompiler<'h, H: HelperHost> {
    host: &'h mut H,
    consts: IndexMap<String, Word>,
    variable_argument_names: AHashSet<String>,
    anonymous_names: AHashSet<String>,
    static_names: AHashSet<String>,
    functions: Vec<Function>,
}

impl<'h, H: HelperHost> ModuleCompiler<'h, H> {
    fn new(host: &'h mut H) -> Self {
        Self {
            host,
            consts: IndexMap::new(),
            variable_argument_names: AHashSet::new(),
            anonymous_names: AHashSet::new(),
            static_names: AHashSet::new(),
            functions: Vec::new(),
        }
    }

    fn module_statement(&mut self, node: &Node) -> Result<(), GraftError> {
        match node {
            Node::FunctionDef(def) => {
                let function = self.lower_function(def)?;
                self.functions.push(function);
                Ok(())
            }
            Node::Assign { target, value } => {
                if let (Target::Name(name), Expr::Int(n)) = (target, &value.expr) {
                    if self.consts.contains_key(&name.name) {
                        return Err(CompileError::constant_redefinition(&name.name, name.position).into());
                    }
                    symbols::validate_name(&name.name, name.position)?;
                    self.consts.insert(name.name.clone(), *n);
                    Ok(())
                } else {
                    Err(non_function_code())
                }
            }
            Node::Expr(expr) => self.module_marker(expr),
            Node::Pass => Ok(()),
            _ => Err(non_function_code()),
        }
    }

    /// Accepts the three marker calls; everything else is code outside a
    /// function.
    fn module_marker(&mut self, expr: &ExprLoc) -> Result<(), GraftError> {
        if let Expr::Call { func, args } = &expr.expr
            && let Expr::Name(callee) = &func.expr
            && args.len() == 1
            && let Expr::Str(marked) = &args[0].expr
        {
            let set = match callee.name.as_str() {
                "VARIABLE_ARGUMENT" => &mut self.variable_argument_names,
                "ANONYMOUS" => &mut self.anonymous_names,
                "STATIC" => &mut self.static_names,
                _ => return Err(non_function_code()),
            };
            set.insert(marked.clone());
            return Ok(());
        }
        Err(non_function_code())
    }

    fn lower_function(&mut self, def: &RawFunctionDef) -> Result<Function, GraftError> {
        let mut function = Function::new(&def.name.name, def.name.position)?;
        if self.variable_argument_names.contains(&def.name.name) {
            function.function_type |= FuncFlags::VARIABLE_ARGUMENT;
        }
        function.anonymous = self.anonymous_names.contains(&def.name.name);
        function.is_static = self.static_names.contains(&def.name.name);

        let defaults = def.params.iter().filter(|p| p.default.is_some()).count();
        function.max_args = def.params.len();
        function.min_args = function.max_args - defaults;
        for param in &def.params {
            let init = match &param.default {
                None => 0,
                Some(default) => self.default_value(default)?,
            };
            function.symbols.add_argument(&param.name.name, init, param.name.position)?;
        }

        let mut lowerer = FunctionLowerer {
            module: self,
            func: &mut function,
            frames: Vec::new(),
            block_stopped: false,
            temp_counter: 0,
        };
        lowerer.frame_open();
        lowerer.lower_block(&def.body)?;
        let body = lowerer.frame_close_function();
        function.body = body;
        Ok(function)
    }

    /// A parameter default: an integer literal or a module constant.
    fn default_value(&self, default: &ExprLoc) -> Result<Word, CompileError> {
        match &default.expr {
            Expr::Int(n) => Ok(*n),
            Expr::Name(id) => self.consts.get(&id.name).copied().ok_or_else(|| {
                CompileError::new(
                    CompileErrorKind::BadDefault,
                    format!("`{}` is not a constant", id.name),
                    id.position,
                )
            }),
            _ => Err(CompileError::new(
                CompileErrorKind::BadDefault,
                "defaults must be integer literals or constants",
                default.position,
            )),
        }
    }
}

fn non_function_code() -> GraftError {
    CompileError::spanless(CompileErrorKind::NonFunctionCode, "all code must be inside a function").into()
}

/// The value of a lowered expression.
///
/// A plain variable reference stays a bare id (the kernel reads operand
/// words below the body's first offset as variable ids); anything else is a
/// quartet, and calls are whole quartet chains.
enum ExprValue {
    Var(Word),
    Op(PendingOp),
    Call(Vec<PendingOp>),
}

impl ExprValue {
    fn into_operand(self) -> Operand {
        match self {
            Self::Var(id) => Operand::Value(id),
            Self::Op(op) => Operand::Expr(Box::new(op)),
            Self::Call(ops) => Operand::Block(ops),
        }
    }

    /// Forces a quartet: bare ids become `EXP_VAR`, call chains are wrapped
    /// in `EXP_EXP`. Call-argument slots and print operands must be single
    /// quartets, never bare ids.
    fn into_quartet(self) -> PendingOp {
        match self {
            Self::Var(id) => PendingOp::expr(ExprKind::Var, Operand::Value(id), Operand::Value(0)),
            Self::Op(op) => op,
            Self::Call(ops) => PendingOp::expr(ExprKind::Exp, Operand::Block(ops), Operand::Value(0)),
        }
    }
}

fn binop_kind(op: Operator) -> ExprKind {
    match op {
        Operator::Add => ExprKind::Add,
        Operator::Sub => ExprKind::Sub,
        Operator::Mult => ExprKind::Mul,
        Operator::Div => ExprKind::Div,
        Operator::Mod => ExprKind::Mod,
        Operator::BitAnd => ExprKind::And,
        Operator::BitOr => ExprKind::Or,
    }
}

/// Per-function lowering state: the frame stack and the block-stopped flag.
struct FunctionLowerer<'a, 'h, H: HelperHost> {
    module: &'a mut ModuleCompiler<'h, H>,
    func: &'a mut Function,
    /// Stack of open flow frames; statements emit into the innermost.
    frames: Vec<Vec<PendingOp>>,
    /// Set by `return` and `raise`; the rest of the frame is dropped and the
    /// frame closer skips its terminator.
    block_stopped: bool,
    temp_counter: u32,
}

impl<H: HelperHost> FunctionLowerer<'_, '_, H> {
    fn flow_push(&mut self, op: PendingOp) {
        self.frames.last_mut().expect("no open flow frame").push(op);
    }

    fn frame_open(&mut self) {
        self.frames.push(Vec::new());
    }

    /// Closes the innermost frame, appending `BLOCKEND` unless a
    /// terminating statement already ended it.
    fn frame_close(&mut self) -> Vec<PendingOp> {
        if !self.block_stopped {
            self.flow_push(PendingOp::flow(
                FlowKind::BlockEnd,
                Operand::Value(0),
                Operand::Value(0),
                Operand::Value(0),
            ));
        }
        self.block_stopped = false;
        self.frames.pop().expect("no open flow frame")
    }

    /// Closes the outermost frame; an unterminated function body falls off
    /// the end into `return 0`.
    fn frame_close_function(&mut self) -> Vec<PendingOp> {
        if !self.block_stopped {
            self.flow_push(PendingOp::flow(
                FlowKind::Ret,
                Operand::Expr(Box::new(PendingOp::word(0))),
                Operand::Value(0),
                Operand::Value(0),
            ));
        }
        self.block_stopped = false;
        self.frames.pop().expect("no open flow frame")
    }

    fn lower_block(&mut self, nodes: &[Node]) -> Result<(), GraftError> {
        for node in nodes {
            self.statement(node)?;
            if self.block_stopped {
                break;
            }
        }
        Ok(())
    }

    fn statement(&mut self, node: &Node) -> Result<(), GraftError> {
        match node {
            Node::FunctionDef(def) => Err(CompileError::new(
                CompileErrorKind::NestedFunction,
                "functions cannot be defined inside a function",
                def.name.position,
            )
            .into()),
            Node::Assign { target, value } => self.lower_assign(target, value),
            Node::AugAssign { target, op, value } => {
                let current = self.eval_target(target)?;
                let rhs = self.eval(value)?;
                let combined = ExprValue::Op(PendingOp::expr(
                    binop_kind(*op),
                    current.into_operand(),
                    rhs.into_operand(),
                ));
                self.assign_value(target, combined)
            }
            Node::Expr(expr) => self.lower_expr_statement(expr),
            Node::If { test, body, or_else } => {
                let test = self.eval(test)?;
                self.frame_open();
                self.lower_block(body)?;
                let body_ops = self.frame_close();
                self.frame_open();
                self.lower_block(or_else)?;
                let else_ops = self.frame_close();
                self.flow_push(PendingOp::flow(
                    FlowKind::If,
                    test.into_operand(),
                    Operand::Block(body_ops),
                    Operand::Block(else_ops),
                ));
                Ok(())
            }
            Node::While { test, body } => {
                let test = self.eval(test)?;
                self.frame_open();
                self.lower_block(body)?;
                let body_ops = self.frame_close();
                self.flow_push(PendingOp::flow(
                    FlowKind::While,
                    test.into_operand(),
                    Operand::Block(body_ops),
                    Operand::Value(0),
                ));
                Ok(())
            }
            Node::Try { body, handler } => self.lower_try(body, handler),
            Node::Pass => Ok(()),
            Node::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => ExprValue::Op(PendingOp::word(0)),
                };
                self.flow_push(PendingOp::flow(
                    FlowKind::Ret,
                    value.into_operand(),
                    Operand::Value(0),
                    Operand::Value(0),
                ));
                self.block_stopped = true;
                Ok(())
            }
            Node::Raise(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => ExprValue::Op(PendingOp::word(0)),
                };
                self.flow_push(PendingOp::flow(
                    FlowKind::Throw,
                    value.into_operand(),
                    Operand::Value(0),
                    Operand::Value(0),
                ));
                self.block_stopped = true;
                Ok(())
            }
            Node::Delete(targets) => {
                for target in targets {
                    let value = self.eval(target)?;
                    self.flow_push(PendingOp::flow(
                        FlowKind::DynFree,
                        value.into_operand(),
                        Operand::Value(0),
                        Operand::Value(0),
                    ));
                }
                Ok(())
            }
            Node::Print(values) => self.lower_print(values),
        }
    }

    /// Expression statements: either the statement form of a declaration
    /// (`buffer(b, 16)`), or an evaluation whose result lands in the sink.
    fn lower_expr_statement(&mut self, expr: &ExprLoc) -> Result<(), GraftError> {
        if let Expr::Call { func, args } = &expr.expr
            && let Expr::Name(callee) = &func.expr
            && let Some(kind) = VarKind::from_keyword(&callee.name)
        {
            let Some(Expr::Name(var_name)) = args.first().map(|a| &a.expr) else {
                return Err(CompileError::bad_declaration(
                    "the declaration's first argument must name the variable",
                    expr.position,
                )
                .into());
            };
            let (size, init, flags) = self.declaration_values(kind, args, true, expr.position)?;
            self.func
                .symbols
                .declare(&var_name.name, kind, size, init, flags, var_name.position)?;
            return Ok(());
        }
        let value = self.eval(expr)?;
        let sink = self.func.symbols.touch(SINK_NAME, expr.position)?;
        self.flow_push(PendingOp::flow(
            FlowKind::Assign,
            Operand::Value(sink.id.word()),
            value.into_operand(),
            Operand::Value(0),
        ));
        Ok(())
    }

    fn lower_assign(&mut self, target: &Target, value: &ExprLoc) -> Result<(), GraftError> {
        if let Target::Tuple(elements) = target {
            let Expr::Tuple(values) = &value.expr else {
                return Err(CompileError::type_mismatch(
                    "parallel assignment needs a tuple or list value",
                    value.position,
                )
                .into());
            };
            if values.len() != elements.len() {
                return Err(CompileError::type_mismatch(
                    "parallel assignment arity mismatch",
                    value.position,
                )
                .into());
            }
            // Copy every value into a fresh temporary first, then the
            // temporaries into the targets, so `a, b = b, a` swaps.
            let mut temps = Vec::with_capacity(values.len());
            for element in values {
                let temp = self.next_temp();
                let evaluated = self.eval(element)?;
                self.assign_temp(&temp, evaluated, element.position)?;
                temps.push(temp);
            }
            for (element, temp) in elements.iter().zip(temps) {
                let value = self.eval_var_ref(&temp, value.position, false)?;
                self.assign_value(element, value)?;
            }
            return Ok(());
        }

        // A call to a kind keyword on the right-hand side declares the
        // target instead of assigning to it.
        if let Target::Name(target_name) = target
            && let Expr::Call { func, args } = &value.expr
            && let Expr::Name(callee) = &func.expr
            && let Some(kind) = VarKind::from_keyword(&callee.name)
        {
            if self.func.symbols.contains(&target_name.name) {
                return Err(CompileError::bad_declaration(
                    format!("variable `{}` already exists", target_name.name),
                    target_name.position,
                )
                .into());
            }
            let (size, init, flags) = self.declaration_values(kind, args, false, value.position)?;
            if self.module.consts.contains_key(&target_name.name) {
                return Err(CompileError::constant_redefinition(&target_name.name, target_name.position).into());
            }
            self.func
                .symbols
                .declare(&target_name.name, kind, size, init, flags, target_name.position)?;
            return Ok(());
        }

        let evaluated = self.eval(value)?;
        self.assign_value(target, evaluated)
    }

    fn assign_value(&mut self, target: &Target, value: ExprValue) -> Result<(), GraftError> {
        match target {
            Target::Name(id) => {
                if self.module.consts.contains_key(&id.name) {
                    return Err(CompileError::constant_redefinition(&id.name, id.position).into());
                }
                if let Some(entry) = self.func.symbols.get(&id.name)
                    && entry.kind.is_buffer_like()
                {
                    return Err(CompileError::new(
                        CompileErrorKind::NotAssignable,
                        format!("cannot assign to the {} `{}`", kind_noun(entry.kind), id.name),
                        id.position,
                    )
                    .into());
                }
                let entry = self.func.symbols.touch(&id.name, id.position)?;
                self.flow_push(PendingOp::flow(
                    FlowKind::Assign,
                    Operand::Value(entry.id.word()),
                    value.into_operand(),
                    Operand::Value(0),
                ));
                Ok(())
            }
            Target::Subscript { name, index } => {
                let Some(entry) = self.func.symbols.get(&name.name) else {
                    return Err(CompileError::use_before_assignment(&name.name, name.position).into());
                };
                if entry.kind == VarKind::Word {
                    return Err(CompileError::type_mismatch(
                        format!("`{}` cannot be used as a pointer", name.name),
                        name.position,
                    )
                    .into());
                }
                // Storing a string literal into a byte slot stores the
                // string's first byte, not its address.
                let stores_string_literal = matches!(entry.kind, VarKind::Buffer | VarKind::Pointer)
                    && matches!(&value, ExprValue::Op(op) if op.is_expr_kind(ExprKind::String));
                let value = if stores_string_literal {
                    let ExprValue::Op(op) = value else { unreachable!() };
                    ExprValue::Op(PendingOp::expr(
                        ExprKind::Deref,
                        Operand::Expr(Box::new(op)),
                        Operand::Value(1),
                    ))
                } else {
                    value
                };
                let index = self.eval(index)?;
                self.flow_push(PendingOp::flow(
                    FlowKind::AssignOffset,
                    Operand::Value(entry.id.word()),
                    index.into_operand(),
                    value.into_operand(),
                ));
                Ok(())
            }
            Target::Tuple(_) => Err(CompileError::spanless(
                CompileErrorKind::UnsupportedSyntax,
                "nested parallel assignment targets",
            )
            .into()),
        }
    }

    /// Assignment into a compiler temporary (always a fresh word variable).
    fn assign_temp(&mut self, temp: &str, value: ExprValue, position: CodeRange) -> Result<(), GraftError> {
        let entry = self.func.symbols.touch(temp, position)?;
        self.flow_push(PendingOp::flow(
            FlowKind::Assign,
            Operand::Value(entry.id.word()),
            value.into_operand(),
            Operand::Value(0),
        ));
        Ok(())
    }

    /// Collects declaration arguments and derives `(size, init, flags)`.
    ///
    /// In statement form the first argument names the variable and is
    /// skipped. `array` sizes are in words, everything else in bytes.
    fn declaration_values(
        &self,
        kind: VarKind,
        args: &[ExprLoc],
        skip_first: bool,
        position: CodeRange,
    ) -> Result<(Word, Word, Word), GraftError> {
        let mut values = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            if skip_first && i == 0 {
                continue;
            }
            match &arg.expr {
                Expr::Int(n) => values.push(*n),
                Expr::Name(id) => match self.module.consts.get(&id.name) {
                    Some(value) => values.push(*value),
                    None => {
                        return Err(CompileError::bad_declaration(
                            "declaration arguments must be integer literals or constants",
                            arg.position,
                        )
                        .into());
                    }
                },
                _ => {
                    return Err(CompileError::bad_declaration(
                        "declaration arguments must be integer literals or constants",
                        arg.position,
                    )
                    .into());
                }
            }
        }
        match kind {
            VarKind::Word | VarKind::Pointer => {
                if args.len() > 1 {
                    return Err(
                        CompileError::bad_declaration("word and pointer take at most one value", position).into(),
                    );
                }
                let init = values.first().copied().unwrap_or(0);
                Ok((WORD_SIZE, init, 0))
            }
            VarKind::Buffer | VarKind::Array => {
                if values.is_empty() || values.len() > 2 {
                    return Err(CompileError::bad_declaration("a size and an optional initializer", position).into());
                }
                let mult = if kind == VarKind::Array { WORD_SIZE } else { 1 };
                let size = values[0] * mult;
                let init = values.get(1).copied().unwrap_or(0);
                Ok((size, init, 0))
            }
            VarKind::Undef => unreachable!("no keyword maps to Undef"),
        }
    }

    /// Evaluates an assignment target as an expression (augmented
    /// assignment reads its target first).
    fn eval_target(&mut self, target: &Target) -> Result<ExprValue, GraftError> {
        match target {
            Target::Name(id) => self.eval_name(id),
            Target::Subscript { name, index } => self.eval_named_subscript(name, index),
            Target::Tuple(_) => Err(CompileError::spanless(
                CompileErrorKind::UnsupportedSyntax,
                "parallel targets cannot be read",
            )
            .into()),
        }
    }

    fn eval(&mut self, expr: &ExprLoc) -> Result<ExprValue, GraftError> {
        match &expr.expr {
            Expr::Int(n) => Ok(ExprValue::Op(PendingOp::word(*n))),
            Expr::None => Ok(ExprValue::Op(PendingOp::word(0))),
            Expr::Str(s) => {
                let id = self.func.strings.intern(s)?;
                Ok(ExprValue::Op(PendingOp::expr(
                    ExprKind::String,
                    Operand::Value(id.word()),
                    Operand::Value(0),
                )))
            }
            Expr::Name(id) => self.eval_name(id),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(ExprValue::Op(match op {
                    UnaryOperator::Neg => PendingOp::expr(
                        ExprKind::Sub,
                        Operand::Expr(Box::new(PendingOp::word(0))),
                        value.into_operand(),
                    ),
                    UnaryOperator::Not => {
                        PendingOp::expr(ExprKind::BoolNot, value.into_operand(), Operand::Value(0))
                    }
                    UnaryOperator::Invert => {
                        PendingOp::expr(ExprKind::Not, value.into_operand(), Operand::Value(0))
                    }
                }))
            }
            Expr::Binary { op, left, right } => {
                if *op == Operator::Mod && matches!(left.expr, Expr::Str(_)) {
                    return self.eval_format(left, right);
                }
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(ExprValue::Op(PendingOp::expr(
                    binop_kind(*op),
                    left.into_operand(),
                    right.into_operand(),
                )))
            }
            Expr::Bool { op, values } => {
                let kind = match op {
                    BoolOperator::And => ExprKind::BoolAnd,
                    BoolOperator::Or => ExprKind::BoolOr,
                };
                let mut accumulator = self.eval(&values[0])?;
                for value in &values[1..] {
                    let next = self.eval(value)?;
                    accumulator = ExprValue::Op(PendingOp::expr(
                        kind,
                        next.into_operand(),
                        accumulator.into_operand(),
                    ));
                }
                Ok(accumulator)
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(ExprValue::Op(match op {
                    CmpOperator::Lt => {
                        PendingOp::expr(ExprKind::CmpSign, left.into_operand(), right.into_operand())
                    }
                    CmpOperator::Gt => {
                        PendingOp::expr(ExprKind::CmpSign, right.into_operand(), left.into_operand())
                    }
                    CmpOperator::LtE => {
                        let reversed =
                            PendingOp::expr(ExprKind::CmpSign, right.into_operand(), left.into_operand());
                        PendingOp::expr(ExprKind::BoolNot, Operand::Expr(Box::new(reversed)), Operand::Value(0))
                    }
                    CmpOperator::Eq => {
                        PendingOp::expr(ExprKind::CmpEq, left.into_operand(), right.into_operand())
                    }
                    CmpOperator::NotEq => {
                        let equal =
                            PendingOp::expr(ExprKind::CmpEq, left.into_operand(), right.into_operand());
                        PendingOp::expr(ExprKind::BoolNot, Operand::Expr(Box::new(equal)), Operand::Value(0))
                    }
                }))
            }
            Expr::Call { func, args } => self.eval_call(func, args, expr.position),
            Expr::Subscript { value, index } => {
                if let Expr::Name(id) = &value.expr {
                    self.eval_named_subscript(id, index)
                } else {
                    let base = self.eval(value)?;
                    let offset = self.eval(index)?;
                    let address =
                        PendingOp::expr(ExprKind::Add, base.into_operand(), offset.into_operand());
                    Ok(ExprValue::Op(PendingOp::expr(
                        ExprKind::Deref,
                        Operand::Expr(Box::new(address)),
                        Operand::Value(1),
                    )))
                }
            }
            Expr::Tuple(_) => Err(CompileError::unsupported(
                "tuples are only legal in parallel assignment",
                expr.position,
            )
            .into()),
        }
    }

    /// Names evaluate to the constant's value, the variable's bare id, or an
    /// `ADDRESSOF` quartet for buffers and arrays.
    fn eval_name(&mut self, id: &Identifier) -> Result<ExprValue, GraftError> {
        if let Some(value) = self.module.consts.get(&id.name) {
            return Ok(ExprValue::Op(PendingOp::word(*value)));
        }
        self.eval_var_ref(&id.name, id.position, false)
    }

    fn eval_var_ref(&mut self, name: &str, position: CodeRange, force: bool) -> Result<ExprValue, GraftError> {
        let entry = self.func.symbols.resolve(name, position)?;
        if entry.kind.is_buffer_like() {
            return Ok(ExprValue::Op(PendingOp::expr(
                ExprKind::AddressOf,
                Operand::Value(entry.id.word()),
                Operand::Value(0),
            )));
        }
        if force {
            Ok(ExprValue::Op(PendingOp::expr(
                ExprKind::Var,
                Operand::Value(entry.id.word()),
                Operand::Value(0),
            )))
        } else {
            Ok(ExprValue::Var(entry.id.word()))
        }
    }

    /// `name[index]` reads the raw entry (no `UNDEF` promotion): any
    /// non-word kind lowers to `BUF_OFFSET`.
    fn eval_named_subscript(&mut self, name: &Identifier, index: &ExprLoc) -> Result<ExprValue, GraftError> {
        let Some(entry) = self.func.symbols.get(&name.name) else {
            return Err(CompileError::use_before_assignment(&name.name, name.position).into());
        };
        if entry.kind == VarKind::Word {
            return Err(CompileError::type_mismatch(
                format!("`{}` cannot be dereferenced", name.name),
                name.position,
            )
            .into());
        }
        let index = self.eval(index)?;
        Ok(ExprValue::Op(PendingOp::expr(
            ExprKind::BufOffset,
            Operand::Value(entry.id.word()),
            index.into_operand(),
        )))
    }

    fn eval_call(&mut self, func: &ExprLoc, args: &[ExprLoc], position: CodeRange) -> Result<ExprValue, GraftError> {
        let reverse;
        let head;
        if let Expr::Name(callee) = &func.expr
            && !self.func.symbols.contains(&callee.name)
        {
            let name = callee.name.as_str();
            if name == "ADDRESSOF" || name == "DEREF" {
                return self.eval_macro(name, args, position);
            }
            if name == "new" {
                return self.eval_new(args, position);
            }
            if name == "delete" {
                if args.len() != 1 {
                    return Err(CompileError::unsupported("delete takes exactly one argument", position).into());
                }
                let value = self.eval(&args[0])?;
                self.flow_push(PendingOp::flow(
                    FlowKind::DynFree,
                    value.into_operand(),
                    Operand::Value(0),
                    Operand::Value(0),
                ));
                return Ok(ExprValue::Op(PendingOp::word(0)));
            }
            if let Some(external) = name.strip_prefix(EXTERNAL_CALL_PREFIX) {
                // Kernel callable: strip the prefix, reverse the arguments.
                reverse = true;
                let mut flags = FuncFlags::EXTERNAL;
                if self.module.variable_argument_names.contains(name) {
                    flags |= FuncFlags::VARIABLE_ARGUMENT;
                }
                let id = self.func.strings.intern(external)?;
                head = PendingOp::expr(
                    ExprKind::CallString,
                    Operand::Value(id.word()),
                    Operand::Value(flags.bits()),
                );
            } else {
                // A function defined in this module, called by name.
                reverse = false;
                let id = self.func.strings.intern(name)?;
                head = PendingOp::expr(ExprKind::CallString, Operand::Value(id.word()), Operand::Value(0));
            }
        } else {
            // Indirect call through a declared variable or any expression.
            reverse = true;
            let callee = self.eval(func)?;
            head = PendingOp::expr(
                ExprKind::CallPtr,
                callee.into_operand(),
                Operand::Value(FuncFlags::EXTERNAL.bits()),
            );
        }

        let mut arg_ops = Vec::with_capacity(args.len());
        for arg in args {
            arg_ops.push(self.eval_call_arg(arg)?);
        }
        if reverse {
            arg_ops.reverse();
        }
        let mut ops = vec![head];
        ops.extend(arg_ops);
        ops.push(PendingOp::expr(ExprKind::CallEnd, Operand::Value(0), Operand::Value(0)));
        Ok(ExprValue::Call(ops))
    }

    /// Call arguments are always single quartets: constants become words,
    /// names become forced `EXP_VAR` quartets, nested calls are wrapped.
    fn eval_call_arg(&mut self, arg: &ExprLoc) -> Result<PendingOp, GraftError> {
        if let Expr::Name(id) = &arg.expr {
            if let Some(value) = self.module.consts.get(&id.name) {
                return Ok(PendingOp::word(*value));
            }
            return Ok(self.eval_var_ref(&id.name, id.position, true)?.into_quartet());
        }
        Ok(self.eval(arg)?.into_quartet())
    }

    fn eval_macro(&mut self, name: &str, args: &[ExprLoc], position: CodeRange) -> Result<ExprValue, GraftError> {
        if args.len() != 1 {
            return Err(CompileError::unsupported(format!("{name} takes exactly one argument"), position).into());
        }
        let arg = &args[0];
        let Expr::Name(id) = &arg.expr else {
            if name == "DEREF" {
                let value = self.eval(arg)?;
                return Ok(ExprValue::Op(PendingOp::expr(
                    ExprKind::Deref,
                    value.into_operand(),
                    Operand::Value(WORD_SIZE),
                )));
            }
            return Err(CompileError::unsupported("ADDRESSOF requires a variable name", position).into());
        };
        let entry = self.func.symbols.resolve(&id.name, id.position).map_err(|_| {
            CompileError::new(
                CompileErrorKind::UseBeforeAssignment,
                format!("cannot find the address of `{}`", id.name),
                id.position,
            )
        })?;
        if name == "DEREF" {
            if entry.kind != VarKind::Pointer {
                return Err(CompileError::type_mismatch("only pointers can be dereferenced", id.position).into());
            }
            Ok(ExprValue::Op(PendingOp::expr(
                ExprKind::Deref,
                Operand::Value(entry.id.word()),
                Operand::Value(WORD_SIZE),
            )))
        } else {
            Ok(ExprValue::Op(PendingOp::expr(
                ExprKind::AddressOf,
                Operand::Value(entry.id.word()),
                Operand::Value(0),
            )))
        }
    }

    /// `new(size)` / `new(size, 0|1)` dynamic allocation.
    fn eval_new(&mut self, args: &[ExprLoc], position: CodeRange) -> Result<ExprValue, GraftError> {
        let is_global = match args.len() {
            1 => 0,
            2 => match args[1].expr {
                Expr::Int(flag @ (0 | 1)) => flag,
                _ => {
                    return Err(CompileError::new(
                        CompileErrorKind::BadNew,
                        "the scope flag must be the literal 0 or 1",
                        args[1].position,
                    )
                    .into());
                }
            },
            _ => {
                return Err(CompileError::new(
                    CompileErrorKind::BadNew,
                    "new takes a size and an optional scope flag",
                    position,
                )
                .into());
            }
        };
        let size = self.eval(&args[0])?;
        Ok(ExprValue::Op(PendingOp::expr(
            ExprKind::DynAlloc,
            size.into_operand(),
            Operand::Value(is_global),
        )))
    }

    /// `"fmt" % args`: an indirect call to the per-arity format helper, the
    /// helper's kernel address embedded as an immediate.
    fn eval_format(&mut self, fmt: &ExprLoc, right: &ExprLoc) -> Result<ExprValue, GraftError> {
        let parts: Vec<&ExprLoc> = match &right.expr {
            Expr::Tuple(elements) => elements.iter().collect(),
            _ => vec![right],
        };
        let mut arg_ops = Vec::with_capacity(parts.len());
        for part in &parts {
            let op = if let Expr::Name(id) = &part.expr {
                self.eval_var_ref(&id.name, id.position, true)?.into_quartet()
            } else {
                self.eval(part)?.into_quartet()
            };
            arg_ops.push(op);
        }
        let arity = parts.len() + 1;
        let helper = match self.func.helpers.get(&arity) {
            Some(helper) => *helper,
            None => {
                let helper = self.module.host.synthesize_format_helper(arity)?;
                self.func.helpers.insert(arity, helper);
                helper
            }
        };
        let mut ops = vec![PendingOp::expr(
            ExprKind::CallPtr,
            Operand::Expr(Box::new(PendingOp::word(helper.address))),
            Operand::Value(0),
        )];
        ops.push(self.eval(fmt)?.into_quartet());
        ops.extend(arg_ops);
        ops.push(PendingOp::expr(ExprKind::CallEnd, Operand::Value(0), Operand::Value(0)));
        Ok(ExprValue::Call(ops))
    }

    fn lower_try(&mut self, body: &[Node], handler: &ExceptHandler) -> Result<(), GraftError> {
        self.frame_open();
        self.lower_block(body)?;
        let body_ops = self.frame_close();

        self.frame_open();
        if handler.exc_type.is_some() || handler.name.is_some() {
            let (variable, kind, kind_is_explicit) = match (&handler.exc_type, &handler.name) {
                (Some(exc_type), Some(name)) => {
                    let Some(kind @ (VarKind::Word | VarKind::Pointer)) = VarKind::from_keyword(&exc_type.name)
                    else {
                        return Err(CompileError::type_mismatch(
                            "exception variables are `word` or `pointer`",
                            exc_type.position,
                        )
                        .into());
                    };
                    (name, kind, true)
                }
                // `except e:` binds a word without naming a kind.
                (Some(exc_type), None) => (exc_type, VarKind::Word, false),
                (None, Some(name)) => {
                    return Err(CompileError::new(
                        CompileErrorKind::UnsupportedTry,
                        "an exception binding needs a filter",
                        name.position,
                    )
                    .into());
                }
                (None, None) => unreachable!("guarded by the caller"),
            };
            if kind_is_explicit
                && let Some(existing) = self.func.symbols.get(&variable.name)
                && existing.kind != kind
            {
                return Err(CompileError::type_mismatch(
                    format!("`{}` already has a different kind", variable.name),
                    variable.position,
                )
                .into());
            }
            self.func
                .symbols
                .declare(&variable.name, kind, WORD_SIZE, 0, 0, variable.position)?;
            let exception = ExprValue::Op(PendingOp::expr(
                ExprKind::ExceptionVar,
                Operand::Value(0),
                Operand::Value(0),
            ));
            self.assign_value(&Target::Name(variable.clone()), exception)?;
        }
        self.lower_block(&handler.body)?;
        let handler_ops = self.frame_close();

        self.flow_push(PendingOp::flow(
            FlowKind::Try,
            Operand::Block(body_ops),
            Operand::Block(handler_ops),
            Operand::Value(0),
        ));
        Ok(())
    }

    /// Print: one formatted-print call per value (`%d` for words, `%s` for
    /// strings and formatted strings), space-separated, newline-terminated.
    fn lower_print(&mut self, values: &[ExprLoc]) -> Result<(), GraftError> {
        for (n, value) in values.iter().enumerate() {
            if n > 0 {
                self.emit_printk(" ", None, value.position)?;
            }
            let formats_string = matches!(
                &value.expr,
                Expr::Binary { op: Operator::Mod, left, .. } if matches!(left.expr, Expr::Str(_))
            );
            if matches!(value.expr, Expr::Str(_)) || formats_string {
                if formats_string {
                    // The formatted string is heap-allocated by the helper;
                    // stage it in a temporary and free it after the print.
                    let temp = self.next_temp();
                    let formatted = self.eval(value)?;
                    self.assign_temp(&temp, formatted, value.position)?;
                    let staged = self.eval_var_ref(&temp, value.position, true)?;
                    self.emit_printk("%s", Some(staged), value.position)?;
                    let entry = self.func.symbols.resolve(&temp, value.position)?;
                    self.flow_push(PendingOp::flow(
                        FlowKind::DynFree,
                        Operand::Value(entry.id.word()),
                        Operand::Value(0),
                        Operand::Value(0),
                    ));
                } else {
                    let string = self.eval(value)?;
                    self.emit_printk("%s", Some(string), value.position)?;
                }
            } else {
                let extra = if let Expr::Name(id) = &value.expr {
                    self.eval_var_ref(&id.name, id.position, true)?
                } else {
                    self.eval(value)?
                };
                self.emit_printk("%d", Some(extra), value.position)?;
            }
        }
        let position = values.last().map_or_else(CodeRange::default, |v| v.position);
        self.emit_printk("\n", None, position)?;
        Ok(())
    }

    /// One call to the kernel's formatted-print callable, its result
    /// discarded into the sink. The extra operand precedes the format string
    /// because external calls take their arguments reversed.
    fn emit_printk(&mut self, format: &str, extra: Option<ExprValue>, position: CodeRange) -> Result<(), GraftError> {
        let callee = self.func.strings.intern(PRINTK)?;
        let flags = FuncFlags::EXTERNAL | FuncFlags::VARIABLE_ARGUMENT;
        let mut ops = vec![PendingOp::expr(
            ExprKind::CallString,
            Operand::Value(callee.word()),
            Operand::Value(flags.bits()),
        )];
        if let Some(extra) = extra {
            ops.push(extra.into_quartet());
        }
        let format_id = self.func.strings.intern(format)?;
        ops.push(PendingOp::expr(
            ExprKind::String,
            Operand::Value(format_id.word()),
            Operand::Value(0),
        ));
        ops.push(PendingOp::expr(ExprKind::CallEnd, Operand::Value(0), Operand::Value(0)));
        let sink = self.func.symbols.touch(SINK_NAME, position)?;
        self.flow_push(PendingOp::flow(
            FlowKind::Assign,
            Operand::Value(sink.id.word()),
            Operand::Block(ops),
            Operand::Value(0),
        ));
        Ok(())
    }

    /// A fresh temporary name; the dotted prefix cannot appear in a source
    /// identifier, so temporaries never collide.
    fn next_temp(&mut self) -> String {
        let name = format!(".tmp{}", self.temp_counter);
        self.temp_counter += 1;
        name
    }
}

fn kind_noun(kind: VarKind) -> &'static str {
    match kind {
        VarKind::Buffer => "buffer",
        VarKind::Array => "array",
        VarKind::Undef | VarKind::Word => "word",
        VarKind::Pointer => "pointer",
    }
}
