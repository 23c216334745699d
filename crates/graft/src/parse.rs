use std::fmt;

use ruff_python_ast::{
    self as ast, BoolOp, CmpOp, Expr as AstExpr, Number, Operator as AstOperator, Stmt, UnaryOp, name::Name,
};
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange};

use crate::{
    Word,
    errors::{CompileError, CompileErrorKind},
    expressions::{
        BoolOperator, CmpOperator, ExceptHandler, Expr, ExprLoc, Identifier, Node, Operator, Param, RawFunctionDef,
        Target, UnaryOperator,
    },
};

/// Maximum nesting depth for AST structures during conversion.
///
/// The kernel verifier bounds block nesting far below this; the limit here
/// only protects the host stack from pathological inputs like `((((x))))`.
pub(crate) const MAX_NESTING_DEPTH: u16 = 100;

/// A position in the source, 0-indexed line and column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CodeLoc {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line + 1, self.column + 1)
    }
}

/// Source range of a statement or expression, for error reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CodeRange {
    pub start: CodeLoc,
    pub end: CodeLoc,
}

impl fmt::Display for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start)
    }
}

/// Parses a module into the statement subset the lowerer consumes.
pub(crate) fn parse(code: &str) -> Result<Vec<Node>, CompileError> {
    let mut parser = Parser::new(code);
    let parsed = parse_module(code)
        .map_err(|e| CompileError::unsupported(e.to_string(), parser.convert_range(e.range())))?;
    let module = parsed.into_syntax();
    parser.parse_statements(module.body)
}

/// Converts the ruff AST into the sealed subset, rejecting everything the
/// kernel VM cannot express with `UnsupportedSyntax` (or the more specific
/// compare/try kinds) before lowering sees it.
struct Parser {
    /// Position of each newline, to convert byte offsets to line/column.
    line_ends: Vec<usize>,
    /// Remaining nesting depth budget for recursive structures.
    depth_remaining: u16,
}

impl Parser {
    fn new(code: &str) -> Self {
        let mut line_ends = vec![];
        for (i, c) in code.chars().enumerate() {
            if c == '\n' {
                line_ends.push(i);
            }
        }
        Self {
            line_ends,
            depth_remaining: MAX_NESTING_DEPTH,
        }
    }

    fn parse_statements(&mut self, statements: Vec<Stmt>) -> Result<Vec<Node>, CompileError> {
        statements.into_iter().map(|s| self.parse_statement(s)).collect()
    }

    fn parse_statement(&mut self, statement: Stmt) -> Result<Node, CompileError> {
        self.decr_depth_remaining(|| statement.range())?;
        let result = self.parse_statement_impl(statement);
        self.depth_remaining += 1;
        result
    }

    fn parse_statement_impl(&mut self, statement: Stmt) -> Result<Node, CompileError> {
        match statement {
            Stmt::FunctionDef(function) => {
                let position = self.convert_range(function.name.range);
                if function.is_async {
                    return Err(CompileError::unsupported("async functions", position));
                }
                if !function.decorator_list.is_empty() {
                    return Err(CompileError::unsupported("decorators", position));
                }
                if function.type_params.is_some() {
                    return Err(CompileError::unsupported("type parameters", position));
                }
                if function.returns.is_some() {
                    return Err(CompileError::unsupported("return annotations", position));
                }
                let params = &function.parameters;
                if !params.posonlyargs.is_empty()
                    || !params.kwonlyargs.is_empty()
                    || params.vararg.is_some()
                    || params.kwarg.is_some()
                {
                    return Err(CompileError::unsupported(
                        "only plain positional parameters are supported",
                        position,
                    ));
                }
                let mut parsed_params = Vec::with_capacity(params.args.len());
                for param in &params.args {
                    if param.parameter.annotation.is_some() {
                        return Err(CompileError::unsupported(
                            "parameter annotations",
                            self.convert_range(param.parameter.name.range),
                        ));
                    }
                    let name = self.identifier(&param.parameter.name.id, param.parameter.name.range);
                    let default = match &param.default {
                        Some(expr) => Some(self.parse_expression((**expr).clone())?),
                        None => None,
                    };
                    parsed_params.push(Param { name, default });
                }
                let name = self.identifier(&function.name.id, function.name.range);
                let body = self.parse_statements(function.body)?;
                Ok(Node::FunctionDef(RawFunctionDef {
                    name,
                    params: parsed_params,
                    body,
                }))
            }
            Stmt::Assign(ast::StmtAssign { targets, value, range, .. }) => {
                if targets.len() != 1 {
                    return Err(CompileError::unsupported(
                        "chained assignment targets",
                        self.convert_range(range),
                    ));
                }
                let target = self.parse_target(targets.into_iter().next().expect("one target"), true)?;
                let value = self.parse_expression(*value)?;
                Ok(Node::Assign { target, value })
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, op, value, range, .. }) => {
                let position = self.convert_range(range);
                let target = self.parse_target(*target, false)?;
                let op = convert_op(op, position)?;
                let value = self.parse_expression(*value)?;
                Ok(Node::AugAssign { target, op, value })
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => {
                // A statement-position call to the bare name `print` is the
                // print statement; the VM has no print of its own.
                if let AstExpr::Call(call) = *value {
                    let callee_is_print =
                        matches!(call.func.as_ref(), AstExpr::Name(n) if n.id.to_string() == "print");
                    if callee_is_print {
                        let position = self.convert_range(call.range);
                        if !call.arguments.keywords.is_empty() {
                            return Err(CompileError::unsupported("keyword arguments to print", position));
                        }
                        let values = call
                            .arguments
                            .args
                            .into_vec()
                            .into_iter()
                            .map(|a| self.parse_expression(a))
                            .collect::<Result<Vec<_>, _>>()?;
                        return Ok(Node::Print(values));
                    }
                    return Ok(Node::Expr(self.parse_expression(AstExpr::Call(call))?));
                }
                Ok(Node::Expr(self.parse_expression(*value)?))
            }
            Stmt::If(ast::StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => {
                let test = self.parse_expression(*test)?;
                let body = self.parse_statements(body)?;
                let or_else = self.parse_elif_else_clauses(elif_else_clauses)?;
                Ok(Node::If { test, body, or_else })
            }
            Stmt::While(ast::StmtWhile { test, body, orelse, range, .. }) => {
                if !orelse.is_empty() {
                    return Err(CompileError::unsupported(
                        "while-else clauses",
                        self.convert_range(range),
                    ));
                }
                let test = self.parse_expression(*test)?;
                let body = self.parse_statements(body)?;
                Ok(Node::While { test, body })
            }
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
                range,
                ..
            }) => {
                let position = self.convert_range(range);
                if is_star {
                    return Err(CompileError::new(
                        CompileErrorKind::UnsupportedTry,
                        "except* groups are not supported",
                        position,
                    ));
                }
                if !orelse.is_empty() || !finalbody.is_empty() {
                    return Err(CompileError::new(
                        CompileErrorKind::UnsupportedTry,
                        "try-else and try-finally are not supported",
                        position,
                    ));
                }
                if handlers.len() != 1 {
                    return Err(CompileError::new(
                        CompileErrorKind::UnsupportedTry,
                        "exactly one except clause is supported",
                        position,
                    ));
                }
                let body = self.parse_statements(body)?;
                let handler = self.parse_except_handler(handlers.into_iter().next().expect("one handler"))?;
                Ok(Node::Try { body, handler })
            }
            Stmt::Pass(_) => Ok(Node::Pass),
            Stmt::Return(ast::StmtReturn { value, .. }) => match value {
                Some(value) => Ok(Node::Return(Some(self.parse_expression(*value)?))),
                None => Ok(Node::Return(None)),
            },
            Stmt::Raise(ast::StmtRaise { exc, cause, range, .. }) => {
                if cause.is_some() {
                    return Err(CompileError::unsupported(
                        "raise-from clauses",
                        self.convert_range(range),
                    ));
                }
                let exc = match exc {
                    Some(expr) => Some(self.parse_expression(*expr)?),
                    None => None,
                };
                Ok(Node::Raise(exc))
            }
            Stmt::Delete(ast::StmtDelete { targets, .. }) => {
                let targets = targets
                    .into_iter()
                    .map(|t| self.parse_expression(t))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::Delete(targets))
            }
            other => Err(CompileError::unsupported(
                "statement kind outside the supported subset",
                self.convert_range(other.range()),
            )),
        }
    }

    fn parse_elif_else_clauses(&mut self, clauses: Vec<ast::ElifElseClause>) -> Result<Vec<Node>, CompileError> {
        let mut tail: Vec<Node> = Vec::new();
        for clause in clauses.into_iter().rev() {
            match clause.test {
                Some(test) => {
                    let test = self.parse_expression(test)?;
                    let body = self.parse_statements(clause.body)?;
                    tail = vec![Node::If {
                        test,
                        body,
                        or_else: tail,
                    }];
                }
                None => {
                    tail = self.parse_statements(clause.body)?;
                }
            }
        }
        Ok(tail)
    }

    fn parse_except_handler(&mut self, handler: ast::ExceptHandler) -> Result<ExceptHandler, CompileError> {
        let ast::ExceptHandler::ExceptHandler(h) = handler;
        let exc_type = match h.type_ {
            Some(expr) => match *expr {
                AstExpr::Name(ast::ExprName { id, range, .. }) => Some(self.identifier(&id, range)),
                other => {
                    return Err(CompileError::new(
                        CompileErrorKind::UnsupportedTry,
                        "the exception filter must be a plain name",
                        self.convert_range(other.range()),
                    ));
                }
            },
            None => None,
        };
        let name = h.name.map(|n| self.identifier(&n.id, n.range));
        let body = self.parse_statements(h.body)?;
        Ok(ExceptHandler { exc_type, name, body })
    }

    /// Converts an assignment target. Tuple and list targets are accepted
    /// only at the top level of a plain assignment.
    fn parse_target(&mut self, target: AstExpr, allow_tuple: bool) -> Result<Target, CompileError> {
        match target {
            AstExpr::Name(ast::ExprName { id, range, .. }) => Ok(Target::Name(self.identifier(&id, range))),
            AstExpr::Subscript(ast::ExprSubscript { value, slice, range, .. }) => {
                let AstExpr::Name(ast::ExprName { id, range: name_range, .. }) = *value else {
                    return Err(CompileError::unsupported(
                        "subscript assignment base must be a plain name",
                        self.convert_range(range),
                    ));
                };
                let index = self.parse_index(*slice)?;
                Ok(Target::Subscript {
                    name: self.identifier(&id, name_range),
                    index: Box::new(index),
                })
            }
            AstExpr::Tuple(ast::ExprTuple { elts, range, .. }) | AstExpr::List(ast::ExprList { elts, range, .. }) => {
                if !allow_tuple {
                    return Err(CompileError::unsupported(
                        "nested parallel assignment targets",
                        self.convert_range(range),
                    ));
                }
                let elements = elts
                    .into_iter()
                    .map(|e| self.parse_target(e, false))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Target::Tuple(elements))
            }
            other => Err(CompileError::unsupported(
                "assignment target outside the supported subset",
                self.convert_range(other.range()),
            )),
        }
    }

    fn parse_expression(&mut self, expression: AstExpr) -> Result<ExprLoc, CompileError> {
        self.decr_depth_remaining(|| expression.range())?;
        let result = self.parse_expression_impl(expression);
        self.depth_remaining += 1;
        result
    }

    fn parse_expression_impl(&mut self, expression: AstExpr) -> Result<ExprLoc, CompileError> {
        match expression {
            AstExpr::BoolOp(ast::ExprBoolOp { op, values, range, .. }) => {
                let position = self.convert_range(range);
                let op = match op {
                    BoolOp::And => BoolOperator::And,
                    BoolOp::Or => BoolOperator::Or,
                };
                let values = values
                    .into_iter()
                    .map(|v| self.parse_expression(v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ExprLoc::new(position, Expr::Bool { op, values }))
            }
            AstExpr::BinOp(ast::ExprBinOp { left, op, right, range, .. }) => {
                let position = self.convert_range(range);
                let left = self.parse_expression(*left)?;
                let right = self.parse_expression(*right)?;
                let op = convert_op(op, position)?;
                Ok(ExprLoc::new(
                    position,
                    Expr::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                ))
            }
            AstExpr::UnaryOp(ast::ExprUnaryOp { op, operand, range, .. }) => {
                let position = self.convert_range(range);
                let op = match op {
                    UnaryOp::Not => UnaryOperator::Not,
                    UnaryOp::USub => UnaryOperator::Neg,
                    UnaryOp::Invert => UnaryOperator::Invert,
                    UnaryOp::UAdd => {
                        return Err(CompileError::unsupported("unary plus", position));
                    }
                };
                let operand = Box::new(self.parse_expression(*operand)?);
                Ok(ExprLoc::new(position, Expr::Unary { op, operand }))
            }
            AstExpr::Compare(ast::ExprCompare {
                left,
                ops,
                comparators,
                range,
                ..
            }) => {
                let position = self.convert_range(range);
                let ops_vec = ops.into_vec();
                let comparators_vec = comparators.into_vec();
                if ops_vec.len() != 1 {
                    return Err(CompileError::new(
                        CompileErrorKind::UnsupportedCompare,
                        "chained comparisons are not supported",
                        position,
                    ));
                }
                let op = convert_compare_op(ops_vec.into_iter().next().expect("one op"), position)?;
                let left = Box::new(self.parse_expression(*left)?);
                let right = Box::new(self.parse_expression(
                    comparators_vec.into_iter().next().expect("one comparator"),
                )?);
                Ok(ExprLoc::new(position, Expr::Compare { op, left, right }))
            }
            AstExpr::Call(ast::ExprCall { func, arguments, range, .. }) => {
                let position = self.convert_range(range);
                if !arguments.keywords.is_empty() {
                    return Err(CompileError::unsupported("keyword arguments", position));
                }
                let mut args = Vec::with_capacity(arguments.args.len());
                for arg in arguments.args.into_vec() {
                    if matches!(arg, AstExpr::Starred(_)) {
                        return Err(CompileError::unsupported("argument unpacking", position));
                    }
                    args.push(self.parse_expression(arg)?);
                }
                let func = Box::new(self.parse_expression(*func)?);
                Ok(ExprLoc::new(position, Expr::Call { func, args }))
            }
            AstExpr::StringLiteral(ast::ExprStringLiteral { value, range, .. }) => {
                Ok(ExprLoc::new(self.convert_range(range), Expr::Str(value.to_string())))
            }
            AstExpr::NumberLiteral(ast::ExprNumberLiteral { value, range, .. }) => {
                let position = self.convert_range(range);
                match value {
                    Number::Int(i) => {
                        let value = i
                            .as_i64()
                            .and_then(|v| Word::try_from(v).ok())
                            .ok_or_else(|| {
                                CompileError::unsupported("integer literal exceeds the word range", position)
                            })?;
                        Ok(ExprLoc::new(position, Expr::Int(value)))
                    }
                    _ => Err(CompileError::unsupported("non-integer number literals", position)),
                }
            }
            AstExpr::NoneLiteral(ast::ExprNoneLiteral { range, .. }) => {
                Ok(ExprLoc::new(self.convert_range(range), Expr::None))
            }
            AstExpr::Name(ast::ExprName { id, range, .. }) => {
                let position = self.convert_range(range);
                Ok(ExprLoc::new(position, Expr::Name(self.identifier(&id, range))))
            }
            AstExpr::Subscript(ast::ExprSubscript { value, slice, range, .. }) => {
                let position = self.convert_range(range);
                let value = Box::new(self.parse_expression(*value)?);
                let index = Box::new(self.parse_index(*slice)?);
                Ok(ExprLoc::new(position, Expr::Subscript { value, index }))
            }
            AstExpr::Tuple(ast::ExprTuple { elts, range, .. }) | AstExpr::List(ast::ExprList { elts, range, .. }) => {
                let position = self.convert_range(range);
                let items = elts
                    .into_iter()
                    .map(|e| self.parse_expression(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ExprLoc::new(position, Expr::Tuple(items)))
            }
            other => Err(CompileError::unsupported(
                "expression kind outside the supported subset",
                self.convert_range(other.range()),
            )),
        }
    }

    /// Converts a subscript index, rejecting slice forms (`a[1:2]`).
    fn parse_index(&mut self, slice: AstExpr) -> Result<ExprLoc, CompileError> {
        if matches!(slice, AstExpr::Slice(_)) {
            return Err(CompileError::unsupported(
                "slice subscripts",
                self.convert_range(slice.range()),
            ));
        }
        self.parse_expression(slice)
    }

    fn identifier(&self, id: &Name, range: TextRange) -> Identifier {
        Identifier {
            name: id.to_string(),
            position: self.convert_range(range),
        }
    }

    fn decr_depth_remaining<R: FnOnce() -> TextRange>(&mut self, range: R) -> Result<(), CompileError> {
        match self.depth_remaining.checked_sub(1) {
            Some(depth) => {
                self.depth_remaining = depth;
                Ok(())
            }
            None => Err(CompileError::unsupported(
                "nesting is too deep",
                self.convert_range(range()),
            )),
        }
    }

    fn convert_range(&self, range: TextRange) -> CodeRange {
        CodeRange {
            start: self.index_to_loc(range.start().into()),
            end: self.index_to_loc(range.end().into()),
        }
    }

    fn index_to_loc(&self, index: usize) -> CodeLoc {
        let mut line_start = 0;
        for (line, line_end) in self.line_ends.iter().enumerate() {
            if index <= *line_end {
                return CodeLoc {
                    line,
                    column: index - line_start,
                };
            }
            line_start = *line_end + 1;
        }
        CodeLoc {
            line: self.line_ends.len(),
            column: index - line_start,
        }
    }
}

fn convert_op(op: AstOperator, position: CodeRange) -> Result<Operator, CompileError> {
    match op {
        AstOperator::Add => Ok(Operator::Add),
        AstOperator::Sub => Ok(Operator::Sub),
        AstOperator::Mult => Ok(Operator::Mult),
        AstOperator::Div => Ok(Operator::Div),
        AstOperator::Mod => Ok(Operator::Mod),
        AstOperator::BitAnd => Ok(Operator::BitAnd),
        AstOperator::BitOr => Ok(Operator::BitOr),
        _ => Err(CompileError::unsupported(
            "binary operator outside the supported subset",
            position,
        )),
    }
}

fn convert_compare_op(op: CmpOp, position: CodeRange) -> Result<CmpOperator, CompileError> {
    match op {
        CmpOp::Eq => Ok(CmpOperator::Eq),
        CmpOp::NotEq => Ok(CmpOperator::NotEq),
        CmpOp::Lt => Ok(CmpOperator::Lt),
        CmpOp::LtE => Ok(CmpOperator::LtE),
        CmpOp::Gt => Ok(CmpOperator::Gt),
        CmpOp::GtE => Err(CompileError::new(
            CompileErrorKind::UnsupportedCompare,
            ">= has no lowering; rewrite with <=",
            position,
        )),
        _ => Err(CompileError::new(
            CompileErrorKind::UnsupportedCompare,
            "comparison operator outside the supported subset",
            position,
        )),
    }
}
