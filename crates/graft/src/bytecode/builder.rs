//! Pending opcode tree and the block-offset resolver.
//!
//! The lowerer emits a tree: flow frames are vectors of pending opcodes, and
//! any operand slot may hold a nested expression or a nested block instead
//! of a scalar. The resolver linearizes that tree into the final quartet
//! stream, rewriting every nested reference into the absolute quartet offset
//! the kernel verifier expects.

use super::op::{ExprKind, FlowKind, OpFamily, Quartet};
use crate::Word;

/// One operand slot of a pending opcode.
#[derive(Debug, Clone)]
pub(crate) enum Operand {
    /// A scalar word: an immediate, a variable id, a string id, or a flag
    /// word.
    Value(Word),
    /// A nested single-quartet expression; resolves to its offset.
    Expr(Box<PendingOp>),
    /// A nested quartet sequence (flow frame or call chain); resolves to the
    /// offset of its first quartet.
    Block(Vec<PendingOp>),
}

/// A quartet whose operand slots may still reference nested sub-trees.
#[derive(Debug, Clone)]
pub(crate) struct PendingOp {
    w0: Word,
    operands: [Operand; 3],
}

impl PendingOp {
    pub fn flow(kind: FlowKind, val1: Operand, val2: Operand, val3: Operand) -> Self {
        Self {
            w0: OpFamily::Flow as Word | ((kind as Word) << 2),
            operands: [val1, val2, val3],
        }
    }

    /// An expression quartet; the fourth word of an expression is always 0.
    pub fn expr(kind: ExprKind, val1: Operand, val2: Operand) -> Self {
        Self {
            w0: OpFamily::Expression as Word | ((kind as Word) << 2),
            operands: [val1, val2, Operand::Value(0)],
        }
    }

    /// An immediate-word expression.
    pub fn word(value: Word) -> Self {
        Self::expr(ExprKind::Word, Operand::Value(value), Operand::Value(0))
    }

    /// True when this is an expression quartet of the given kind.
    pub fn is_expr_kind(&self, kind: ExprKind) -> bool {
        self.w0 & 0b11 == OpFamily::Expression as Word && (self.w0 >> 2) & 0x1f == kind as Word
    }
}

/// Linearizes the body tree behind a preamble of already-placed quartets.
///
/// Offsets are assigned the way the kernel verifier expects: entering a
/// block reserves its full quartet range at the running end of the stream,
/// then its quartets are scanned in order; each nested operand takes the
/// current end as its offset and is descended into immediately, before the
/// quartet's remaining operand slots are scanned. Blocks therefore land in
/// the output in the same order their offsets were assigned, and the result
/// is independent of anything but the tree shape.
pub(crate) fn resolve_blocks(preamble: Vec<Quartet>, body: Vec<PendingOp>) -> Vec<Quartet> {
    let mut resolver = Resolver {
        end: preamble.len(),
        blocks: vec![preamble],
    };
    resolver.visit_block(body);
    resolver.blocks.concat()
}

struct Resolver {
    /// The running end of the stream, in quartets.
    end: usize,
    /// Resolved blocks in offset order.
    blocks: Vec<Vec<Quartet>>,
}

impl Resolver {
    fn visit_block(&mut self, ops: Vec<PendingOp>) {
        let slot = self.blocks.len();
        self.blocks.push(Vec::new());
        self.end += ops.len();
        let resolved = ops.into_iter().map(|op| self.resolve_op(op)).collect();
        self.blocks[slot] = resolved;
    }

    fn visit_single(&mut self, op: PendingOp) {
        let slot = self.blocks.len();
        self.blocks.push(Vec::new());
        self.end += 1;
        let resolved = self.resolve_op(op);
        self.blocks[slot] = vec![resolved];
    }

    fn resolve_op(&mut self, op: PendingOp) -> Quartet {
        let PendingOp { w0, operands } = op;
        let mut words = [w0, 0, 0, 0];
        for (slot, operand) in operands.into_iter().enumerate() {
            words[slot + 1] = match operand {
                Operand::Value(value) => value,
                Operand::Expr(inner) => {
                    let offset = self.end;
                    self.visit_single(*inner);
                    offset as Word
                }
                Operand::Block(ops) => {
                    let offset = self.end;
                    self.visit_block(ops);
                    offset as Word
                }
            };
        }
        Quartet(words)
    }
}
