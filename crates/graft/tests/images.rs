//! Compiled-image checks: quartet streams, offsets, string tables.
//!
//! Each test compiles a small module through a session backed by the mock
//! channel and asserts on the exact image bytes the device saw.

mod common;

use common::{MockChannel, expr_w0, flow_w0, quartet, string_table};
use graft::{ExprKind, FlowKind, Session, WORD_SIZE, Word};
use pretty_assertions::assert_eq;

fn compile_images(source: &str) -> Vec<Vec<u8>> {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    session.compile(source).expect("compile failed");
    let images = state.borrow().images.clone();
    images
}

/// Function header word: family 0, min_args in the subop field, the
/// return-exception flag in bit 7.
fn function_w0(min_args: Word) -> Word {
    (min_args << 2) | (1 << 7)
}

/// Variable word: family 1, kind code, is_arg bit.
fn variable_w0(kind_code: Word, is_arg: bool) -> Word {
    1 | (kind_code << 2) | (Word::from(is_arg) << 7)
}

#[test]
fn constant_fold_and_argument_numbering() {
    let images = compile_images(
        "
X = 5

def f(a):
    return a + X
",
    );
    assert_eq!(images.len(), 1);
    let image = &images[0];

    // header: min_args=1, unhandled exceptions returned, name id 1
    assert_eq!(quartet(image, 0), [function_w0(1), 1, 0, 0]);
    // argument a: id 1, emitted as a word
    assert_eq!(quartet(image, 1), [variable_w0(0, true), WORD_SIZE, 0, 0]);
    // body: ret -> add(var 1, word 5)
    assert_eq!(quartet(image, 2), [flow_w0(FlowKind::Ret), 3, 0, 0]);
    assert_eq!(quartet(image, 3), [expr_w0(ExprKind::Add), 1, 4, 0]);
    assert_eq!(quartet(image, 4), [expr_w0(ExprKind::Word), 5, 0, 0]);
    assert_eq!(string_table(image, 5), b"f\0");
}

#[test]
fn named_pointer_subscript_uses_buf_offset() {
    let images = compile_images(
        "
def g(p):
    pointer(p)
    return p[3]
",
    );
    let image = &images[0];
    assert_eq!(quartet(image, 0), [function_w0(1), 1, 0, 0]);
    // p promoted to pointer by the declaration statement
    assert_eq!(quartet(image, 1), [variable_w0(3, true), WORD_SIZE, 0, 0]);
    assert_eq!(quartet(image, 2), [flow_w0(FlowKind::Ret), 3, 0, 0]);
    assert_eq!(quartet(image, 3), [expr_w0(ExprKind::BufOffset), 1, 4, 0]);
    assert_eq!(quartet(image, 4), [expr_w0(ExprKind::Word), 3, 0, 0]);
    assert_eq!(string_table(image, 5), b"g\0");
}

#[test]
fn expression_subscript_uses_deref_of_add() {
    let images = compile_images(
        "
def g(p):
    return (p + 0)[3]
",
    );
    let image = &images[0];
    // ret -> deref(add(add(p, 0), 3), size 1)
    assert_eq!(quartet(image, 2), [flow_w0(FlowKind::Ret), 3, 0, 0]);
    assert_eq!(quartet(image, 3), [expr_w0(ExprKind::Deref), 4, 1, 0]);
    assert_eq!(quartet(image, 4), [expr_w0(ExprKind::Add), 5, 7, 0]);
    assert_eq!(quartet(image, 5), [expr_w0(ExprKind::Add), 1, 6, 0]);
    assert_eq!(quartet(image, 6), [expr_w0(ExprKind::Word), 0, 0, 0]);
    assert_eq!(quartet(image, 7), [expr_w0(ExprKind::Word), 3, 0, 0]);
}

#[test]
fn buffer_declaration_and_byte_store() {
    let images = compile_images(
        r#"
def h():
    b = buffer(16)
    b[0] = "Z"
    return b[0]
"#,
    );
    let image = &images[0];
    // name interned after the body string: "Z" is 1, "h" is 2
    assert_eq!(quartet(image, 0), [function_w0(0), 2, 0, 0]);
    assert_eq!(quartet(image, 1), [variable_w0(1, false), 16, 0, 0]);
    // b[0] = "Z": assign_offset(b, index, deref(string, 1))
    assert_eq!(quartet(image, 2), [flow_w0(FlowKind::AssignOffset), 1, 4, 5]);
    assert_eq!(quartet(image, 3), [flow_w0(FlowKind::Ret), 7, 0, 0]);
    assert_eq!(quartet(image, 4), [expr_w0(ExprKind::Word), 0, 0, 0]);
    assert_eq!(quartet(image, 5), [expr_w0(ExprKind::Deref), 6, 1, 0]);
    assert_eq!(quartet(image, 6), [expr_w0(ExprKind::String), 1, 0, 0]);
    // return b[0]
    assert_eq!(quartet(image, 7), [expr_w0(ExprKind::BufOffset), 1, 8, 0]);
    assert_eq!(quartet(image, 8), [expr_w0(ExprKind::Word), 0, 0, 0]);
    assert_eq!(string_table(image, 9), b"Z\0h\0");
}

#[test]
fn try_handler_starts_with_exception_var_assignment() {
    let images = compile_images(
        "
def k(n):
    try:
        return 1 / n
    except word as e:
        return e
",
    );
    let image = &images[0];
    assert_eq!(quartet(image, 0), [function_w0(1), 1, 0, 0]);
    // n (argument, promoted word), e (word)
    assert_eq!(quartet(image, 1), [variable_w0(0, true), WORD_SIZE, 0, 0]);
    assert_eq!(quartet(image, 2), [variable_w0(0, false), WORD_SIZE, 0, 0]);
    // try(body at 5, handler at 8), then the synthetic return
    assert_eq!(quartet(image, 3), [flow_w0(FlowKind::Try), 5, 8, 0]);
    assert_eq!(quartet(image, 4), [flow_w0(FlowKind::Ret), 11, 0, 0]);
    // body: return div(word 1, n)
    assert_eq!(quartet(image, 5), [flow_w0(FlowKind::Ret), 6, 0, 0]);
    assert_eq!(quartet(image, 6), [expr_w0(ExprKind::Div), 7, 1, 0]);
    assert_eq!(quartet(image, 7), [expr_w0(ExprKind::Word), 1, 0, 0]);
    // handler: e = exception_var, then return e
    assert_eq!(quartet(image, 8), [flow_w0(FlowKind::Assign), 2, 10, 0]);
    assert_eq!(quartet(image, 9), [flow_w0(FlowKind::Ret), 2, 0, 0]);
    assert_eq!(quartet(image, 10), [expr_w0(ExprKind::ExceptionVar), 0, 0, 0]);
    assert_eq!(quartet(image, 11), [expr_w0(ExprKind::Word), 0, 0, 0]);
}

#[test]
fn parallel_assignment_swaps_through_temporaries() {
    let images = compile_images(
        "
def s(a, b):
    a, b = b, a
    return a
",
    );
    let image = &images[0];
    assert_eq!(quartet(image, 0), [function_w0(2), 1, 0, 0]);
    // a, b, and two temporaries
    for slot in 1..=4 {
        assert_eq!(quartet(image, slot), [variable_w0(0, slot <= 2), WORD_SIZE, 0, 0]);
    }
    // temps filled from the sources first, then targets from the temps
    assert_eq!(quartet(image, 5), [flow_w0(FlowKind::Assign), 3, 2, 0]);
    assert_eq!(quartet(image, 6), [flow_w0(FlowKind::Assign), 4, 1, 0]);
    assert_eq!(quartet(image, 7), [flow_w0(FlowKind::Assign), 1, 3, 0]);
    assert_eq!(quartet(image, 8), [flow_w0(FlowKind::Assign), 2, 4, 0]);
    assert_eq!(quartet(image, 9), [flow_w0(FlowKind::Ret), 1, 0, 0]);
}

#[test]
fn internal_calls_keep_source_order_external_calls_reverse() {
    let images = compile_images(
        "
def callee(a, b):
    return a

def caller(x, y):
    u = callee(x, y)
    v = KERNEL_copy(x, y)
    return u + v
",
    );
    assert_eq!(images.len(), 2);
    let image = &images[1];
    // strings: callee=1, copy (prefix stripped)=2, caller=3
    assert_eq!(quartet(image, 0), [function_w0(2), 3, 0, 0]);
    // u = callee(x, y): source order, no flags
    assert_eq!(quartet(image, 5), [flow_w0(FlowKind::Assign), 3, 8, 0]);
    assert_eq!(quartet(image, 8), [expr_w0(ExprKind::CallString), 1, 0, 0]);
    assert_eq!(quartet(image, 9), [expr_w0(ExprKind::Var), 1, 0, 0]);
    assert_eq!(quartet(image, 10), [expr_w0(ExprKind::Var), 2, 0, 0]);
    assert_eq!(quartet(image, 11), [expr_w0(ExprKind::CallEnd), 0, 0, 0]);
    // v = KERNEL_copy(x, y): external flag, reversed arguments
    assert_eq!(quartet(image, 6), [flow_w0(FlowKind::Assign), 4, 12, 0]);
    assert_eq!(quartet(image, 12), [expr_w0(ExprKind::CallString), 2, 2, 0]);
    assert_eq!(quartet(image, 13), [expr_w0(ExprKind::Var), 2, 0, 0]);
    assert_eq!(quartet(image, 14), [expr_w0(ExprKind::Var), 1, 0, 0]);
    assert_eq!(quartet(image, 15), [expr_w0(ExprKind::CallEnd), 0, 0, 0]);
    assert_eq!(string_table(image, 17), b"callee\0copy\0caller\0");
}

#[test]
fn boolean_chains_emit_right_associatively() {
    let images = compile_images(
        "
def all3(x, y, z):
    return x and y and z
",
    );
    let image = &images[0];
    // ret -> and(z, and(y, x))
    assert_eq!(quartet(image, 4), [flow_w0(FlowKind::Ret), 5, 0, 0]);
    assert_eq!(quartet(image, 5), [expr_w0(ExprKind::BoolAnd), 3, 6, 0]);
    assert_eq!(quartet(image, 6), [expr_w0(ExprKind::BoolAnd), 2, 1, 0]);
}

#[test]
fn comparison_lowerings() {
    let images = compile_images(
        "
def lt(a, b):
    return a < b

def le(a, b):
    return a <= b

def gt(a, b):
    return a > b

def eq(a, b):
    return a == b

def ne(a, b):
    return a != b
",
    );
    // a < b: signed compare in source order
    assert_eq!(quartet(&images[0], 4), [expr_w0(ExprKind::CmpSign), 1, 2, 0]);
    // a <= b: not(b < a)
    assert_eq!(quartet(&images[1], 4), [expr_w0(ExprKind::BoolNot), 5, 0, 0]);
    assert_eq!(quartet(&images[1], 5), [expr_w0(ExprKind::CmpSign), 2, 1, 0]);
    // a > b: reversed signed compare
    assert_eq!(quartet(&images[2], 4), [expr_w0(ExprKind::CmpSign), 2, 1, 0]);
    // a == b
    assert_eq!(quartet(&images[3], 4), [expr_w0(ExprKind::CmpEq), 1, 2, 0]);
    // a != b: not(a == b)
    assert_eq!(quartet(&images[4], 4), [expr_w0(ExprKind::BoolNot), 5, 0, 0]);
    assert_eq!(quartet(&images[4], 5), [expr_w0(ExprKind::CmpEq), 1, 2, 0]);
}

#[test]
fn unary_minus_is_zero_minus_operand() {
    let images = compile_images(
        "
def neg(a):
    return -a
",
    );
    let image = &images[0];
    assert_eq!(quartet(image, 2), [flow_w0(FlowKind::Ret), 3, 0, 0]);
    assert_eq!(quartet(image, 3), [expr_w0(ExprKind::Sub), 4, 1, 0]);
    assert_eq!(quartet(image, 4), [expr_w0(ExprKind::Word), 0, 0, 0]);
}

#[test]
fn new_and_delete_lowering() {
    let images = compile_images(
        "
def nd(n):
    p = new(n + 1)
    q = new(8, 1)
    delete(p)
    return 0
",
    );
    let image = &images[0];
    // vars: n=1, p=2, q=3, sink=4
    // p = new(n + 1): dyn_alloc(add(n, 1), local)
    assert_eq!(quartet(image, 5), [flow_w0(FlowKind::Assign), 2, 10, 0]);
    assert_eq!(quartet(image, 10), [expr_w0(ExprKind::DynAlloc), 11, 0, 0]);
    assert_eq!(quartet(image, 11), [expr_w0(ExprKind::Add), 1, 12, 0]);
    // q = new(8, 1): dyn_alloc(word 8, global)
    assert_eq!(quartet(image, 6), [flow_w0(FlowKind::Assign), 3, 13, 0]);
    assert_eq!(quartet(image, 13), [expr_w0(ExprKind::DynAlloc), 14, 1, 0]);
    // delete(p) frees first, then the sink swallows the word 0
    assert_eq!(quartet(image, 7), [flow_w0(FlowKind::DynFree), 2, 0, 0]);
    assert_eq!(quartet(image, 8), [flow_w0(FlowKind::Assign), 4, 15, 0]);
    assert_eq!(quartet(image, 15), [expr_w0(ExprKind::Word), 0, 0, 0]);
}

#[test]
fn augmented_assignment_reads_then_writes_the_target() {
    let images = compile_images(
        "
def inc(x):
    x += 2
    return x
",
    );
    let image = &images[0];
    // x = add(x, 2)
    assert_eq!(quartet(image, 2), [flow_w0(FlowKind::Assign), 1, 4, 0]);
    assert_eq!(quartet(image, 3), [flow_w0(FlowKind::Ret), 1, 0, 0]);
    assert_eq!(quartet(image, 4), [expr_w0(ExprKind::Add), 1, 5, 0]);
    assert_eq!(quartet(image, 5), [expr_w0(ExprKind::Word), 2, 0, 0]);
}

#[test]
fn if_frames_terminate_with_blockend() {
    let images = compile_images(
        "
def t(a):
    if a:
        pass
    else:
        pass
",
    );
    let image = &images[0];
    assert_eq!(quartet(image, 2), [flow_w0(FlowKind::If), 1, 4, 5]);
    assert_eq!(quartet(image, 3), [flow_w0(FlowKind::Ret), 6, 0, 0]);
    assert_eq!(quartet(image, 4), [flow_w0(FlowKind::BlockEnd), 0, 0, 0]);
    assert_eq!(quartet(image, 5), [flow_w0(FlowKind::BlockEnd), 0, 0, 0]);
    assert_eq!(quartet(image, 6), [expr_w0(ExprKind::Word), 0, 0, 0]);
}

#[test]
fn print_lowers_to_printk_calls() {
    let images = compile_images(
        "
def p(a):
    print(a)
",
    );
    let image = &images[0];
    // vars: a=1, sink=2; strings: printk=1, %d=2, \n=3, p=4
    let flags = 3; // external | variable-argument
    assert_eq!(quartet(image, 0), [function_w0(1), 4, 0, 0]);
    // _ = printk(a, "%d")
    assert_eq!(quartet(image, 3), [flow_w0(FlowKind::Assign), 2, 6, 0]);
    assert_eq!(quartet(image, 6), [expr_w0(ExprKind::CallString), 1, flags, 0]);
    assert_eq!(quartet(image, 7), [expr_w0(ExprKind::Var), 1, 0, 0]);
    assert_eq!(quartet(image, 8), [expr_w0(ExprKind::String), 2, 0, 0]);
    assert_eq!(quartet(image, 9), [expr_w0(ExprKind::CallEnd), 0, 0, 0]);
    // _ = printk("\n")
    assert_eq!(quartet(image, 4), [flow_w0(FlowKind::Assign), 2, 10, 0]);
    assert_eq!(quartet(image, 10), [expr_w0(ExprKind::CallString), 1, flags, 0]);
    assert_eq!(quartet(image, 11), [expr_w0(ExprKind::String), 3, 0, 0]);
    assert_eq!(quartet(image, 12), [expr_w0(ExprKind::CallEnd), 0, 0, 0]);
    assert_eq!(string_table(image, 14), b"printk\0%d\0\n\0p\0");
}

#[test]
fn format_string_embeds_the_helper_address() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session
        .compile(
            r#"
def m(x):
    y = "v=%d" % x
    z = "w=%d" % x
    return y
"#,
        )
        .expect("compile failed");
    assert_eq!(handles.len(), 1);

    let state = state.borrow();
    // one helper load (reused for both uses) plus the function itself
    assert_eq!(state.images.len(), 2);
    let helper_image = &state.images[0];
    // the helper is anonymous: no name on the wire
    assert_eq!(quartet(helper_image, 0)[1], 0);

    // the first load reply addressed the helper
    let helper_address = 0x5000;
    let image = &state.images[1];
    // y = <indirect call>: call_ptr(word(helper), no flags), fmt, arg, end
    assert_eq!(quartet(image, 4), [flow_w0(FlowKind::Assign), 2, 7, 0]);
    assert_eq!(quartet(image, 7), [expr_w0(ExprKind::CallPtr), 11, 0, 0]);
    assert_eq!(quartet(image, 8), [expr_w0(ExprKind::String), 1, 0, 0]);
    assert_eq!(quartet(image, 9), [expr_w0(ExprKind::Var), 1, 0, 0]);
    assert_eq!(quartet(image, 10), [expr_w0(ExprKind::CallEnd), 0, 0, 0]);
    assert_eq!(quartet(image, 11), [expr_w0(ExprKind::Word), helper_address, 0, 0]);
    // the second use reuses the same helper through the per-arity cache
    assert_eq!(quartet(image, 5), [flow_w0(FlowKind::Assign), 3, 12, 0]);
    assert_eq!(quartet(image, 12), [expr_w0(ExprKind::CallPtr), 16, 0, 0]);
    assert_eq!(quartet(image, 16), [expr_w0(ExprKind::Word), helper_address, 0, 0]);
}

#[test]
fn rebuilding_the_same_module_is_byte_identical() {
    let source = "
X = 3

def f(a, b):
    word(c)
    c = a * X
    while c > b:
        c = c - 1
    return c
";
    let first = compile_images(source);
    let second = compile_images(source);
    assert_eq!(first, second);
}

#[test]
fn min_args_counts_required_parameters_only() {
    let images = compile_images(
        "
D = 7

def f(a, b, c=1, d=D):
    return a
",
    );
    let image = &images[0];
    // min_args 2 of 4; defaults land in the argument init words
    assert_eq!(quartet(image, 0), [function_w0(2), 1, 0, 0]);
    assert_eq!(quartet(image, 1), [variable_w0(0, true), WORD_SIZE, 0, 0]);
    assert_eq!(quartet(image, 2), [variable_w0(0, true), WORD_SIZE, 0, 0]);
    assert_eq!(quartet(image, 3), [variable_w0(0, true), WORD_SIZE, 1, 0]);
    assert_eq!(quartet(image, 4), [variable_w0(0, true), WORD_SIZE, 7, 0]);
}
