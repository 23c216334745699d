//! Session and device-protocol checks through the mock channel: framing,
//! lifecycle, error mapping, and exception retrieval.

mod common;

use common::{MockChannel, requests_for};
use graft::{
    CallArg, DeviceOp, ExceptionRecord, GraftError, KernelError, Session, SessionError, WORD_SIZE, unpack_header,
};
use pretty_assertions::assert_eq;

const ADD: &str = "
def add(a, b):
    return a + b
";

#[test]
fn load_frames_carry_the_image() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();
    assert_eq!(handles.len(), 1);

    let state = state.borrow();
    let loads = requests_for(&state, DeviceOp::Load);
    assert_eq!(loads.len(), 1);
    let header = unpack_header(loads[0][0]);
    assert_eq!(header.word_size, WORD_SIZE);
    assert_eq!(header.version, (1, 0));
    assert!(!header.global);
    // len1 is the image size; the image itself was captured through val1
    assert_eq!(loads[0][1], state.images[0].len());
    assert_eq!(loads[0][2], 0);
}

#[test]
fn load_reply_value_becomes_the_address() {
    let (channel, _state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();
    assert_eq!(session.address_of(handles[0]), Some(0x5000));
}

#[test]
fn global_sessions_set_the_global_bit() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, true);
    session.compile(ADD).unwrap();
    session.close().unwrap();

    let state = state.borrow();
    for request in &state.requests {
        assert!(unpack_header(request[0]).global);
    }
    assert_eq!(requests_for(&state, DeviceOp::Unload).len(), 1);
}

#[test]
fn execute_marshals_name_and_arguments() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();

    state.borrow_mut().execute_result = 12;
    let result = session.execute(handles[0], &[CallArg::Word(5), CallArg::Word(7)]).unwrap();
    assert_eq!(result, Some(12));

    let state = state.borrow();
    let executes = requests_for(&state, DeviceOp::Execute);
    assert_eq!(executes.len(), 1);
    // len1 = name length (without the staged NUL), len2 = packed arg bytes
    assert_eq!(executes[0][1], 3);
    assert_eq!(executes[0][2], 2 * WORD_SIZE);
    assert_eq!(state.names[0], b"add\0");
    assert_eq!(state.arg_blocks[0], vec![5, 7]);
}

#[test]
fn string_arguments_are_staged_behind_pointers() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();
    session.execute(handles[0], &[CallArg::Str("hey".into()), CallArg::Word(1)]).unwrap();

    let state = state.borrow();
    let args = &state.arg_blocks[0];
    assert_eq!(args.len(), 2);
    assert_eq!(args[1], 1);
    // the first slot is the address of a NUL-terminated staging buffer;
    // the buffer was alive during the send, when the mock recorded the
    // request, but there is nothing more to assert without re-reading it
    assert_ne!(args[0], 0);
}

#[test]
fn empty_reply_bodies_mean_no_value() {
    let (channel, state) = MockChannel::new();
    state.borrow_mut().empty_replies = true;
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();
    assert_eq!(session.address_of(handles[0]), None);
    assert_eq!(session.execute(handles[0], &[]).unwrap(), None);
}

#[test]
fn kernel_refusals_map_to_the_error_table() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();

    state.borrow_mut().fail_next.push_back(14);
    let error = session.execute(handles[0], &[]).unwrap_err();
    match error {
        GraftError::Kernel(kernel) => assert_eq!(kernel, KernelError::DivideByZero),
        other => panic!("expected a kernel error, got {other:?}"),
    }
}

#[test]
fn failed_execute_fetches_the_exception_record() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();

    {
        let mut state = state.borrow_mut();
        state.fail_next.push_back(14);
        state.exception_record = Some([0, 14, 77, 88]);
    }
    session.execute(handles[0], &[]).unwrap_err();
    assert_eq!(session.last_exception(), Some(ExceptionRecord { arg1: 77, arg2: 88 }));

    let state = state.borrow();
    let fetches = requests_for(&state, DeviceOp::GetLastException);
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0][1], 4 * WORD_SIZE);
}

#[test]
fn mismatched_exception_codes_leave_the_record_alone() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();

    {
        let mut state = state.borrow_mut();
        state.fail_next.push_back(14);
        // the record is stale: it belongs to error 5, not 14
        state.exception_record = Some([0, 5, 9, 9]);
    }
    session.execute(handles[0], &[]).unwrap_err();
    assert_eq!(session.last_exception(), None);
}

#[test]
fn load_refusals_leave_the_function_unregistered() {
    let (channel, state) = MockChannel::new();
    state.borrow_mut().fail_next.push_back(1);
    let mut session = Session::with_channel(channel, false);
    let error = session.compile(ADD).unwrap_err();
    match error {
        GraftError::Kernel(kernel) => assert_eq!(kernel, KernelError::NoMemory),
        other => panic!("expected a kernel error, got {other:?}"),
    }
}

#[test]
fn unload_removes_the_entry_even_when_the_kernel_refuses() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session.compile(ADD).unwrap();

    state.borrow_mut().fail_next.push_back(15);
    session.unload(handles[0]).unwrap_err();
    // the handle is gone client-side regardless
    let again = session.unload(handles[0]).unwrap_err();
    match again {
        GraftError::Session(session_error) => assert_eq!(session_error, SessionError::NotOwned),
        other => panic!("expected a session error, got {other:?}"),
    }
}

#[test]
fn non_global_close_skips_device_unloads() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    session.compile(ADD).unwrap();
    session.close().unwrap();

    let state = state.borrow();
    assert!(requests_for(&state, DeviceOp::Unload).is_empty());
}

#[test]
fn global_close_unloads_every_function() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, true);
    session
        .compile(
            "
def one():
    return 1

def two():
    return 2
",
        )
        .unwrap();
    session.close().unwrap();
    // closing twice is fine
    session.close().unwrap();

    let state = state.borrow();
    assert_eq!(requests_for(&state, DeviceOp::Unload).len(), 2);
    assert_eq!(state.names[0], b"one\0");
    assert_eq!(state.names[1], b"two\0");
}

#[test]
fn closed_sessions_refuse_work() {
    let (channel, _state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    session.close().unwrap();
    let error = session.compile(ADD).unwrap_err();
    match error {
        GraftError::Session(session_error) => assert_eq!(session_error, SessionError::Closed),
        other => panic!("expected a session error, got {other:?}"),
    }
}

#[test]
fn compile_errors_happen_before_any_device_traffic() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    assert!(session.compile("1 + 2").is_err());
    assert!(state.borrow().requests.is_empty());
}

#[test]
fn static_functions_load_but_are_not_returned() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session
        .compile(
            r#"
STATIC("hidden")

def hidden():
    return 1

def visible():
    return hidden()
"#,
        )
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(session.function(handles[0]).unwrap().name(), "visible");
    assert_eq!(requests_for(&state.borrow(), DeviceOp::Load).len(), 2);
}

#[test]
fn anonymous_functions_execute_and_unload_by_address() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session
        .compile(
            r#"
ANONYMOUS("anon")

def anon():
    return 1
"#,
        )
        .unwrap();
    let handle = handles[0];
    let address = session.address_of(handle).unwrap();
    session.execute(handle, &[CallArg::Word(9)]).unwrap();
    session.unload(handle).unwrap();

    let state = state.borrow();
    let executes = requests_for(&state, DeviceOp::ExecuteAnonymous);
    assert_eq!(executes.len(), 1);
    assert_eq!(executes[0][1], 0);
    assert_eq!(executes[0][3], address);
    let unloads = requests_for(&state, DeviceOp::UnloadAnonymous);
    assert_eq!(unloads.len(), 1);
    assert_eq!(unloads[0][3], address);
}

#[test]
fn unloading_an_owner_unloads_its_format_helper_first() {
    let (channel, state) = MockChannel::new();
    let mut session = Session::with_channel(channel, false);
    let handles = session
        .compile(
            r#"
def m(x):
    return "v=%d" % x
"#,
        )
        .unwrap();
    session.unload(handles[0]).unwrap();

    let state = state.borrow();
    // the helper is anonymous; it unloads by address before its owner
    let order: Vec<u8> = state
        .requests
        .iter()
        .map(|request| unpack_header(request[0]).op)
        .filter(|op| *op == DeviceOp::Unload as u8 || *op == DeviceOp::UnloadAnonymous as u8)
        .collect();
    assert_eq!(order, vec![DeviceOp::UnloadAnonymous as u8, DeviceOp::Unload as u8]);
}
