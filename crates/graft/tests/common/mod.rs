//! Shared test fixtures: a scripted in-process device channel and helpers
//! for decoding captured function images.
#![allow(dead_code)]

use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

use graft::{DeviceChannel, DeviceOp, WORD_SIZE, Word, unpack_header};

/// Everything the mock device observed and how it should answer.
#[derive(Default)]
pub struct MockState {
    /// Decoded request frames, arrival order.
    pub requests: Vec<[Word; 5]>,
    /// Images captured from LOAD requests.
    pub images: Vec<Vec<u8>>,
    /// Name buffers captured from named EXECUTE/UNLOAD requests (with their
    /// trailing NUL).
    pub names: Vec<Vec<u8>>,
    /// Argument word arrays captured from EXECUTE requests.
    pub arg_blocks: Vec<Vec<Word>>,
    /// Error codes to refuse upcoming requests with (GET_LAST_EXCEPTION is
    /// never refused).
    pub fail_next: VecDeque<Word>,
    /// The 4-word record GET_LAST_EXCEPTION writes into the caller's
    /// scratch buffer.
    pub exception_record: Option<[Word; 4]>,
    /// Reply value for EXECUTE requests.
    pub execute_result: Word,
    /// When set, every reply body is empty (zero bytes).
    pub empty_replies: bool,
    next_address: Word,
    pending_reply: Option<[Word; 5]>,
}

/// A [`DeviceChannel`] backed by shared scriptable state.
#[derive(Clone, Default)]
pub struct MockChannel(pub Rc<RefCell<MockState>>);

impl MockChannel {
    pub fn new() -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState {
            next_address: 0x4000,
            ..MockState::default()
        }));
        (Self(Rc::clone(&state)), state)
    }
}

impl DeviceChannel for MockChannel {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut words = [0; 5];
        for (slot, chunk) in frame.chunks_exact(WORD_SIZE).enumerate() {
            words[slot] = Word::from_le_bytes(chunk.try_into().unwrap());
        }
        let mut state = self.0.borrow_mut();
        state.requests.push(words);
        let header = unpack_header(words[0]);
        let op = header.op;

        if op != DeviceOp::GetLastException as u8
            && let Some(code) = state.fail_next.pop_front()
        {
            state.pending_reply = Some([0, 0, 0, code, 0]);
            return Err(io::Error::other("device refused the request"));
        }

        let mut reply_value = 0;
        if op == DeviceOp::Load as u8 {
            // SAFETY: the caller's image buffer is alive for the duration
            // of this send, exactly as it would be for the real device.
            let image = unsafe { std::slice::from_raw_parts(words[3] as *const u8, words[1]) };
            state.images.push(image.to_vec());
            state.next_address += 0x1000;
            reply_value = state.next_address;
        } else if op == DeviceOp::Execute as u8 || op == DeviceOp::Unload as u8 {
            // SAFETY: the name staging buffer (len1 bytes + NUL) is alive
            // during the send.
            let name = unsafe { std::slice::from_raw_parts(words[3] as *const u8, words[1] + 1) };
            state.names.push(name.to_vec());
        }
        if op == DeviceOp::Execute as u8 || op == DeviceOp::ExecuteAnonymous as u8 {
            let count = words[2] / WORD_SIZE;
            // SAFETY: the packed argument array (len2 bytes) is alive
            // during the send.
            let packed = unsafe { std::slice::from_raw_parts(words[4] as *const u8, words[2]) };
            let args = packed
                .chunks_exact(WORD_SIZE)
                .map(|chunk| Word::from_le_bytes(chunk.try_into().unwrap()))
                .collect::<Vec<_>>();
            assert_eq!(args.len(), count);
            state.arg_blocks.push(args);
            reply_value = state.execute_result;
        }
        if op == DeviceOp::GetLastException as u8
            && let Some(record) = state.exception_record
        {
            let scratch = words[3] as *mut Word;
            for (slot, value) in record.iter().enumerate() {
                // SAFETY: the caller passed a live 4-word scratch buffer.
                unsafe { scratch.add(slot).write_volatile(*value) };
            }
        }
        state.pending_reply = Some([0, 0, 0, reply_value, 0]);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        let reply = state.pending_reply.take();
        if state.empty_replies {
            return Ok(0);
        }
        let Some(words) = reply else {
            return Ok(0);
        };
        for (slot, word) in words.iter().enumerate() {
            buf[slot * WORD_SIZE..(slot + 1) * WORD_SIZE].copy_from_slice(&word.to_le_bytes());
        }
        Ok(5 * WORD_SIZE)
    }
}

/// The `index`-th quartet of an image.
pub fn quartet(image: &[u8], index: usize) -> [Word; 4] {
    let start = index * 4 * WORD_SIZE;
    let mut words = [0; 4];
    for (slot, chunk) in image[start..start + 4 * WORD_SIZE].chunks_exact(WORD_SIZE).enumerate() {
        words[slot] = Word::from_le_bytes(chunk.try_into().unwrap());
    }
    words
}

/// The string table: everything after `quartet_count` quartets.
pub fn string_table(image: &[u8], quartet_count: usize) -> &[u8] {
    &image[quartet_count * 4 * WORD_SIZE..]
}

/// First word of a flow quartet of the given kind.
pub fn flow_w0(kind: graft::FlowKind) -> Word {
    graft::OpFamily::Flow as Word | ((kind as Word) << 2)
}

/// First word of an expression quartet of the given kind.
pub fn expr_w0(kind: graft::ExprKind) -> Word {
    graft::OpFamily::Expression as Word | ((kind as Word) << 2)
}

/// All captured requests carrying the given operation code.
pub fn requests_for(state: &MockState, op: DeviceOp) -> Vec<[Word; 5]> {
    state
        .requests
        .iter()
        .copied()
        .filter(|words| unpack_header(words[0]).op == op as u8)
        .collect()
}
