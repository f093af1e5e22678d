//! Shared mocks for the slot/manager tests: a scriptable client connection
//! and a no-op send surface.

use crate::net::client::{ClientConn, ClientId};
use crate::net::defs::{ConnTx, RecvOutcome, SendOutcome};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Send surface that accepts and discards everything.
pub struct NullTx;

impl ConnTx for NullTx {
    fn raw_send(&mut self, _buf: &[u8], _max_retry_ms: u64) -> SendOutcome {
        SendOutcome::Ok
    }
}

#[derive(Default)]
pub struct MockConnState {
    /// Chunks handed out by successive recv_start calls.
    pub rx: VecDeque<Vec<u8>>,
    /// Everything successfully written.
    pub sent: Vec<u8>,
    pub active: bool,
    /// Report peer close once the rx queue is drained.
    pub peer_closed: bool,
    /// Writability as seen by can_send.
    pub writable: bool,
    /// Next N sends return EAgain without writing.
    pub eagain_sends: usize,
    /// Next send fails fatally.
    pub fail_next_send: bool,
    /// Cap on bytes accepted per send (partial writes).
    pub accept_limit: Option<usize>,
}

pub struct MockClientConn {
    id: ClientId,
    state: Arc<Mutex<MockConnState>>,
}

/// A mock connection plus the shared state handle tests inspect after the
/// connection has been moved into a slot.
pub fn mock_conn(id: ClientId) -> (Box<dyn ClientConn>, Arc<Mutex<MockConnState>>) {
    let state = Arc::new(Mutex::new(MockConnState {
        active: true,
        writable: true,
        ..MockConnState::default()
    }));
    let conn = MockClientConn { id, state: Arc::clone(&state) };
    (Box::new(conn), state)
}

impl ClientConn for MockClientConn {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.state.lock().map(|state| state.active).unwrap_or(false)
    }

    fn setup(&mut self, _blocking: bool) {}

    fn send(&mut self, buf: &[u8], _max_retry_ms: u64) -> (SendOutcome, usize) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return (SendOutcome::Fail, 0),
        };
        if !state.active {
            return (SendOutcome::Fail, 0);
        }
        if state.fail_next_send {
            state.active = false;
            return (SendOutcome::Fail, 0);
        }
        if state.eagain_sends > 0 {
            state.eagain_sends -= 1;
            return (SendOutcome::EAgain, 0);
        }
        let take = state.accept_limit.unwrap_or(buf.len()).min(buf.len());
        state.sent.extend_from_slice(&buf[..take]);
        (SendOutcome::Ok, take)
    }

    fn can_send(&mut self) -> SendOutcome {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return SendOutcome::Fail,
        };
        if !state.active {
            SendOutcome::Fail
        } else if state.writable {
            SendOutcome::Ok
        } else {
            SendOutcome::EAgain
        }
    }

    fn recv_start(&mut self, out_buf: &mut Vec<u8>) -> RecvOutcome {
        out_buf.clear();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return RecvOutcome::Error,
        };
        if !state.active {
            return RecvOutcome::ConnClosed;
        }
        if let Some(chunk) = state.rx.pop_front() {
            *out_buf = chunk;
            return RecvOutcome::Ok;
        }
        if state.peer_closed {
            state.active = false;
            return RecvOutcome::ConnClosed;
        }
        RecvOutcome::Ok
    }

    fn recv_end(&mut self) {}
}
