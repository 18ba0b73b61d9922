//! Scripted in-memory `AioContext` for exercising the queue protocol.
//!
//! Accepted control blocks complete with the byte count of their iovecs,
//! unless a result was overridden with `fail_next_completion`. They become
//! reapable at once, or after `hold_completions` further waits.

use super::context::{AioContext, IoEvent, Iocb};
use super::request::AioRequest;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one scripted `submit` call.
#[derive(Debug, Clone, Copy)]
pub enum SubmitStep {
    /// Accept up to this many of the offered control blocks.
    Accept(usize),
    /// Fail with this errno.
    Fail(i32),
}

#[derive(Default)]
struct State {
    script: VecDeque<SubmitStep>,
    submit_calls: Vec<usize>,
    /// Accepted control blocks and the wait count at which they complete.
    ready: VecDeque<(u64, usize)>,
    hold: usize,
    overrides: HashMap<u64, i64>,
    interrupts: usize,
    wait_error: Option<i32>,
    get_events_calls: usize,
}

#[derive(Default)]
pub struct MockContext {
    state: Mutex<State>,
}

impl MockContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue submit outcomes; once drained every call accepts everything.
    pub fn script(&self, steps: impl IntoIterator<Item = SubmitStep>) {
        self.state.lock().unwrap().script.extend(steps);
    }

    /// Fail the next `n` waits with `EINTR`.
    pub fn interrupt_waits(&self, n: usize) {
        self.state.lock().unwrap().interrupts = n;
    }

    /// Keep each accepted control block pending for `waits` further waits,
    /// which come back empty until it is due.
    pub fn hold_completions(&self, waits: usize) {
        self.state.lock().unwrap().hold = waits;
    }

    /// Fail every wait with `errno`.
    pub fn fail_waits(&self, errno: i32) {
        self.state.lock().unwrap().wait_error = Some(errno);
    }

    /// Report `res` instead of the byte count when `req` completes.
    pub fn fail_next_completion(&self, req: &AioRequest, res: i64) {
        let addr = req as *const AioRequest as u64;
        self.state.lock().unwrap().overrides.insert(addr, res);
    }

    /// Number of control blocks offered on each submit call, in order.
    pub fn submit_calls(&self) -> Vec<usize> {
        self.state.lock().unwrap().submit_calls.clone()
    }

    pub fn get_events_calls(&self) -> usize {
        self.state.lock().unwrap().get_events_calls
    }

    /// Accepted but not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }
}

impl AioContext for MockContext {
    unsafe fn submit(&self, iocbs: &mut [*mut Iocb]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.submit_calls.push(iocbs.len());

        let accepted = match state.script.pop_front() {
            Some(SubmitStep::Fail(errno)) => return Err(io::Error::from_raw_os_error(errno)),
            Some(SubmitStep::Accept(n)) => n.min(iocbs.len()),
            None => iocbs.len(),
        };
        let due = state.get_events_calls + state.hold;
        for &iocb in &iocbs[..accepted] {
            state.ready.push_back((iocb as u64, due));
        }
        Ok(accepted)
    }

    fn get_events(
        &self,
        _min_nr: usize,
        events: &mut [IoEvent],
        _timeout: Duration,
    ) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.get_events_calls += 1;

        if state.interrupts > 0 {
            state.interrupts -= 1;
            return Err(io::Error::from_raw_os_error(libc::EINTR));
        }
        if let Some(errno) = state.wait_error {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let now = state.get_events_calls;
        let mut n = 0;
        while n < events.len() {
            match state.ready.front() {
                Some(&(_, due)) if due < now => {}
                _ => break,
            }
            let Some((obj, _)) = state.ready.pop_front() else {
                break;
            };
            let res = match state.overrides.remove(&obj) {
                Some(res) => res,
                None => unsafe { iovec_bytes(obj as *const Iocb) },
            };
            events[n] = IoEvent {
                data: 0,
                obj,
                res,
                res2: 0,
            };
            n += 1;
        }
        Ok(n)
    }
}

unsafe fn iovec_bytes(iocb: *const Iocb) -> i64 {
    let iocb = &*iocb;
    let iov = std::slice::from_raw_parts(iocb.aio_buf as *const libc::iovec, iocb.aio_nbytes as usize);
    iov.iter().map(|v| v.iov_len as i64).sum()
}
