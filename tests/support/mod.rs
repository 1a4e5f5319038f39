#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use tracemon::{
    Control, Error, EventSource, Phase, Pid, RawStatus, Result, StackFrame, Unwinder,
};

/// Wait status of a process that called `exit(code)`.
pub fn exited(code: i32) -> RawStatus {
    RawStatus::from_raw((code & 0xff) << 8)
}

/// Wait status of a process killed by `signal`.
pub fn killed(signal: i32) -> RawStatus {
    RawStatus::from_raw(signal & 0x7f)
}

/// Wait status of a process in a signal stop.
pub fn stopped(signal: i32) -> RawStatus {
    RawStatus::from_raw((signal << 8) | 0x7f)
}

/// Wait status of a group-stop. Under ptrace it looks like a signal stop.
pub fn group_stopped(signal: i32) -> RawStatus {
    stopped(signal)
}

/// Wait status of a ptrace-event-stop for `event`.
pub fn event_stop(event: i32) -> RawStatus {
    RawStatus::from_raw((((event << 8) | libc::SIGTRAP) << 8) | 0x7f)
}

pub fn exit_event() -> RawStatus {
    event_stop(libc::PTRACE_EVENT_EXIT)
}

pub fn continued() -> RawStatus {
    RawStatus::from_raw(0xffff)
}

/// Everything the monitor loop asked of the fakes, in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Call {
    Open,
    Wait,
    EventMessage,
    SignalInfo,
    Resume(Option<i32>),
    Backtrace,
    Close,
}

pub type Log = Rc<RefCell<Vec<Call>>>;

/// Scripted stand-in for a traced process.
pub struct FakeTarget {
    pid: Pid,
    phase: Phase,
    statuses: VecDeque<RawStatus>,
    message: u64,
    group_stops: RefCell<VecDeque<bool>>,
    vanish_at_event_message: bool,
    vanish_at_resume: Option<usize>,
    resumes: usize,
    log: Log,
}

impl FakeTarget {
    pub fn new(log: &Log, statuses: &[RawStatus]) -> Self {
        Self {
            pid: Pid::from_raw(4242),
            phase: Phase::Attached,
            statuses: statuses.iter().copied().collect(),
            message: 0,
            group_stops: RefCell::new(VecDeque::new()),
            vanish_at_event_message: false,
            vanish_at_resume: None,
            resumes: 0,
            log: log.clone(),
        }
    }

    /// Set the `PTRACE_GETEVENTMSG` value for exit events.
    pub fn with_message(mut self, message: u64) -> Self {
        self.message = message;
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Answers to successive group-stop queries. Unscripted queries answer `false`.
    pub fn with_group_stops(self, answers: &[bool]) -> Self {
        self.group_stops.borrow_mut().extend(answers);
        self
    }

    /// Fail `PTRACE_GETEVENTMSG` as if the process was killed while stopped.
    pub fn vanishing_at_event_message(mut self) -> Self {
        self.vanish_at_event_message = true;
        self
    }

    /// Fail the `n`th resume (counting from 0) as if the process was killed while stopped.
    pub fn vanishing_at_resume(mut self, n: usize) -> Self {
        self.vanish_at_resume = Some(n);
        self
    }
}

impl EventSource for FakeTarget {
    fn event_message(&self) -> Result<u64> {
        self.log.borrow_mut().push(Call::EventMessage);

        if self.vanish_at_event_message {
            return Err(Error::EventMessage { pid: self.pid, source: Errno::ESRCH });
        }

        Ok(self.message)
    }

    fn is_group_stop(&self) -> Result<bool> {
        self.log.borrow_mut().push(Call::SignalInfo);
        Ok(self.group_stops.borrow_mut().pop_front().unwrap_or(false))
    }
}

impl Control for FakeTarget {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn wait_status(&mut self) -> Result<RawStatus> {
        self.log.borrow_mut().push(Call::Wait);

        let status = self.statuses.pop_front().ok_or(Error::Wait {
            pid: self.pid,
            source: Errno::ECHILD,
        })?;
        self.phase = status.phase();

        Ok(status)
    }

    fn resume(&mut self, signal: Option<i32>) -> Result<()> {
        assert!(self.phase.is_stopped(), "resumed a process in phase {:?}", self.phase);

        self.log.borrow_mut().push(Call::Resume(signal));
        self.phase = Phase::Running;

        let n = self.resumes;
        self.resumes += 1;

        if self.vanish_at_resume == Some(n) {
            return Err(Error::Resume { pid: self.pid, source: Errno::ESRCH });
        }

        Ok(())
    }
}

pub struct FakeContext;

/// Unwinder returning canned frames.
pub struct FakeUnwinder {
    frames: Vec<StackFrame>,
    log: Log,
}

impl FakeUnwinder {
    pub fn new(log: &Log, frames: Vec<StackFrame>) -> Self {
        Self { frames, log: log.clone() }
    }
}

impl Unwinder for FakeUnwinder {
    type Context = FakeContext;

    fn open(&mut self, _pid: Pid) -> Result<FakeContext> {
        self.log.borrow_mut().push(Call::Open);
        Ok(FakeContext)
    }

    fn backtrace<'a>(
        &mut self,
        _context: &'a mut FakeContext,
    ) -> Result<Box<dyn Iterator<Item = StackFrame> + 'a>> {
        self.log.borrow_mut().push(Call::Backtrace);
        Ok(Box::new(self.frames.clone().into_iter()))
    }

    fn close(&mut self, _context: FakeContext) {
        self.log.borrow_mut().push(Call::Close);
    }
}

pub fn frame(ip: u64, sp: u64, name: &str, offset: u64) -> StackFrame {
    StackFrame { ip, sp, name: name.to_string(), offset }
}

/// Output sink that can be read back after being moved into a tracer thread.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().expect("poisoned output buffer");
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.0.lock().expect("poisoned output buffer");
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
