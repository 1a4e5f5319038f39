//! Remote stack unwinding of a stopped tracee via `libunwind-ptrace`.

use std::fmt;

use tracing::{debug, trace};
use unwind::{Accessors, AddressSpace, Byteorder, Cursor, PTraceState, PTraceStateRef, RegNum};

use crate::error::{Error, Result};
use crate::session::Pid;


/// One frame of a remote backtrace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackFrame {
    pub ip: u64,
    pub sp: u64,

    /// Enclosing procedure name, empty if it could not be resolved.
    pub name: String,

    /// Byte offset of `ip` from the start of the enclosing procedure.
    pub offset: u64,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip = {:x}, sp = {:x} {}(+{})", self.ip, self.sp, self.name, self.offset)
    }
}

/// Unwinding address space plus ptrace accessor state for one process.
///
/// Registers change between stops, so no frame data is cached: every call to
/// [`frames()`](UnwindContext::frames) starts a fresh cursor at the current register state.
pub struct UnwindContext {
    pid: Pid,
    space: AddressSpace<PTraceStateRef>,
    state: PTraceState,
}

impl UnwindContext {
    pub fn open(pid: Pid) -> Result<Self> {
        let state = PTraceState::new(pid.as_raw() as u32)
            .map_err(|source| Error::Unwind { pid, source })?;
        let space = AddressSpace::new(Accessors::ptrace(), Byteorder::DEFAULT)
            .map_err(|source| Error::Unwind { pid, source })?;

        debug!(pid = pid.as_raw(), "opened unwind context");

        Ok(Self { pid, space, state })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Walk the stack outward from the innermost frame.
    ///
    /// The process must be in a ptrace-stop for the whole life of the returned iterator.
    pub fn frames(&self) -> Result<Frames<'_>> {
        let cursor = Cursor::remote(&self.space, &self.state)
            .map_err(|source| Error::Unwind { pid: self.pid, source })?;

        Ok(Frames { walk: Walk::new(cursor, MAX_FRAMES) })
    }

    /// Release the accessor state.
    pub fn close(self) {
        debug!(pid = self.pid.as_raw(), "closing unwind context");
    }
}

impl fmt::Debug for UnwindContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnwindContext").field("pid", &self.pid).finish()
    }
}

/// Deepest stack walked by [`Frames`]. Corrupt stacks can make libunwind step forever.
pub const MAX_FRAMES: usize = 256;

/// Lazy, single-pass sequence of frames, innermost first.
///
/// Yields at most [`MAX_FRAMES`] frames.
pub struct Frames<'a> {
    walk: Walk<Cursor<'a>>,
}

impl<'a> Iterator for Frames<'a> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        self.walk.next()
    }
}

// The two cursor operations a stack walk needs.
trait FrameCursor {
    type Error: fmt::Display;

    fn read(&mut self) -> std::result::Result<StackFrame, Self::Error>;

    /// Move to the caller frame. `Ok(false)` at the outermost frame.
    fn step(&mut self) -> std::result::Result<bool, Self::Error>;
}

impl<'a> FrameCursor for Cursor<'a> {
    type Error = unwind::Error;

    fn read(&mut self) -> std::result::Result<StackFrame, unwind::Error> {
        read_frame(self)
    }

    fn step(&mut self) -> std::result::Result<bool, unwind::Error> {
        Cursor::step(self)
    }
}

struct Walk<C> {
    // `None` once the walk has ended.
    cursor: Option<C>,
    remaining: usize,
}

impl<C: FrameCursor> Walk<C> {
    fn new(cursor: C, limit: usize) -> Self {
        Self { cursor: Some(cursor), remaining: limit }
    }
}

impl<C: FrameCursor> Iterator for Walk<C> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        if self.remaining == 0 {
            if self.cursor.take().is_some() {
                debug!(limit = MAX_FRAMES, "truncating backtrace");
            }
            return None;
        }

        let cursor = self.cursor.as_mut()?;

        let frame = match cursor.read() {
            Ok(frame) => frame,
            Err(err) => {
                trace!(%err, "unable to read frame registers");
                self.cursor = None;
                return None;
            },
        };

        self.remaining -= 1;

        match cursor.step() {
            Ok(true) => {},
            Ok(false) => self.cursor = None,
            Err(err) => {
                trace!(%err, "unable to step to caller frame");
                self.cursor = None;
            },
        }

        Some(frame)
    }
}

fn read_frame(cursor: &mut Cursor<'_>) -> std::result::Result<StackFrame, unwind::Error> {
    let ip = cursor.register(RegNum::IP)?;
    let sp = cursor.register(RegNum::SP)?;

    // Symbol lookup failures only degrade the frame.
    let (name, offset) = match cursor.procedure_name() {
        Ok(name) => (name.name().to_string(), name.offset()),
        Err(_) => (String::new(), 0),
    };

    Ok(StackFrame { ip, sp, name, offset })
}

/// Backtrace source used by the monitor loop.
pub trait Unwinder {
    type Context;

    /// Create the per-process context. Called once, with the process stopped.
    fn open(&mut self, pid: Pid) -> Result<Self::Context>;

    /// Frames of the stopped process, innermost first.
    fn backtrace<'a>(
        &mut self,
        context: &'a mut Self::Context,
    ) -> Result<Box<dyn Iterator<Item = StackFrame> + 'a>>;

    /// Release the per-process context. Called exactly once, after termination.
    fn close(&mut self, context: Self::Context);
}

/// [`Unwinder`] over libunwind's ptrace accessors.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteUnwinder;

impl Unwinder for RemoteUnwinder {
    type Context = UnwindContext;

    fn open(&mut self, pid: Pid) -> Result<UnwindContext> {
        UnwindContext::open(pid)
    }

    fn backtrace<'a>(
        &mut self,
        context: &'a mut UnwindContext,
    ) -> Result<Box<dyn Iterator<Item = StackFrame> + 'a>> {
        Ok(Box::new(context.frames()?))
    }

    fn close(&mut self, context: UnwindContext) {
        context.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A stack of `depth` frames, or an endless one.
    struct Stack {
        depth: Option<usize>,
        at: usize,
        fail_step_at: Option<usize>,
    }

    impl Stack {
        fn new(depth: Option<usize>) -> Self {
            Self { depth, at: 0, fail_step_at: None }
        }
    }

    impl FrameCursor for Stack {
        type Error = &'static str;

        fn read(&mut self) -> std::result::Result<StackFrame, &'static str> {
            Ok(StackFrame {
                ip: 0x1000 + self.at as u64,
                sp: 0x7000 - self.at as u64 * 16,
                name: format!("f{}", self.at),
                offset: 0,
            })
        }

        fn step(&mut self) -> std::result::Result<bool, &'static str> {
            if self.fail_step_at == Some(self.at) {
                return Err("bad unwind info");
            }

            self.at += 1;

            Ok(self.depth.map_or(true, |depth| self.at < depth))
        }
    }

    #[test]
    fn test_walk_ends_at_outermost_frame() {
        let names: Vec<_> = Walk::new(Stack::new(Some(3)), MAX_FRAMES)
            .map(|frame| frame.name)
            .collect();

        assert_eq!(names, vec!["f0", "f1", "f2"]);
    }

    #[test]
    fn test_walk_of_endless_stack_is_truncated() {
        let mut walk = Walk::new(Stack::new(None), MAX_FRAMES);

        assert_eq!(walk.by_ref().count(), MAX_FRAMES);
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_walk_keeps_frame_before_failed_step() {
        let mut stack = Stack::new(None);
        stack.fail_step_at = Some(1);

        let names: Vec<_> = Walk::new(stack, MAX_FRAMES).map(|frame| frame.name).collect();

        assert_eq!(names, vec!["f0", "f1"]);
    }
}
