//! Decoding of `wait(2)` status words into tracing events.

use std::fmt;

use crate::error::{internal_error, Result};
use crate::session::Phase;


/// A raw `wait(2)` status word, as filled in by `waitpid()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawStatus(i32);

impl RawStatus {
    pub const fn from_raw(status: i32) -> Self {
        Self(status)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Lifecycle phase of a process which reported this status.
    pub fn phase(self) -> Phase {
        let status = self.0;

        if libc::WIFEXITED(status) {
            Phase::Exited
        } else if libc::WIFSIGNALED(status) {
            Phase::Killed
        } else if libc::WIFSTOPPED(status) {
            Phase::Stopped
        } else {
            Phase::Running
        }
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Ptrace queries used to disambiguate the stop being classified.
pub trait EventSource {
    /// `PTRACE_GETEVENTMSG` data of the current ptrace-event-stop.
    fn event_message(&self) -> Result<u64>;

    /// True if the current stop is a group-stop rather than a signal-delivery-stop.
    fn is_group_stop(&self) -> Result<bool>;
}

/// A decoded status change of a traced process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopEvent {
    // Normal termination via `exit()`.
    Exited { exit_code: i32 },

    // Terminated by a signal.
    Killed { signal: i32, core_dumped: bool },

    // signal-delivery-stop for any signal but `SIGTRAP`.
    SignalStop { signal: i32 },

    // group-stop, after a stopping signal was delivered.
    GroupStop { signal: i32 },

    // `SIGTRAP` stops raised by ptrace itself.
    TraceEvent(TraceEvent),

    Continued,
}

impl StopEvent {
    /// True for events after which the process no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopEvent::Exited { .. } | StopEvent::Killed { .. })
    }
}

/// Sub-reason of a ptrace-generated `SIGTRAP` stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceEvent {
    /// `PTRACE_EVENT_EXIT`: the process is about to exit, but its memory and registers are
    /// still intact.
    Exit(PendingExit),

    /// Any other trap: exec-trap, syscall-stop, or an event we do not request.
    Unknown { code: i32 },
}

/// How a process stopped at `PTRACE_EVENT_EXIT` is about to terminate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingExit {
    Code(i32),
    Signal { signal: i32, core_dumped: bool },
}

impl PendingExit {
    /// Decode the event message of a `PTRACE_EVENT_EXIT` stop.
    ///
    /// In this context, `PTRACE_GETEVENTMSG` returns the pending wait status as an
    /// `unsigned long`. Only the low 16-bit word is meaningful.
    pub fn parse(message: u64) -> Self {
        // The bit layout of the word `status` is:
        //
        //   15                         8   7                     0
        //    +-------------------------+---+---------------------+
        //    |        exit_code        | c |       sig_no        |
        //    +-------------------------+---+---------------------+
        let status = message as u16;
        let sig_no = i32::from(status & 0x7f);

        if sig_no == 0 {
            PendingExit::Code(i32::from(status >> 8))
        } else {
            let core_dumped = status & 0x80 != 0;
            PendingExit::Signal { signal: sig_no, core_dumped }
        }
    }
}

/// Syscall-stops set bit 7 of the stop signal when `PTRACE_O_TRACESYSGOOD` is in effect.
const SYSCALL_TRAP: i32 = libc::SIGTRAP | 0x80;

// Only these four signals are stopping signals. If the tracer sees something else, it
// can't be a group-stop.
fn is_stopping_signal(signal: i32) -> bool {
    matches!(signal, libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU)
}

/// Decode `status` into a [`StopEvent`].
///
/// A `SIGTRAP` stop carrying an event code is checked before any plain signal stop, so
/// that `PTRACE_EVENT_EXIT` is never mistaken for signal delivery. For that event the
/// pending exit status is fetched from `events`, and stops for stopping signals are
/// checked against `events` for group-stops.
pub fn classify(status: RawStatus, events: &impl EventSource) -> Result<StopEvent> {
    let raw = status.as_raw();

    let event = if libc::WIFEXITED(raw) {
        StopEvent::Exited { exit_code: libc::WEXITSTATUS(raw) }
    } else if libc::WIFSIGNALED(raw) {
        StopEvent::Killed {
            signal: libc::WTERMSIG(raw),
            core_dumped: libc::WCOREDUMP(raw),
        }
    } else if libc::WIFSTOPPED(raw) {
        let signal = libc::WSTOPSIG(raw);

        if signal == libc::SIGTRAP {
            let code = (raw >> 16) & 0xff;

            if code == libc::PTRACE_EVENT_EXIT {
                let pending = PendingExit::parse(events.event_message()?);
                StopEvent::TraceEvent(TraceEvent::Exit(pending))
            } else {
                StopEvent::TraceEvent(TraceEvent::Unknown { code })
            }
        } else if signal == SYSCALL_TRAP {
            StopEvent::TraceEvent(TraceEvent::Unknown { code: 0 })
        } else if is_stopping_signal(signal) && events.is_group_stop()? {
            StopEvent::GroupStop { signal }
        } else {
            StopEvent::SignalStop { signal }
        }
    } else if libc::WIFCONTINUED(raw) {
        StopEvent::Continued
    } else {
        internal_error!("undecodable wait status")
    };

    Ok(event)
}
