//! Debug-control over a single traced process.

use std::collections::BTreeSet;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::ptr;
use std::sync::Mutex;

use lazy_static::lazy_static;
use nix::{
    errno::Errno,
    sys::ptrace::{self, Options},
};
use tracing::{debug, info, trace, warn};

use crate::error::{internal_error, Error, Result};
use crate::event::{EventSource, RawStatus};

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Options set on every traced process.
///
/// `PTRACE_O_TRACEEXIT` guarantees a final ptrace-stop before the exit status is
/// reported, while the process memory can still be unwound.
pub const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACEEXIT;

lazy_static! {
    // Raw PIDs currently held by a `TracedProcess` in this process.
    static ref CONTROLLED: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());
}

/// Lifecycle phase of a [`TracedProcess`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    // Claimed, no ptrace relationship yet.
    Unattached,

    // Stopped by the attach handshake, not yet resumed.
    Attached,

    Running,

    // In a ptrace-stop, registers and memory may be inspected.
    Stopped,

    Exited,
    Killed,
}

impl Phase {
    /// True when the process is in a ptrace-stop and may be queried.
    pub fn is_stopped(self) -> bool {
        matches!(self, Phase::Attached | Phase::Stopped)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Exited | Phase::Killed)
    }
}

/// Operations the monitor loop needs from a traced process.
pub trait Control: EventSource {
    fn pid(&self) -> Pid;

    fn phase(&self) -> Phase;

    /// Block until the process reports its next status change.
    fn wait_status(&mut self) -> Result<RawStatus>;

    /// Restart a stopped process, optionally delivering signal number `signal`.
    fn resume(&mut self, signal: Option<i32>) -> Result<()>;
}

// Exclusive claim on a PID, released on drop.
#[derive(Debug)]
struct Claim(Pid);

impl Claim {
    fn acquire(pid: Pid) -> Result<Self> {
        let mut controlled = CONTROLLED
            .lock()
            .map_err(|_| Error::Internal("poisoned tracee registry"))?;

        if !controlled.insert(pid.as_raw()) {
            return Err(Error::AlreadyTraced { pid });
        }

        debug!(pid = pid.as_raw(), "claimed process");

        Ok(Claim(pid))
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut controlled) = CONTROLLED.lock() {
            controlled.remove(&self.0.as_raw());
        }

        debug!(pid = self.0.as_raw(), "released process");
    }
}

/// One process under ptrace control.
///
/// At most one `TracedProcess` exists per PID in this process at any time. The ptrace
/// relationship belongs to the thread that attached, so a `TracedProcess` must be driven
/// from the thread that created it.
#[derive(Debug)]
pub struct TracedProcess {
    pid: Pid,
    phase: Phase,
    last_status: Option<RawStatus>,
    _claim: Claim,
}

impl TracedProcess {
    /// Reserve `pid` for tracing by this process.
    ///
    /// Fails with [`Error::AlreadyTraced`] if another `TracedProcess` holds it.
    pub fn claim(pid: Pid) -> Result<Self> {
        let _claim = Claim::acquire(pid)?;

        Ok(Self { pid, phase: Phase::Unattached, last_status: None, _claim })
    }

    /// Attach to a running process and wait for the attach-stop.
    ///
    /// On success the process is left in [`Phase::Attached`].
    pub fn attach(pid: Pid) -> Result<Self> {
        let mut traced = Self::claim(pid)?;

        ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;

        info!(pid = pid.as_raw(), "attached");

        traced.await_attach_stop(libc::SIGSTOP)?;

        Ok(traced)
    }

    /// Spawn `cmd` as a self-attached tracee.
    ///
    /// The child requests `PTRACE_TRACEME` after `fork()` and pre-`exec()`, so it stops with
    /// `SIGTRAP` on return from a successful `execve()`, before any program code runs. That
    /// stop is consumed here as the attach handshake.
    pub fn spawn(mut cmd: Command) -> Result<(Self, Child)> {
        unsafe {
            cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
        };

        let child = cmd.spawn().map_err(Error::Spawn)?;

        info!(pid = child.id(), "spawned tracee");

        Self::adopt(child)
    }

    /// Take control of `child`, which requested `PTRACE_TRACEME` before its `execve()`.
    ///
    /// If the handshake fails, `child` is killed and reaped rather than left stopped.
    pub fn adopt(mut child: Child) -> Result<(Self, Child)> {
        let pid = Pid::from_raw(child.id() as i32);

        let adopted = Self::claim(pid).and_then(|mut traced| {
            traced.await_attach_stop(libc::SIGTRAP)?;
            Ok(traced)
        });

        match adopted {
            Ok(traced) => Ok((traced, child)),
            Err(err) => {
                // A vanished child was already reaped by our own `waitpid()`.
                if !err.tracee_died() {
                    warn!(pid = pid.as_raw(), %err, "killing unadoptable child");
                    let _ = child.kill();
                    let _ = child.wait();
                }

                Err(err)
            },
        }
    }

    // Wait for the stop caused by the attach request itself, which is reported with
    // `expected`. Signals that race ahead of it are re-delivered as they are seen.
    fn await_attach_stop(&mut self, expected: i32) -> Result<()> {
        let pid = self.pid;

        loop {
            let status = self
                .wait_status()
                .map_err(|err| match err {
                    Error::Wait { source, .. } => Error::Attach { pid, source },
                    err => err,
                })?;

            match AttachStep::of(status, expected) {
                AttachStep::Attached => {
                    self.phase = Phase::Attached;
                    debug!(pid = pid.as_raw(), %status, "observed attach-stop");
                    return Ok(());
                },
                AttachStep::Redeliver(signal) => {
                    debug!(pid = pid.as_raw(), signal, "re-delivering signal seen before attach-stop");
                    self.restart(Some(signal))
                        .map_err(|err| match err {
                            Error::Resume { source, .. } => Error::Attach { pid, source },
                            err => err,
                        })?;
                },
                AttachStep::Vanished => {
                    return Err(Error::AttachVanished { pid });
                },
                AttachStep::Unexpected => {
                    internal_error!("unexpected status while attaching")
                },
            }
        }
    }

    /// Set [`TRACE_OPTIONS`] on the stopped process.
    pub fn configure(&mut self) -> Result<()> {
        if !self.phase.is_stopped() {
            internal_error!("configure on a process that is not stopped");
        }

        ptrace::setoptions(self.pid, TRACE_OPTIONS)
            .map_err(|source| Error::Configure { pid: self.pid, source })
    }

    pub fn last_status(&self) -> Option<RawStatus> {
        self.last_status
    }

    // `PTRACE_CONT` with a raw signal number. The `nix` wrapper only accepts its own
    // `Signal`, which cannot represent realtime signals.
    fn restart(&mut self, signal: Option<i32>) -> Result<()> {
        let pid = self.pid;
        let data = signal.unwrap_or(0) as libc::c_long;

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_CONT,
                pid.as_raw(),
                ptr::null_mut::<libc::c_void>(),
                data,
            )
        };
        Errno::result(res).map_err(|source| Error::Resume { pid, source })?;

        self.phase = Phase::Running;

        Ok(())
    }
}

/// What a status observed during the attach handshake means.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AttachStep {
    // The stop caused by the attach request.
    Attached,

    // Some other signal-delivery-stop won the race and must be delivered.
    Redeliver(i32),

    Vanished,
    Unexpected,
}

impl AttachStep {
    pub(crate) fn of(status: RawStatus, expected: i32) -> Self {
        let raw = status.as_raw();

        match status.phase() {
            Phase::Stopped if libc::WSTOPSIG(raw) == expected => AttachStep::Attached,
            Phase::Stopped => AttachStep::Redeliver(libc::WSTOPSIG(raw)),
            Phase::Exited | Phase::Killed => AttachStep::Vanished,
            _ => AttachStep::Unexpected,
        }
    }
}

impl EventSource for TracedProcess {
    fn event_message(&self) -> Result<u64> {
        let msg = ptrace::getevent(self.pid)
            .map_err(|source| Error::EventMessage { pid: self.pid, source })?;

        Ok(msg as u64)
    }

    // From the manual:
    //
    //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
    //     group-stop.  (Other failure codes are possible, such as ESRCH
    //     ("no such process") if a SIGKILL killed the tracee.)
    //
    fn is_group_stop(&self) -> Result<bool> {
        match ptrace::getsiginfo(self.pid) {
            Ok(_) => Ok(false),
            Err(Errno::EINVAL) => Ok(true),
            Err(source) => Err(Error::SignalInfo { pid: self.pid, source }),
        }
    }
}

impl Control for TracedProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn wait_status(&mut self) -> Result<RawStatus> {
        let pid = self.pid;
        let mut status = 0;

        // `nix::sys::wait` would decode the status word for us, and refuses words it
        // cannot map onto its signal table. Keep the raw word for `classify()`.
        loop {
            let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::__WALL) };

            match Errno::result(res) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(Error::Wait { pid, source }),
            }
        }

        let status = RawStatus::from_raw(status);
        trace!(pid = pid.as_raw(), %status, "wait status");

        self.phase = status.phase();
        self.last_status = Some(status);

        Ok(status)
    }

    fn resume(&mut self, signal: Option<i32>) -> Result<()> {
        if !self.phase.is_stopped() {
            internal_error!("resume of a process that is not stopped");
        }

        self.restart(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(signal: i32) -> RawStatus {
        RawStatus::from_raw((signal << 8) | 0x7f)
    }

    #[test]
    fn test_attach_stop_is_the_expected_signal() {
        assert_eq!(AttachStep::of(stopped(libc::SIGSTOP), libc::SIGSTOP), AttachStep::Attached);
        assert_eq!(AttachStep::of(stopped(libc::SIGTRAP), libc::SIGTRAP), AttachStep::Attached);
    }

    #[test]
    fn test_signals_before_attach_stop_are_redelivered() {
        assert_eq!(
            AttachStep::of(stopped(libc::SIGCHLD), libc::SIGSTOP),
            AttachStep::Redeliver(libc::SIGCHLD),
        );

        let rt = libc::SIGRTMIN();
        assert_eq!(AttachStep::of(stopped(rt), libc::SIGTRAP), AttachStep::Redeliver(rt));
    }

    #[test]
    fn test_termination_during_attach() {
        let exited = RawStatus::from_raw(3 << 8);
        let killed = RawStatus::from_raw(libc::SIGKILL);

        assert_eq!(AttachStep::of(exited, libc::SIGSTOP), AttachStep::Vanished);
        assert_eq!(AttachStep::of(killed, libc::SIGSTOP), AttachStep::Vanished);
        assert_eq!(AttachStep::of(RawStatus::from_raw(0xffff), libc::SIGSTOP), AttachStep::Unexpected);
    }
}
