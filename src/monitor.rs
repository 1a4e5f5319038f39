//! The observation loop: wait, classify, report, resume.

use std::convert::TryFrom;
use std::io::Write;

use tracing::{debug, info, trace, warn};

use crate::error::{internal_error, Result};
use crate::event::{classify, PendingExit, StopEvent, TraceEvent};
use crate::session::{Control, Signal};
use crate::unwinder::Unwinder;


/// When the monitor prints a backtrace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BacktracePolicy {
    /// Only at the `PTRACE_EVENT_EXIT` stop.
    OnExit,

    /// At the exit stop, and at every signal stop.
    OnSignal,
}

/// Monitor loop policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    backtrace: BacktracePolicy,
    forward_signals: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backtrace: BacktracePolicy::OnExit,
            forward_signals: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backtrace(&self) -> BacktracePolicy {
        self.backtrace
    }

    pub fn set_backtrace(mut self, backtrace: BacktracePolicy) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Whether the signal of a signal stop is delivered when the process is resumed.
    ///
    /// If unset, such signals are suppressed. A process stopped by a hardware fault will
    /// then re-execute the faulting instruction and stop again.
    pub fn forward_signals(&self) -> bool {
        self.forward_signals
    }

    pub fn set_forward_signals(mut self, forward_signals: bool) -> Self {
        self.forward_signals = forward_signals;
        self
    }
}

/// How the traced process ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    Exited { exit_code: i32 },
    Killed { signal: i32 },
}

/// Drives one traced process to termination, writing a line-oriented trace to `out`.
#[derive(Debug)]
pub struct Monitor<W> {
    config: Config,
    out: W,
}

impl<W: Write> Monitor<W> {
    pub fn new(config: Config, out: W) -> Self {
        Self { config, out }
    }

    pub fn config(&self) -> Config {
        self.config
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Observe `target` until it exits or is killed.
    ///
    /// `target` must be stopped, typically in [`Phase::Attached`](crate::Phase::Attached).
    /// The unwind context is opened before the first resume and closed exactly once when
    /// the loop ends.
    pub fn run<C, U>(&mut self, target: &mut C, unwinder: &mut U) -> Result<Termination>
    where
        C: Control,
        U: Unwinder,
    {
        let pid = target.pid();

        if !target.phase().is_stopped() {
            internal_error!("monitor started on a process that is not stopped");
        }

        let mut context = unwinder.open(pid)?;

        let res = self.observe(target, unwinder, &mut context);

        unwinder.close(context);

        match &res {
            Ok(termination) => info!(pid = pid.as_raw(), ?termination, "tracee terminated"),
            Err(err) => warn!(pid = pid.as_raw(), %err, "monitor loop aborted"),
        }

        res
    }

    fn observe<C, U>(
        &mut self,
        target: &mut C,
        unwinder: &mut U,
        context: &mut U::Context,
    ) -> Result<Termination>
    where
        C: Control,
        U: Unwinder,
    {
        // Release the attach-stop; its status was consumed by the attach handshake.
        self.resume(target, None)?;

        loop {
            let status = target.wait_status()?;

            let event = match classify(status, &*target) {
                Ok(event) => event,
                Err(err) if err.tracee_died() => {
                    // Killed while stopped; the terminal status is still pending.
                    debug!(pid = target.pid().as_raw(), %err, "tracee vanished during stop");
                    continue;
                },
                Err(err) => return Err(err),
            };

            trace!(pid = target.pid().as_raw(), %status, ?event, "classified status");

            match event {
                StopEvent::Exited { exit_code } => {
                    writeln!(self.out, "exited, status={}", exit_code)?;
                    return Ok(Termination::Exited { exit_code });
                },
                StopEvent::Killed { signal, .. } => {
                    writeln!(self.out, "killed by signal {}", signal)?;
                    return Ok(Termination::Killed { signal });
                },
                StopEvent::TraceEvent(TraceEvent::Exit(pending)) => {
                    match pending {
                        PendingExit::Code(code) =>
                            writeln!(self.out, "child exit({})", code)?,
                        PendingExit::Signal { signal, .. } =>
                            writeln!(self.out, "child killed by signal {}", signal)?,
                    }

                    self.print_backtrace(target, unwinder, context)?;
                    self.resume(target, None)?;
                },
                StopEvent::SignalStop { signal } => {
                    writeln!(self.out, "stopped by signal {}({})", signal, signal_name(signal))?;

                    if self.config.backtrace == BacktracePolicy::OnSignal {
                        self.print_backtrace(target, unwinder, context)?;
                    }

                    let inject = if self.config.forward_signals {
                        Some(signal)
                    } else {
                        None
                    };

                    self.resume(target, inject)?;
                },
                StopEvent::GroupStop { signal } => {
                    // The stopping signal was already reported at its delivery-stop.
                    trace!(pid = target.pid().as_raw(), signal, "passing over group-stop");
                    self.resume(target, None)?;
                },
                StopEvent::TraceEvent(TraceEvent::Unknown { code }) => {
                    // Exec-traps, syscall-stops and other ptrace events are passed over.
                    trace!(pid = target.pid().as_raw(), code, "ignoring trace event");
                    self.resume(target, None)?;
                },
                StopEvent::Continued => {
                    writeln!(self.out, "continued")?;

                    if target.phase().is_stopped() {
                        self.resume(target, None)?;
                    }
                },
            }
        }
    }

    fn print_backtrace<C, U>(
        &mut self,
        target: &C,
        unwinder: &mut U,
        context: &mut U::Context,
    ) -> Result<()>
    where
        C: Control,
        U: Unwinder,
    {
        if !target.phase().is_stopped() {
            internal_error!("backtrace of a process that is not stopped");
        }

        match unwinder.backtrace(context) {
            Ok(frames) => {
                for frame in frames {
                    writeln!(self.out, "{}", frame)?;
                }
            },
            Err(err) => {
                warn!(pid = target.pid().as_raw(), %err, "unable to unwind tracee");
            },
        }

        Ok(())
    }

    fn resume<C: Control>(&mut self, target: &mut C, signal: Option<i32>) -> Result<()> {
        match target.resume(signal) {
            Err(err) if err.tracee_died() => {
                debug!(pid = target.pid().as_raw(), %err, "tracee vanished before resume");
                Ok(())
            },
            res => res,
        }
    }
}

/// Name of signal number `signal`, or `?` if it has none.
pub fn signal_name(signal: i32) -> &'static str {
    Signal::try_from(signal).map(Signal::as_str).unwrap_or("?")
}
