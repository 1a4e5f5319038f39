//! Session drivers: obtain a traced process, then hand it to the monitor loop.
//!
//! Both drivers share the same core. They differ only in how the [`TracedProcess`] is
//! obtained: [`trace_command()`] spawns a self-attached child on the calling thread, while
//! [`start_tracing()`] attaches to an existing PID from a dedicated worker thread.

use std::io::Write;
use std::process::Command;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::monitor::{Config, Monitor, Termination};
use crate::session::{Pid, TracedProcess};
use crate::unwinder::RemoteUnwinder;


/// Spawn `cmd` and trace it on the calling thread until it terminates.
pub fn trace_command<W: Write>(cmd: Command, config: Config, out: W) -> Result<Termination> {
    let (mut traced, _child) = TracedProcess::spawn(cmd)?;
    traced.configure()?;

    let mut monitor = Monitor::new(config, out);
    monitor.run(&mut traced, &mut RemoteUnwinder)
}

/// Handle to a tracer thread started by [`start_tracing()`].
///
/// Dropping the handle detaches the thread, which keeps tracing until the process ends.
#[derive(Debug)]
pub struct TracingHandle {
    pid: Pid,
    thread: JoinHandle<Result<Termination>>,
}

impl TracingHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the traced process terminates.
    pub fn join(self) -> Result<Termination> {
        self.thread
            .join()
            .map_err(|_| Error::Internal("tracer thread panicked"))?
    }
}

/// Attach to the running process `pid` and trace it from a new thread.
///
/// Returns once the worker has attached and configured the process, so attach failures
/// are reported here. The caller must not issue ptrace requests against `pid` while the
/// handle's thread is running.
pub fn start_tracing<W>(pid: Pid, config: Config, out: W) -> Result<TracingHandle>
where
    W: Write + Send + 'static,
{
    let (attached_tx, attached_rx) = mpsc::channel();

    let thread = thread::Builder::new()
        .name(format!("tracer-{}", pid))
        .spawn(move || {
            // Ptrace requests are only accepted from the attaching thread, so the whole
            // session must live here.
            let attached = TracedProcess::attach(pid).and_then(|mut traced| {
                traced.configure()?;
                Ok(traced)
            });

            let mut traced = match attached {
                Ok(traced) => {
                    let _ = attached_tx.send(Ok(()));
                    traced
                },
                Err(err) => {
                    error!(pid = pid.as_raw(), %err, "unable to start tracing");
                    let _ = attached_tx.send(Err(err));
                    return Err(Error::Internal("tracer thread never attached"));
                },
            };

            let mut monitor = Monitor::new(config, out);
            monitor.run(&mut traced, &mut RemoteUnwinder)
        })
        .map_err(Error::ThreadStart)?;

    match attached_rx.recv() {
        Ok(Ok(())) => {
            info!(pid = pid.as_raw(), "tracer thread attached");
            Ok(TracingHandle { pid, thread })
        },
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        },
        Err(_) => {
            debug!(pid = pid.as_raw(), "tracer thread exited before reporting attach");
            let _ = thread.join();
            Err(Error::Internal("tracer thread exited before attaching"))
        },
    }
}
