use std::io;

use nix::errno::Errno;

use crate::session::Pid;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not attach to process = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Process = {pid} terminated before it could be traced")]
    AttachVanished { pid: Pid },

    #[error("Process = {pid} is already controlled by another tracer")]
    AlreadyTraced { pid: Pid },

    #[error("Could not set trace options on process = {pid}")]
    Configure { pid: Pid, source: nix::Error },

    #[error("Could not resume process = {pid}")]
    Resume { pid: Pid, source: nix::Error },

    #[error("Could not wait for status change of process = {pid}")]
    Wait { pid: Pid, source: nix::Error },

    #[error("Could not read trace event message of process = {pid}")]
    EventMessage { pid: Pid, source: nix::Error },

    #[error("Could not read signal info of process = {pid}")]
    SignalInfo { pid: Pid, source: nix::Error },

    #[error("Could not spawn traced program")]
    Spawn(#[source] io::Error),

    #[error("Could not start tracer thread")]
    ThreadStart(#[source] io::Error),

    #[error("Could not create remote unwinder for process = {pid}")]
    Unwind { pid: Pid, source: unwind::Error },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// True if the error was caused by the traced process no longer existing.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::AttachVanished { .. } => true,
            Error::Attach { source, .. } |
            Error::Configure { source, .. } |
            Error::Resume { source, .. } |
            Error::Wait { source, .. } |
            Error::EventMessage { source, .. } |
            Error::SignalInfo { source, .. } => *source == Errno::ESRCH,
            _ => false,
        }
    }

    /// True for every way of failing to gain control over a process.
    pub fn is_attach_error(&self) -> bool {
        matches!(
            self,
            Error::Attach { .. } | Error::AttachVanished { .. } | Error::AlreadyTraced { .. }
        )
    }
}

macro_rules! internal_error {
    ($msg: literal) => {
        return Err($crate::error::Error::Internal($msg))
    };
}

pub(crate) use internal_error;
