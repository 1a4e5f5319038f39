pub mod driver;
pub mod error;
pub mod event;
pub mod monitor;
pub mod session;
pub mod unwinder;

pub use driver::{start_tracing, trace_command, TracingHandle};
pub use error::{Error, Result};
pub use event::{classify, EventSource, PendingExit, RawStatus, StopEvent, TraceEvent};
pub use monitor::{BacktracePolicy, Config, Monitor, Termination};
pub use session::{Control, Phase, Pid, Signal, TracedProcess};
pub use unwinder::{RemoteUnwinder, StackFrame, UnwindContext, Unwinder, MAX_FRAMES};
