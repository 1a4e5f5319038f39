use std::io;
use std::process::{self, Command};

use structopt::{clap::AppSettings, StructOpt};
use tracemon::{trace_command, BacktracePolicy, Config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;


/// Run a program under ptrace and print a backtrace when it exits.
#[derive(Debug, StructOpt)]
#[structopt(name = "monitor", setting = AppSettings::TrailingVarArg)]
struct Opt {
    /// Also print a backtrace at every signal stop.
    #[structopt(long)]
    backtrace_on_signal: bool,

    /// Suppress signals instead of delivering them when resuming the program.
    #[structopt(long)]
    no_forward_signals: bool,

    /// Program to trace.
    program: Option<String>,

    /// Arguments passed to the program.
    #[structopt(allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let opt = Opt::from_args();

    let program = match opt.program {
        Some(program) => program,
        None => {
            let _ = Opt::clap().print_help();
            println!();
            return;
        },
    };

    let backtrace = if opt.backtrace_on_signal {
        BacktracePolicy::OnSignal
    } else {
        BacktracePolicy::OnExit
    };
    let config = Config::new()
        .set_backtrace(backtrace)
        .set_forward_signals(!opt.no_forward_signals);

    let mut cmd = Command::new(&program);
    cmd.args(&opt.args);

    // The tracee's own exit status is reported on stdout, not propagated as ours.
    match trace_command(cmd, config, io::stdout()) {
        Ok(termination) => info!(?termination, "done"),
        Err(err) => {
            let source = std::error::Error::source(&err).map(ToString::to_string);
            error!(%err, ?source, "tracing {} failed", program);
            process::exit(1);
        },
    }
}
