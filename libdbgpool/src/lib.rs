// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod breakpoints;
mod capture;
mod config;
mod consts;
mod duration;
mod error;
mod manager;
mod protocol;
mod session;

pub use breakpoints::BreakpointStore;
pub use capture::CaptureFiles;
pub use config::Config;
pub use error::{Error, ErrorKind, ReapReason};
pub use manager::{signals, ConnectOptions, SessionManager, SessionSummary};
pub use protocol::{Endpoint, Frame};
pub use session::{
    execution::ExecOutcome, exit::ExitKind, LaunchInfo, Session, TrapContext,
};

/// The command line arguments that dbgpool expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "The file to write logs to")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "Path of the debugger backend's unix socket")]
    pub socket: Option<String>,

    #[clap(long, action, help = "Host of a tcp debugger backend (default 127.0.0.1)")]
    pub host: Option<String>,

    #[clap(short, long, action, help = "Port of a tcp debugger backend")]
    pub port: Option<u16>,

    #[clap(long, action, help = "An explicit session id (defaults to one derived from the pid)")]
    pub session: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that dbgpool supports. Each one dials the backend,
/// performs its operation, and resumes the target before disconnecting.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Run one debugger command at the paused target's prompt")]
    Command {
        #[clap(help = "The command, e.g. 'bt' or 'break foo.rb:12'")]
        cmd: Vec<String>,
    },

    #[clap(about = "Evaluate an expression in the paused target")]
    Eval {
        #[clap(help = "The expression to evaluate")]
        expr: Vec<String>,
    },

    #[clap(about = "Resume the target and wait for the next breakpoint

If nothing is hit within the timeout the target is left running and
the disconnect path resumes it cleanly.")]
    Continue {
        #[clap(long, help = "How long to wait, e.g. '10s' (default: command_timeout)")]
        wait: Option<String>,
    },

    #[clap(about = "Pause a running target via the out-of-band pause request")]
    Pause,

    #[clap(about = "Resume the target and disconnect, deleting all breakpoints")]
    Detach,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }

    fn endpoint(&self) -> anyhow::Result<Endpoint> {
        match (&self.socket, self.port) {
            (Some(_), Some(_)) => {
                Err(anyhow!("--socket and --port are mutually exclusive"))
            }
            (Some(path), None) => Ok(Endpoint::Unix(path.into())),
            (None, Some(port)) => Ok(Endpoint::Tcp {
                host: self.host.clone().unwrap_or_else(|| String::from("127.0.0.1")),
                port,
            }),
            (None, None) => Err(anyhow!("provide --socket PATH or --port PORT")),
        }
    }
}

/// Run the dbgpool tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if args.verbose > 0 {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let res = run_subcommand(&args);
    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}

fn run_subcommand(args: &Args) -> anyhow::Result<()> {
    if args.version() {
        return Err(anyhow!("wrapper binary must handle version"));
    }

    let config = config::read_config(&args.config_file).context("reading config")?;
    let command_timeout = config.command_timeout();
    let manager = SessionManager::new(config);

    // make sure a ^C mid-operation still resumes the target
    signals::Handler::new(std::sync::Arc::clone(&manager)).spawn()?;

    let mut options = ConnectOptions::new(args.endpoint()?);
    options.session_id = args.session.clone();
    let session = manager.connect(options).context("connecting to backend")?;

    match &args.command {
        // handled above, before any connection was attempted
        Commands::Version => {}
        Commands::Command { cmd } => {
            let payload = cmd.join(" ");
            let out = session
                .send_command(&payload, command_timeout)
                .with_context(|| format!("running '{payload}'"))?;
            print!("{out}");
        }
        Commands::Eval { expr } => {
            let payload = format!("p {}", expr.join(" "));
            let out = session
                .send_command(&payload, command_timeout)
                .context("evaluating expression")?;
            print!("{out}");
        }
        Commands::Continue { wait } => {
            let wait = match wait {
                Some(src) => duration::parse(src).context("parsing --wait")?,
                None => command_timeout,
            };
            let outcome = session
                .continue_and_wait(wait, &|| false)
                .context("waiting for a breakpoint")?;
            match outcome {
                ExecOutcome::Breakpoint { output } => print!("{output}"),
                ExecOutcome::Interrupted { output } | ExecOutcome::Timeout { output } => {
                    print!("{output}");
                    eprintln!("target still running after {}s", wait.as_secs_f32());
                }
            }
        }
        Commands::Pause => {
            if session.repause(consts::HANDSHAKE_TIMEOUT).context("pausing target")? {
                println!("target paused (pid {})", session.pid());
            } else {
                eprintln!("target did not stop; it may be blocked on uninterruptible I/O");
            }
        }
        Commands::Detach => {}
    }

    manager.disconnect(None).context("disconnecting")?;
    Ok(())
}
