//! Worker subprocess spawning.
//!
//! A worker is either this binary re-executed in `worker` mode or an external
//! program speaking the same JSON-lines protocol.

use super::proc::Proc;
use crate::error::{DispatchError, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Hidden subcommand that runs the built-in worker loop.
pub const INTERNAL_WORKER_COMMAND: &str = "worker";

/// Command the built-in worker runs once per item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Which program a worker process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerProgram {
    /// Re-execute the current binary as `roomcrawl worker`.
    Internal { inspect: InspectCommand },
    /// Any executable that reads one assignment on stdin and writes reports on stdout.
    External { program: PathBuf, args: Vec<String> },
}

impl WorkerProgram {
    /// Program path and full argument vector for one launch.
    fn command_line(&self) -> Result<(PathBuf, Vec<OsString>)> {
        match self {
            Self::Internal { inspect } => {
                let exe = std::env::current_exe().map_err(|e| {
                    DispatchError::Config(format!("cannot locate current executable: {}", e))
                })?;
                let mut args: Vec<OsString> = vec![
                    INTERNAL_WORKER_COMMAND.into(),
                    "--inspect-cmd".into(),
                    inspect.program.clone().into(),
                ];
                for arg in &inspect.args {
                    // `=` keeps values that start with '-' from being read as flags.
                    args.push(format!("--inspect-arg={}", arg).into());
                }
                Ok((exe, args))
            }
            Self::External { program, args } => {
                Ok((program.clone(), args.iter().map(OsString::from).collect()))
            }
        }
    }

    /// Human-readable program name for logs.
    pub fn display_name(&self) -> String {
        match self {
            Self::Internal { inspect } => format!("built-in worker ({})", inspect.program),
            Self::External { program, .. } => program.display().to_string(),
        }
    }
}

/// Spawn one worker subprocess with piped stdin/stdout.
///
/// The worker's stderr is inherited so its diagnostics land next to ours.
/// The child is killed if its handle is dropped before it is reaped.
pub fn spawn_worker(program: &WorkerProgram, worker: usize) -> Result<Proc> {
    let (exe, args) = program.command_line()?;

    let mut cmd = Command::new(&exe);
    cmd.args(&args)
        .env("ROOMCRAWL_WORKER_INDEX", worker.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| DispatchError::Launch {
        worker,
        message: format!("{}: {}", exe.display(), e),
    })?;

    Proc::from_child(child, worker)
}
