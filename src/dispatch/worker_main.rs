//! Built-in worker subprocess.
//!
//! This module runs when `roomcrawl worker` is invoked by the supervisor.
//! It reads one assignment from stdin, inspects each item with an external
//! command and writes one report per item, then a chunk summary, to stdout.

use super::ipc::{LineReader, LineWriter};
use super::protocol::{Report, WorkItem, WorkRequest};
use super::signals::analyze_exit_status;
use super::spawn::InspectCommand;
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Exit code when no usable assignment arrived.
pub const EXIT_NO_ASSIGNMENT: i32 = 2;

/// Inspects a single item for the shared parameter.
pub trait Inspector {
    fn inspect(&mut self, item: &WorkItem, shared_parameter: &str) -> Report;
}

/// Runs `<program> <args...> <item> <shared_parameter>` once per item.
pub struct CommandInspector {
    command: InspectCommand,
}

/// Structured stdout of an inspect command.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InspectOutput {
    room_id: Option<String>,
    #[serde(default)]
    slots: Vec<String>,
}

impl CommandInspector {
    pub fn new(command: InspectCommand) -> Self {
        Self { command }
    }
}

impl Inspector for CommandInspector {
    fn inspect(&mut self, item: &WorkItem, shared_parameter: &str) -> Report {
        let output = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg(item.as_str())
            .arg(shared_parameter)
            .stdin(Stdio::null())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Report::failure(
                    item.clone(),
                    None,
                    format!("failed to run {}: {}", self.command.program, e),
                );
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = match stderr.trim() {
                "" => format!("inspect command {}", analyze_exit_status(output.status)),
                trimmed => trimmed.to_string(),
            };
            return Report::failure(item.clone(), None, detail);
        }

        let (room_id, slots) = parse_inspect_stdout(&String::from_utf8_lossy(&output.stdout));
        Report::success(item.clone(), room_id, slots)
    }
}

/// Either a `{"roomId":..,"slots":[..]}` object or one slot per non-blank line.
fn parse_inspect_stdout(stdout: &str) -> (Option<String>, Vec<String>) {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        match serde_json::from_str::<InspectOutput>(trimmed) {
            Ok(parsed) => return (parsed.room_id, parsed.slots),
            Err(e) => debug!(error = %e, "Inspect output is not a result object; using lines"),
        }
    }
    let slots = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    (None, slots)
}

/// How the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every item was reported and the summary was sent.
    Completed,
    /// Stdin closed or held garbage before an assignment arrived.
    NoAssignment,
}

/// Worker main loop.
///
/// Reads one assignment, writes one report per item in chunk order, then the
/// chunk summary.
pub fn worker_loop<R, W, I>(
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    inspector: &mut I,
) -> io::Result<WorkerExit>
where
    R: Read,
    W: Write,
    I: Inspector,
{
    let line = loop {
        match reader.read_line()? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line.to_string(),
            None => {
                warn!("Stdin closed before an assignment arrived");
                return Ok(WorkerExit::NoAssignment);
            }
        }
    };

    let request = match WorkRequest::from_line(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Invalid assignment");
            return Ok(WorkerExit::NoAssignment);
        }
    };

    let WorkRequest::Assign {
        shared_parameter,
        chunk,
    } = request;
    debug!(items = chunk.len(), shared_parameter = %shared_parameter, "Assignment received");

    let started = Instant::now();
    for item in &chunk {
        let report = inspector.inspect(item, &shared_parameter);
        writer.write_line(&report.to_line())?;
    }

    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    writer.write_line(&Report::chunk_summary(elapsed).to_line())?;
    Ok(WorkerExit::Completed)
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 after a completed chunk, 2 without an assignment,
/// 1 if the report channel broke.
pub fn run_worker_main(inspect: InspectCommand) -> ! {
    // Broken pipes surface as io::Error instead of killing the process.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Stdin and stdout are the private pipe pair set up by the supervisor.
    let mut reader = LineReader::new(io::stdin().lock());
    let mut writer = LineWriter::new(io::stdout().lock());
    let mut inspector = CommandInspector::new(inspect);

    match worker_loop(&mut reader, &mut writer, &mut inspector) {
        Ok(WorkerExit::Completed) => std::process::exit(0),
        Ok(WorkerExit::NoAssignment) => std::process::exit(EXIT_NO_ASSIGNMENT),
        Err(e) => {
            error!(error = %e, "Report channel failed");
            std::process::exit(1)
        }
    }
}
