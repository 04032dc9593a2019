//! Process handle for worker subprocesses.
//!
//! Wraps a spawned child with its private channel: stdin carries the single
//! assignment, stdout carries the report stream. The handle splits into an
//! [`AssignmentPipe`], a [`ReportStream`] and an [`ExitWatch`] so that
//! delivery, report reading and exit observation proceed independently and
//! none of them can hold up the others.

use super::protocol::{Report, WorkRequest};
use super::signals::{TerminationReason, analyze_exit_status};
use crate::error::{DispatchError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a freshly spawned worker subprocess.
pub struct Proc {
    worker: usize,
    pid: Pid,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl Proc {
    /// Create from a spawned child, taking ownership of its stdin and stdout.
    pub fn from_child(mut child: Child, worker: usize) -> Result<Self> {
        let pid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .ok_or_else(|| DispatchError::Launch {
                worker,
                message: "process exited before it could be tracked".into(),
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Channel("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Channel("child stdout not captured".into()))?;

        Ok(Self {
            worker,
            pid,
            child,
            stdin,
            stdout,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Split into independently owned delivery, report and exit halves.
    pub fn split(self) -> (AssignmentPipe, ReportStream, ExitWatch) {
        let pipe = AssignmentPipe { stdin: self.stdin };
        let stream = ReportStream {
            reader: BufReader::new(self.stdout),
            buf: Vec::new(),
        };
        let watch = ExitWatch {
            worker: self.worker,
            pid: self.pid,
            child: self.child,
        };
        (pipe, stream, watch)
    }
}

/// Writing half of a worker channel; used exactly once.
pub struct AssignmentPipe {
    stdin: ChildStdin,
}

impl AssignmentPipe {
    /// Deliver the assignment and close the worker's stdin.
    ///
    /// May wait for as long as the worker leaves its stdin unread; callers
    /// race it against the worker's exit.
    pub async fn deliver(mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line();
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DispatchError::Channel(format!("failed to send assignment: {}", e)))?;
        self.stdin
            .shutdown()
            .await
            .map_err(|e| DispatchError::Channel(format!("failed to close stdin: {}", e)))
    }
}

/// One line received from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Report(Report),
    /// A non-blank line that is not a valid report.
    Malformed { line: String, error: String },
}

impl Incoming {
    fn decode(raw: Vec<u8>) -> Self {
        match String::from_utf8(raw) {
            Ok(line) => match Report::from_line(&line) {
                Ok(report) => Self::Report(report),
                Err(e) => Self::Malformed {
                    line,
                    error: e.to_string(),
                },
            },
            Err(e) => Self::Malformed {
                error: format!("not valid UTF-8: {}", e.utf8_error()),
                line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            },
        }
    }
}

/// Reading half of a worker channel.
pub struct ReportStream {
    reader: BufReader<ChildStdout>,
    /// Bytes of the line being assembled; survives a cancelled `next`.
    buf: Vec<u8>,
}

impl ReportStream {
    /// Next message, or `None` once the worker closed its stdout.
    ///
    /// Undecodable lines come back as [`Incoming::Malformed`] and reading
    /// continues; only a failing read ends the stream with an error.
    /// Cancel-safe: dropping the future never loses a partially read line.
    pub async fn next(&mut self) -> std::io::Result<Option<Incoming>> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.buf).await?;
            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }

            let mut raw = std::mem::take(&mut self.buf);
            while matches!(raw.last(), Some(b'\n' | b'\r')) {
                raw.pop();
            }
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(Incoming::decode(raw)));
        }
    }
}

/// Exit-observing half of a worker handle.
pub struct ExitWatch {
    worker: usize,
    pid: Pid,
    child: Child,
}

/// Policy applied while waiting for a worker to exit.
#[derive(Debug, Clone)]
pub struct ExitPolicy {
    /// Wall-clock budget for the worker; `None` waits forever.
    pub deadline: Option<Duration>,
    /// Time between SIGTERM and SIGKILL when stopping a worker.
    pub kill_grace: Duration,
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    DeadlineElapsed,
    Cancelled,
}

impl ExitWatch {
    /// Wait for the process to terminate, stopping it on deadline or cancellation.
    ///
    /// Always returns once the process has been reaped.
    pub async fn wait(mut self, policy: &ExitPolicy, cancel: &CancellationToken) -> TerminationReason {
        let deadline = async {
            match policy.deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            status = self.child.wait() => WaitOutcome::Exited(status),
            _ = deadline => WaitOutcome::DeadlineElapsed,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        match outcome {
            WaitOutcome::Exited(Ok(status)) => analyze_exit_status(status),
            WaitOutcome::Exited(Err(e)) => {
                warn!(worker = self.worker, pid = %self.pid, error = %e, "waitpid failed");
                TerminationReason::Unknown
            }
            WaitOutcome::DeadlineElapsed => {
                warn!(
                    worker = self.worker,
                    pid = %self.pid,
                    deadline_secs = policy.deadline.map(|d| d.as_secs_f64()),
                    "Worker exceeded its deadline, stopping it"
                );
                self.stop(policy.kill_grace).await;
                TerminationReason::TimedOut
            }
            WaitOutcome::Cancelled => {
                debug!(worker = self.worker, pid = %self.pid, "Stopping worker for cancellation");
                self.stop(policy.kill_grace).await;
                TerminationReason::Cancelled
            }
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and reap.
    async fn stop(&mut self, grace: Duration) {
        if let Err(e) = signal::kill(self.pid, Signal::SIGTERM) {
            debug!(worker = self.worker, pid = %self.pid, error = %e, "SIGTERM failed");
        }

        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return;
        }

        if let Err(e) = self.child.kill().await {
            warn!(worker = self.worker, pid = %self.pid, error = %e, "SIGKILL failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::protocol::WorkItem;
    use std::process::Stdio;
    use tokio::process::Command;

    fn sh(script: &str) -> Proc {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("Failed to spawn sh");
        Proc::from_child(child, 0).expect("Failed to create Proc")
    }

    fn policy(deadline: Option<Duration>) -> ExitPolicy {
        ExitPolicy {
            deadline,
            kill_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_assignment_reaches_worker() {
        // `head -n1` echoes the assignment line back as a (malformed) report.
        let (pipe, mut stream, watch) = sh("head -n1").split();
        pipe.deliver(&WorkRequest::assign("2026-10-19", vec!["A".into()]))
            .await
            .unwrap();

        match stream.next().await.unwrap() {
            Some(Incoming::Malformed { line, .. }) => {
                assert!(line.contains("\"sharedParameter\":\"2026-10-19\""));
            }
            other => panic!("Expected echoed assignment, got {:?}", other),
        }
        assert_eq!(stream.next().await.unwrap(), None);

        let reason = watch.wait(&policy(None), &CancellationToken::new()).await;
        assert_eq!(reason, TerminationReason::Exited(0));
    }

    #[tokio::test]
    async fn test_reports_and_blank_lines() {
        let (pipe, mut stream, _watch) = sh(r#"cat >/dev/null
echo '{"type":"item_result","success":true,"itemId":"A"}'
echo ''
echo '{"type":"chunk_summary","duration":7}'"#)
        .split();
        pipe.deliver(&WorkRequest::assign("d", vec!["A".into()]))
            .await
            .unwrap();

        assert_eq!(
            stream.next().await.unwrap(),
            Some(Incoming::Report(Report::success("A".into(), None, Vec::new())))
        );
        assert_eq!(
            stream.next().await.unwrap(),
            Some(Incoming::Report(Report::chunk_summary(7)))
        );
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reading_continues_after_invalid_utf8() {
        let (pipe, mut stream, watch) = sh(r#"cat >/dev/null
printf '\377\376\n'
echo '{"type":"item_result","success":true,"itemId":"A"}'
printf '{"type":"chunk_summary","duration":3}'"#)
        .split();
        pipe.deliver(&WorkRequest::assign("d", vec!["A".into()]))
            .await
            .unwrap();

        match stream.next().await.unwrap() {
            Some(Incoming::Malformed { line, error }) => {
                assert_eq!(line, "\u{FFFD}\u{FFFD}");
                assert!(error.contains("UTF-8"));
            }
            other => panic!("Expected undecodable line, got {:?}", other),
        }
        assert_eq!(
            stream.next().await.unwrap(),
            Some(Incoming::Report(Report::success("A".into(), None, Vec::new())))
        );
        // Final line without a trailing newline still counts.
        assert_eq!(
            stream.next().await.unwrap(),
            Some(Incoming::Report(Report::chunk_summary(3)))
        );
        assert_eq!(stream.next().await.unwrap(), None);

        let reason = watch.wait(&policy(None), &CancellationToken::new()).await;
        assert_eq!(reason, TerminationReason::Exited(0));
    }

    #[tokio::test]
    async fn test_delivery_blocks_until_worker_is_stopped() {
        // Larger than any pipe buffer, and the worker never reads it.
        let chunk: Vec<WorkItem> = (0..20_000)
            .map(|i| WorkItem::new(format!("room-{:05}", i)))
            .collect();
        let (pipe, _stream, watch) = sh("exec sleep 30").split();

        let request = WorkRequest::assign("d", chunk);
        let wait_policy = policy(Some(Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        let deliver = pipe.deliver(&request);
        let wait = watch.wait(&wait_policy, &cancel);
        let started = std::time::Instant::now();
        let (delivered, reason) = tokio::join!(deliver, wait);

        assert_eq!(reason, TerminationReason::TimedOut);
        assert!(delivered.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_status() {
        let (_pipe, _stream, watch) = sh("exit 7").split();
        let reason = watch.wait(&policy(None), &CancellationToken::new()).await;
        assert_eq!(reason, TerminationReason::Exited(7));
    }

    #[tokio::test]
    async fn test_deadline_stops_worker() {
        let (_pipe, _stream, watch) = sh("sleep 30").split();
        let reason = watch
            .wait(
                &policy(Some(Duration::from_millis(100))),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(reason, TerminationReason::TimedOut);
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_worker_is_killed() {
        let (_pipe, _stream, watch) = sh("trap '' TERM; sleep 30").split();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reason = watch.wait(&policy(None), &cancel).await;
        assert_eq!(reason, TerminationReason::Cancelled);
    }
}
