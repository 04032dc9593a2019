//! Worker launcher and supervisor.
//!
//! Launches one worker process per chunk without waiting on any of them,
//! then multiplexes every worker's report channel and exit notification into
//! a single aggregation loop running on the caller's task. The run completes
//! only when every handle is `Exited` or `LaunchFailed`.

use super::aggregator::{Aggregator, HandleState, WorkerEvent, WorkerHandle};
use super::partition::{DEFAULT_CHUNK_CAPACITY, partition};
use super::proc::{AssignmentPipe, ExitPolicy, Proc, ReportStream};
use super::protocol::{WorkItem, WorkRequest};
use super::record::RecordSink;
use super::signals::TerminationReason;
use super::spawn::{WorkerProgram, spawn_worker};
use crate::error::{DispatchError, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Default time a channel may stay open after its process exited.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Configuration for one dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum items per worker.
    pub chunk_capacity: usize,
    /// Value passed unchanged to every worker.
    pub shared_parameter: String,
    /// Program each worker runs.
    pub program: WorkerProgram,
    /// Per-worker wall-clock budget; `None` waits indefinitely.
    pub deadline: Option<Duration>,
    pub kill_grace: Duration,
    pub drain_grace: Duration,
}

impl DispatchConfig {
    pub fn new(shared_parameter: impl Into<String>, program: WorkerProgram) -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            shared_parameter: shared_parameter.into(),
            program,
            deadline: None,
            kill_grace: DEFAULT_KILL_GRACE,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Reject settings that would make the run meaningless before anything starts.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_capacity == 0 {
            return Err(DispatchError::Config(
                "chunk capacity must be a positive integer".into(),
            ));
        }
        if self.shared_parameter.trim().is_empty() {
            return Err(DispatchError::Config(
                "shared parameter must not be empty".into(),
            ));
        }
        if let WorkerProgram::Internal { inspect } = &self.program
            && inspect.program.trim().is_empty()
        {
            return Err(DispatchError::Config(
                "the built-in worker needs an inspect command".into(),
            ));
        }
        if self.deadline == Some(Duration::ZERO) {
            return Err(DispatchError::Config(
                "worker deadline must be longer than zero".into(),
            ));
        }
        Ok(())
    }

    fn exit_policy(&self) -> ExitPolicy {
        ExitPolicy {
            deadline: self.deadline,
            kill_grace: self.kill_grace,
        }
    }
}

/// Final state of one worker, kept after its handle is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub index: usize,
    pub pid: Option<i32>,
    pub items: usize,
    pub reports: usize,
    pub chunk_duration_ms: Option<u64>,
    pub state: HandleState,
    pub exit: Option<TerminationReason>,
}

/// What happened during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub chunks: usize,
    pub launched: usize,
    pub launch_failures: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    pub chunk_summaries: usize,
    pub clean_exits: usize,
    pub unclean_exits: usize,
    /// Workers stopped by the orchestrator (deadline or cancellation).
    pub stopped: usize,
    /// Handles that never reached a terminal state (aggregation aborted).
    pub incomplete: usize,
    pub records: usize,
    pub failure_records: usize,
    pub workers: Vec<WorkerOutcome>,
}

impl RunSummary {
    fn from_handles(handles: Vec<WorkerHandle>, records: usize, failure_records: usize) -> Self {
        let mut summary = Self {
            chunks: handles.len(),
            records,
            failure_records,
            ..Self::default()
        };

        for handle in handles {
            match handle.state() {
                HandleState::LaunchFailed => summary.launch_failures += 1,
                HandleState::Exited => {
                    summary.launched += 1;
                    match handle.exit() {
                        Some(reason) if reason.is_success() => summary.clean_exits += 1,
                        Some(reason) if reason.is_forced() => {
                            summary.unclean_exits += 1;
                            summary.stopped += 1;
                        }
                        _ => summary.unclean_exits += 1,
                    }
                }
                _ => {
                    summary.launched += 1;
                    summary.incomplete += 1;
                }
            }
            summary.items_succeeded += handle.items_succeeded();
            summary.items_failed += handle.items_failed();
            if handle.chunk_summary_ms().is_some() {
                summary.chunk_summaries += 1;
            }
            summary.workers.push(WorkerOutcome {
                index: handle.index(),
                pid: handle.pid(),
                items: handle.chunk().len(),
                reports: handle.reports_received(),
                chunk_duration_ms: handle.chunk_summary_ms(),
                state: handle.state(),
                exit: handle.exit(),
            });
        }
        summary
    }

    fn log(&self) {
        for outcome in &self.workers {
            debug!(
                worker = outcome.index,
                pid = outcome.pid,
                items = outcome.items,
                reports = outcome.reports,
                chunk_duration_ms = outcome.chunk_duration_ms,
                state = ?outcome.state,
                exit = outcome.exit.map(|r| r.description()),
                "Worker outcome"
            );
        }
        info!(
            chunks = self.chunks,
            launched = self.launched,
            launch_failures = self.launch_failures,
            items_succeeded = self.items_succeeded,
            items_failed = self.items_failed,
            chunk_summaries = self.chunk_summaries,
            clean_exits = self.clean_exits,
            unclean_exits = self.unclean_exits,
            stopped = self.stopped,
            records = self.records,
            failure_records = self.failure_records,
            "Run complete"
        );
    }

    /// Every chunk's worker started, finished and exited with status 0.
    pub fn is_success(&self) -> bool {
        self.launch_failures == 0 && self.unclean_exits == 0 && self.incomplete == 0
    }

    /// Process exit code for the orchestrator itself.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// Launches workers for every chunk and supervises them to completion.
pub struct Supervisor {
    config: DispatchConfig,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops every running worker when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Partition `items`, run one worker per chunk, and log every report and exit to `sink`.
    ///
    /// Resolves once every worker has closed its channel and been reaped.
    pub async fn run<S: RecordSink>(&self, items: &[WorkItem], sink: S) -> Result<RunSummary> {
        self.run_with_launcher(items, sink, spawn_worker).await
    }

    #[instrument(
        level = "info",
        name = "dispatch",
        skip_all,
        fields(items = items.len(), capacity = self.config.chunk_capacity)
    )]
    async fn run_with_launcher<S, L>(
        &self,
        items: &[WorkItem],
        sink: S,
        launch: L,
    ) -> Result<RunSummary>
    where
        S: RecordSink,
        L: Fn(&WorkerProgram, usize) -> Result<Proc>,
    {
        let chunks = partition(items, self.config.chunk_capacity)?;
        if chunks.is_empty() {
            info!("No work items; nothing to launch");
            return Ok(RunSummary::default());
        }

        info!(
            workers = chunks.len(),
            program = %self.config.program.display_name(),
            shared_parameter = %self.config.shared_parameter,
            "Launching workers"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut aggregator = Aggregator::new(sink);
        let mut tasks = JoinSet::new();
        let mut handles = Vec::with_capacity(chunks.len());
        let mut pending = 0usize;

        for (index, chunk) in chunks.into_iter().enumerate() {
            debug_assert!(!chunk.is_empty());
            let mut handle = WorkerHandle::new(index, chunk);
            match launch(&self.config.program, index) {
                Ok(proc) => {
                    handle.mark_running(proc.pid().as_raw());
                    debug!(
                        worker = index,
                        pid = %proc.pid(),
                        items = handle.chunk().len(),
                        "Worker launched"
                    );
                    let request = WorkRequest::assign(
                        self.config.shared_parameter.clone(),
                        handle.chunk().items().to_vec(),
                    );
                    tasks.spawn(supervise_worker(
                        index,
                        proc,
                        request,
                        self.config.exit_policy(),
                        self.config.drain_grace,
                        self.cancel.clone(),
                        tx.clone(),
                    ));
                    pending += 1;
                }
                Err(e) => {
                    error!(worker = index, error = %e, "Worker failed to launch");
                    aggregator.launch_failed(&mut handle, &e.to_string());
                }
            }
            handles.push(handle);
        }
        drop(tx);

        while pending > 0 {
            let Some(event) = rx.recv().await else {
                break;
            };
            let Some(handle) = handles.get_mut(event.worker()) else {
                warn!(worker = event.worker(), "Event for unknown worker");
                continue;
            };
            aggregator.apply(handle, event);
            if handle.state().is_terminal() {
                pending -= 1;
                debug!(worker = handle.index(), remaining = pending, "Worker complete");
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker supervision task failed");
            }
        }

        let summary = RunSummary::from_handles(
            handles,
            aggregator.records_emitted(),
            aggregator.failures_emitted(),
        );
        if summary.incomplete > 0 {
            error!(
                incomplete = summary.incomplete,
                "Supervision ended before every worker was reaped"
            );
        }
        summary.log();
        Ok(summary)
    }
}

/// Drive one worker: deliver its assignment, read reports and await exit concurrently.
///
/// The deadline and cancellation apply from launch on, including while the
/// assignment is still being written. Per worker the events arrive as
/// messages, then `ChannelClosed`, then `Exited`.
async fn supervise_worker(
    worker: usize,
    proc: Proc,
    request: WorkRequest,
    policy: ExitPolicy,
    drain_grace: Duration,
    cancel: CancellationToken,
    events: EventSender,
) {
    let (pipe, stream, watch) = proc.split();
    let exited = CancellationToken::new();

    let deliver = deliver_assignment(worker, pipe, &request, &exited, &events);
    let wait = async {
        let reason = watch.wait(&policy, &cancel).await;
        exited.cancel();
        reason
    };
    let read = forward_reports(worker, stream, &exited, drain_grace, &events);

    let ((), reason, ()) = tokio::join!(deliver, wait, read);
    let _ = events.send(WorkerEvent::Exited { worker, reason });
}

/// Write the assignment, giving up once the process is gone.
async fn deliver_assignment(
    worker: usize,
    pipe: AssignmentPipe,
    request: &WorkRequest,
    exited: &CancellationToken,
    events: &EventSender,
) {
    let error = tokio::select! {
        biased;
        delivered = pipe.deliver(request) => match delivered {
            Ok(()) => return,
            Err(e) => e.to_string(),
        },
        _ = exited.cancelled() => "worker exited before reading its assignment".to_string(),
    };
    let _ = events.send(WorkerEvent::DeliveryFailed { worker, error });
}

/// Forward every message until EOF, or until `drain_grace` after the process exited.
async fn forward_reports(
    worker: usize,
    mut stream: ReportStream,
    exited: &CancellationToken,
    drain_grace: Duration,
    events: &EventSender,
) {
    let drained = async {
        exited.cancelled().await;
        tokio::time::sleep(drain_grace).await;
    };
    tokio::pin!(drained);

    let forced = loop {
        tokio::select! {
            next = stream.next() => match next {
                Ok(Some(message)) => {
                    let _ = events.send(WorkerEvent::Message { worker, message });
                }
                Ok(None) => break false,
                Err(e) => {
                    warn!(worker, error = %e, "Reading worker channel failed");
                    break false;
                }
            },
            _ = &mut drained => break true,
        }
    };

    let _ = events.send(WorkerEvent::ChannelClosed { worker, forced });
}
