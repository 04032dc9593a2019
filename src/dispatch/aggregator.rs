//! Report aggregation and per-worker bookkeeping.
//!
//! Worker I/O tasks never write output themselves. They forward
//! [`WorkerEvent`]s to the single aggregation loop, which turns each event
//! into at most one [`LogRecord`] and advances the matching [`WorkerHandle`].

use super::partition::Chunk;
use super::proc::Incoming;
use super::protocol::Report;
use super::record::{ExitRecord, LogRecord, RecordSink};
use super::signals::TerminationReason;
use std::io;
use tracing::{debug, warn};

/// Lifecycle of one worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Launching,
    Running,
    /// Channel closed, process exit not yet observed.
    ChannelClosed,
    /// Channel closed and process reaped.
    Exited,
    /// The process never started.
    LaunchFailed,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::LaunchFailed)
    }
}

/// Runtime record for one launched (or failed) worker.
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    chunk: Chunk,
    pid: Option<i32>,
    state: HandleState,
    reports_received: usize,
    items_succeeded: usize,
    items_failed: usize,
    chunk_summary_ms: Option<u64>,
    exit: Option<TerminationReason>,
}

impl WorkerHandle {
    pub fn new(index: usize, chunk: Chunk) -> Self {
        Self {
            index,
            chunk,
            pid: None,
            state: HandleState::Launching,
            reports_received: 0,
            items_succeeded: 0,
            items_failed: 0,
            chunk_summary_ms: None,
            exit: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn reports_received(&self) -> usize {
        self.reports_received
    }

    pub fn exit(&self) -> Option<TerminationReason> {
        self.exit
    }

    pub fn chunk_summary_ms(&self) -> Option<u64> {
        self.chunk_summary_ms
    }

    pub fn items_succeeded(&self) -> usize {
        self.items_succeeded
    }

    pub fn items_failed(&self) -> usize {
        self.items_failed
    }

    /// Launching → Running.
    pub fn mark_running(&mut self, pid: i32) {
        debug_assert_eq!(self.state, HandleState::Launching);
        self.pid = Some(pid);
        self.state = HandleState::Running;
    }

    /// Launching → LaunchFailed.
    pub fn mark_launch_failed(&mut self) {
        debug_assert_eq!(self.state, HandleState::Launching);
        self.state = HandleState::LaunchFailed;
    }

    fn close_channel(&mut self) {
        if self.state == HandleState::Running {
            self.state = if self.exit.is_some() {
                HandleState::Exited
            } else {
                HandleState::ChannelClosed
            };
        }
    }

    fn record_exit(&mut self, reason: TerminationReason) {
        self.exit = Some(reason);
        if self.state == HandleState::ChannelClosed {
            self.state = HandleState::Exited;
        }
    }
}

/// Event forwarded from a worker's I/O tasks to the aggregation loop.
#[derive(Debug)]
pub enum WorkerEvent {
    Message {
        worker: usize,
        message: Incoming,
    },
    DeliveryFailed {
        worker: usize,
        error: String,
    },
    ChannelClosed {
        worker: usize,
        /// The reader gave up after the drain grace instead of seeing EOF.
        forced: bool,
    },
    Exited {
        worker: usize,
        reason: TerminationReason,
    },
}

impl WorkerEvent {
    pub fn worker(&self) -> usize {
        match self {
            Self::Message { worker, .. }
            | Self::DeliveryFailed { worker, .. }
            | Self::ChannelClosed { worker, .. }
            | Self::Exited { worker, .. } => *worker,
        }
    }
}

/// Turns worker events into records.
pub struct Aggregator<S> {
    sink: S,
    records_emitted: usize,
    failures_emitted: usize,
}

impl<S: RecordSink> Aggregator<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            records_emitted: 0,
            failures_emitted: 0,
        }
    }

    pub fn records_emitted(&self) -> usize {
        self.records_emitted
    }

    /// Records that reported a problem rather than progress.
    pub fn failures_emitted(&self) -> usize {
        self.failures_emitted
    }

    #[cfg(test)]
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Record a worker that could not be started.
    pub fn launch_failed(&mut self, handle: &mut WorkerHandle, error: &str) {
        handle.mark_launch_failed();
        self.emit(&LogRecord::LaunchFailed {
            worker: handle.index,
            items: handle.chunk.len(),
            error: error.to_string(),
        });
    }

    /// Apply one event to the handle it belongs to.
    pub fn apply(&mut self, handle: &mut WorkerHandle, event: WorkerEvent) {
        debug_assert_eq!(handle.index, event.worker());
        let worker = handle.index;

        match event {
            WorkerEvent::Message {
                message: Incoming::Report(report),
                ..
            } => self.apply_report(handle, report),

            WorkerEvent::Message {
                message: Incoming::Malformed { line, error },
                ..
            } => self.emit(&LogRecord::MalformedReport {
                worker,
                line,
                error,
            }),

            WorkerEvent::DeliveryFailed { error, .. } => {
                self.emit(&LogRecord::DeliveryFailed { worker, error })
            }

            WorkerEvent::ChannelClosed { forced, .. } => {
                if forced {
                    warn!(
                        worker,
                        pid = handle.pid,
                        "Worker exited but its channel stayed open; stopped reading"
                    );
                }
                handle.close_channel();
                debug!(worker, state = ?handle.state, "Worker channel closed");
            }

            WorkerEvent::Exited { reason, .. } => {
                handle.record_exit(reason);
                self.emit(&LogRecord::WorkerExited {
                    worker,
                    pid: handle.pid.unwrap_or_default(),
                    status: ExitRecord::from(&reason),
                });
                flag_under_reporting(handle, &reason);
            }
        }
    }

    fn apply_report(&mut self, handle: &mut WorkerHandle, report: Report) {
        let worker = handle.index;
        match report {
            Report::ItemResult {
                item_id,
                room_id,
                success,
                error,
                slots,
            } => {
                handle.reports_received += 1;
                if success {
                    handle.items_succeeded += 1;
                    self.emit(&LogRecord::ItemSucceeded {
                        worker,
                        item_id,
                        room_id,
                        slots,
                    });
                } else {
                    handle.items_failed += 1;
                    self.emit(&LogRecord::ItemFailed {
                        worker,
                        item_id,
                        room_id,
                        error: error.unwrap_or_else(|| "no error detail".to_string()),
                    });
                }
            }
            Report::ChunkSummary { duration_ms } => {
                if handle.chunk_summary_ms.is_some() {
                    warn!(worker, "Worker sent more than one chunk summary");
                }
                handle.chunk_summary_ms = Some(duration_ms);
                self.emit(&LogRecord::ChunkFinished {
                    worker,
                    duration_ms,
                });
            }
        }
    }

    fn emit(&mut self, record: &LogRecord) {
        self.records_emitted += 1;
        if record.is_failure() {
            self.failures_emitted += 1;
        }
        if let Err(e) = self.sink.emit(record) {
            write_failed(record, &e);
        }
    }
}

fn write_failed(record: &LogRecord, error: &io::Error) {
    // The record still reaches the diagnostic log.
    warn!(record = %record, error = %error, "Failed to write run record");
}

/// Exit status is authoritative; missing reports are only diagnostics.
fn flag_under_reporting(handle: &WorkerHandle, reason: &TerminationReason) {
    if !reason.is_success() {
        return;
    }
    if handle.chunk_summary_ms.is_none() {
        warn!(
            worker = handle.index,
            "Worker exited cleanly without sending a chunk summary"
        );
    }
    if handle.reports_received < handle.chunk.len() {
        warn!(
            worker = handle.index,
            expected = handle.chunk.len(),
            received = handle.reports_received,
            "Worker exited cleanly but reported fewer items than assigned"
        );
    }
}
