//! Observable run records and the sinks that write them.
//!
//! Every report, launch problem and process exit becomes exactly one
//! [`LogRecord`]. Records are written by the aggregation loop only, one whole
//! line per write, so concurrent workers never interleave partial output.

use super::protocol::WorkItem;
use super::signals::TerminationReason;
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};

/// Output encoding for records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFormat {
    /// One human-readable line per record.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// One observable event of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogRecord {
    ItemSucceeded {
        worker: usize,
        item_id: WorkItem,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        slots: Vec<String>,
    },
    ItemFailed {
        worker: usize,
        item_id: WorkItem,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        error: String,
    },
    ChunkFinished {
        worker: usize,
        duration_ms: u64,
    },
    WorkerExited {
        worker: usize,
        pid: i32,
        status: ExitRecord,
    },
    LaunchFailed {
        worker: usize,
        items: usize,
        error: String,
    },
    DeliveryFailed {
        worker: usize,
        error: String,
    },
    MalformedReport {
        worker: usize,
        line: String,
        error: String,
    },
}

/// Serializable view of a [`TerminationReason`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitRecord {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<&'static str>,
    pub description: String,
    pub success: bool,
}

impl From<&TerminationReason> for ExitRecord {
    fn from(reason: &TerminationReason) -> Self {
        Self {
            kind: reason.kind(),
            code: reason.code(),
            signal: reason.signal(),
            signal_name: reason.signal_name(),
            description: reason.description(),
            success: reason.is_success(),
        }
    }
}

impl LogRecord {
    pub fn worker(&self) -> usize {
        match self {
            Self::ItemSucceeded { worker, .. }
            | Self::ItemFailed { worker, .. }
            | Self::ChunkFinished { worker, .. }
            | Self::WorkerExited { worker, .. }
            | Self::LaunchFailed { worker, .. }
            | Self::DeliveryFailed { worker, .. }
            | Self::MalformedReport { worker, .. } => *worker,
        }
    }

    /// Whether this record reports a problem rather than progress.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::ItemSucceeded { .. } | Self::ChunkFinished { .. } => false,
            Self::WorkerExited { status, .. } => !status.success,
            _ => true,
        }
    }
}

/// Worker-supplied text with every line break collapsed to a space.
struct OneLine<'a>(&'a str);

impl fmt::Display for OneLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = self
            .0
            .split(['\n', '\r'])
            .map(str::trim)
            .filter(|part| !part.is_empty());
        if let Some(first) = parts.next() {
            f.write_str(first)?;
        }
        for part in parts {
            write!(f, " {}", part)?;
        }
        Ok(())
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ItemSucceeded {
                worker,
                item_id,
                room_id,
                slots,
            } => {
                write!(
                    f,
                    "[worker {}] success: item {}",
                    worker,
                    OneLine(item_id.as_str())
                )?;
                if let Some(room) = room_id {
                    write!(f, ", room {}", OneLine(room))?;
                }
                if !slots.is_empty() {
                    write!(f, ", {} slot(s)", slots.len())?;
                }
                Ok(())
            }
            Self::ItemFailed {
                worker,
                item_id,
                room_id,
                error,
            } => {
                write!(
                    f,
                    "[worker {}] failure: item {}",
                    worker,
                    OneLine(item_id.as_str())
                )?;
                if let Some(room) = room_id {
                    write!(f, ", room {}", OneLine(room))?;
                }
                write!(f, ", error: {}", OneLine(error))
            }
            Self::ChunkFinished {
                worker,
                duration_ms,
            } => write!(
                f,
                "[worker {}] chunk finished in {} ms",
                worker, duration_ms
            ),
            Self::WorkerExited {
                worker,
                pid,
                status,
            } => write!(
                f,
                "[worker {}] process {} {}",
                worker, pid, status.description
            ),
            Self::LaunchFailed {
                worker,
                items,
                error,
            } => write!(
                f,
                "[worker {}] launch failed ({} item(s) not inspected): {}",
                worker,
                items,
                OneLine(error)
            ),
            Self::DeliveryFailed { worker, error } => write!(
                f,
                "[worker {}] assignment not delivered: {}",
                worker,
                OneLine(error)
            ),
            Self::MalformedReport {
                worker,
                line,
                error,
            } => write!(
                f,
                "[worker {}] malformed report {:?}: {}",
                worker, line, error
            ),
        }
    }
}

/// Destination for run records.
pub trait RecordSink {
    fn emit(&mut self, record: &LogRecord) -> io::Result<()>;
}

impl<T: RecordSink + ?Sized> RecordSink for &mut T {
    fn emit(&mut self, record: &LogRecord) -> io::Result<()> {
        (**self).emit(record)
    }
}

/// Writes each record as one line to any writer (stdout in the CLI).
pub struct LineSink<W: Write> {
    writer: W,
    format: RecordFormat,
    buffer: Vec<u8>,
}

impl<W: Write> LineSink<W> {
    pub fn new(writer: W, format: RecordFormat) -> Self {
        Self {
            writer,
            format,
            buffer: Vec::with_capacity(256),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for LineSink<W> {
    fn emit(&mut self, record: &LogRecord) -> io::Result<()> {
        self.buffer.clear();
        match self.format {
            RecordFormat::Plain => write!(self.buffer, "{}", record)?,
            RecordFormat::Json => serde_json::to_writer(&mut self.buffer, record)?,
        }
        self.buffer.push(b'\n');

        // One write per record keeps lines whole even on a shared descriptor.
        self.writer.write_all(&self.buffer)?;
        self.writer.flush()
    }
}

/// Keeps records in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<LogRecord>,
}

#[cfg(test)]
impl RecordSink for MemorySink {
    fn emit(&mut self, record: &LogRecord) -> io::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    fn exited(code: i32) -> LogRecord {
        LogRecord::WorkerExited {
            worker: 1,
            pid: 4242,
            status: ExitRecord::from(&TerminationReason::Exited(code)),
        }
    }

    #[test]
    fn test_plain_lines() {
        let mut sink = LineSink::new(Vec::new(), RecordFormat::Plain);
        sink.emit(&LogRecord::ItemSucceeded {
            worker: 0,
            item_id: "A".into(),
            room_id: Some("r1".into()),
            slots: vec!["10:00".into(), "11:00".into()],
        })
        .unwrap();
        sink.emit(&LogRecord::ItemFailed {
            worker: 0,
            item_id: "E".into(),
            room_id: None,
            error: "page did not load".into(),
        })
        .unwrap();
        sink.emit(&LogRecord::ChunkFinished {
            worker: 0,
            duration_ms: 1200,
        })
        .unwrap();
        sink.emit(&exited(0)).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                "[worker 0] success: item A, room r1, 2 slot(s)",
                "[worker 0] failure: item E, error: page did not load",
                "[worker 0] chunk finished in 1200 ms",
                "[worker 1] process 4242 exited with code 0",
            ]
        );
    }

    #[test]
    fn test_json_lines() {
        let mut sink = LineSink::new(Vec::new(), RecordFormat::Json);
        sink.emit(&exited(2)).unwrap();
        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(output.lines().count(), 1);

        let value: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(value["event"], "worker_exited");
        assert_eq!(value["worker"], 1);
        assert_eq!(value["status"]["code"], 2);
        assert_eq!(value["status"]["success"], false);
    }

    #[test]
    fn test_multiline_worker_text_stays_on_one_line() {
        let mut sink = LineSink::new(Vec::new(), RecordFormat::Plain);
        sink.emit(&LogRecord::ItemFailed {
            worker: 3,
            item_id: "E\n".into(),
            room_id: Some("r\r\n9".into()),
            error: "Traceback:\n  File x\r\nValueError\n".into(),
        })
        .unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            output,
            "[worker 3] failure: item E, room r 9, error: Traceback: File x ValueError\n"
        );
    }

    #[test]
    fn test_signal_exit_is_machine_readable() {
        let record = LogRecord::WorkerExited {
            worker: 0,
            pid: 77,
            status: ExitRecord::from(&TerminationReason::Signaled {
                signal: Signal::SIGKILL,
                core_dumped: false,
            }),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"]["kind"], "signaled");
        assert_eq!(value["status"]["signal"], 9);
        assert_eq!(value["status"]["signal_name"], "SIGKILL");
        assert!(value["status"].get("code").is_none());

        let value = serde_json::to_value(exited(0)).unwrap();
        assert!(value["status"].get("signal").is_none());
    }

    #[test]
    fn test_failure_classification() {
        assert!(!exited(0).is_failure());
        assert!(exited(1).is_failure());
        assert!(
            LogRecord::LaunchFailed {
                worker: 2,
                items: 5,
                error: "ENOENT".into()
            }
            .is_failure()
        );
        assert!(
            !LogRecord::ChunkFinished {
                worker: 2,
                duration_ms: 1
            }
            .is_failure()
        );
    }
}
