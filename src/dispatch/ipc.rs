//! Blocking line channel used on the worker side of a pipe.
//!
//! The worker process talks to the orchestrator over its own stdin/stdout,
//! one JSON message per line. Interrupted reads and writes are retried by the
//! buffered std readers, so a signal never tears a message in half.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

/// Default buffer size for the stdio pipes (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered reader yielding one message line at a time.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            line: String::with_capacity(4096),
        }
    }

    /// Next line without its terminator, or `None` at EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let trimmed = self.line.trim_end_matches(['\n', '\r']).len();
        self.line.truncate(trimmed);
        Ok(Some(&self.line))
    }
}

/// Buffered writer that emits whole lines and flushes each one.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write `line`, appending a newline if missing, and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}
