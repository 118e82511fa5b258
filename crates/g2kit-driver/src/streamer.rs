//! File streaming support
//!
//! Turns a byte stream into send-ready G-code lines: fixed-size chunk
//! reads, newline splitting with a carry for the fragment at each chunk
//! boundary, blank-line dropping, and monotonic `N` renumbering so
//! acknowledgements can be correlated back to source lines. Timed-replay
//! input keeps its own numbering and timecodes, so renumbering is off in
//! that mode.

use tokio::io::{AsyncRead, AsyncReadExt};

use g2kit_core::{DriverError, Result};

use crate::protocol::split_line_number;

/// Read granularity for file and stream sends.
pub const CHUNK_SIZE: usize = 4096;

/// Incremental splitter: bytes in, complete renumbered lines out.
#[derive(Debug)]
pub struct LineFeeder {
    carry: String,
    next_number: u64,
    renumber: bool,
}

impl LineFeeder {
    pub fn new(renumber: bool) -> Self {
        Self {
            carry: String::new(),
            next_number: 1,
            renumber,
        }
    }

    /// Feed a chunk, returning every line completed by it. The trailing
    /// fragment (no newline yet) is carried into the next call.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.carry.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.carry.find(['\r', '\n']) {
            let line = self.carry[..pos].to_string();
            self.carry.drain(..=pos);
            if let Some(prepared) = self.prepare(&line) {
                lines.push(prepared);
            }
        }
        lines
    }

    /// Flush the carried fragment at end of input.
    pub fn finish(&mut self) -> Option<String> {
        let last = std::mem::take(&mut self.carry);
        self.prepare(&last)
    }

    fn prepare(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !self.renumber {
            return Some(line.to_string());
        }
        // Replace any numbering the file already carries with our own
        // monotonic sequence.
        let (_, body) = split_line_number(line);
        let n = self.next_number;
        self.next_number += 1;
        Some(format!("N{n} {body}"))
    }
}

/// Pulls lines on demand from an async byte source.
pub struct StreamFeeder<R> {
    reader: R,
    feeder: LineFeeder,
    eof: bool,
}

impl<R: AsyncRead + Unpin> StreamFeeder<R> {
    pub fn new(reader: R, renumber: bool) -> Self {
        Self {
            reader,
            feeder: LineFeeder::new(renumber),
            eof: false,
        }
    }

    /// Whether the source is exhausted and fully drained.
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Read chunks until at least `want` lines are available or the
    /// source ends. Returns fewer than `want` lines only at end of input.
    pub async fn next_lines(&mut self, want: usize) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut buf = [0u8; CHUNK_SIZE];
        while lines.len() < want && !self.eof {
            let n = self
                .reader
                .read(&mut buf)
                .await
                .map_err(|e| DriverError::ReadStream {
                    reason: e.to_string(),
                })?;
            if n == 0 {
                self.eof = true;
                lines.extend(self.feeder.finish());
                break;
            }
            lines.extend(self.feeder.feed(&String::from_utf8_lossy(&buf[..n])));
        }
        Ok(lines)
    }
}
