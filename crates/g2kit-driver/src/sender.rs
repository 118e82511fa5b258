//! Send scheduler and flow control
//!
//! Maintains the outbound line buffer and the credit counters that pace
//! transmission to what the device has acknowledged it can accept. The
//! scheduler performs no I/O itself: every operation returns the actions
//! (lines to transmit, events to emit) for the session to carry out, which
//! keeps the state machine single-writer and directly testable.
//!
//! Credit policy: in dual-channel mode every ordinary response grants one
//! line of credit. In single-channel mode a response carrying `rx` sets the
//! credit window to the device's reported receive capacity (`rx - 1`).
//! Acknowledgements of bypassed control writes are swallowed via the
//! `ignored_responses` counter so they are never mistaken for line credit.

use std::collections::VecDeque;

use crate::protocol::{checksum, is_control_class, is_realtime_only, split_line_number};

/// Credits seeded at setup completion and after a flush.
pub const RESTART_CREDITS: i64 = 5;

/// Prefetch cushion: keep this many lines buffered beyond the current
/// credit window so round-trip latency never starves the drain loop.
pub const PREFETCH_SLACK: usize = 100;

/// An action the session must carry out on the scheduler's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerOutput {
    /// Write this text to the transport (routing decides the channel).
    Transmit(String),
    /// A buffered line left the buffer; its line number, when tagged.
    SentLine(u64),
    /// The buffer is below the prefetch cushion; a producer should supply
    /// this many more lines.
    NeedLines(usize),
    /// The buffer drained: naturally (input fully read) or forcibly
    /// (flush).
    DoneSending {
        /// True when caused by `flush()`.
        forced: bool,
    },
}

/// Flow-control state machine over the outbound line buffer.
#[derive(Debug)]
pub struct SendScheduler {
    line_buffer: VecDeque<String>,
    /// Total lines the device has granted, including those already sent.
    lines_requested: i64,
    /// Lines written to the transport so far.
    lines_sent: i64,
    /// In-flight out-of-band writes whose acknowledgement must be
    /// swallowed rather than counted as credit.
    ignored_responses: u32,
    /// The input producer has been fully consumed.
    done_reading: bool,
    use_checksums: bool,
    timed_sends_only: bool,
}

impl SendScheduler {
    /// Create a scheduler with zero credits.
    pub fn new(use_checksums: bool, timed_sends_only: bool) -> Self {
        Self {
            line_buffer: VecDeque::new(),
            lines_requested: 0,
            lines_sent: 0,
            ignored_responses: 0,
            done_reading: false,
            use_checksums,
            timed_sends_only,
        }
    }

    /// Currently usable credits.
    pub fn usable_credits(&self) -> i64 {
        (self.lines_requested - self.lines_sent).max(0)
    }

    /// Lines written so far.
    pub fn lines_sent(&self) -> i64 {
        self.lines_sent
    }

    /// Total lines granted so far.
    pub fn lines_requested(&self) -> i64 {
        self.lines_requested
    }

    /// Lines waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.line_buffer.len()
    }

    /// Submit one piece of text. Control-class and real-time content
    /// bypasses the buffer and is transmitted immediately; everything else
    /// is buffered and drained under flow control.
    pub fn submit_text(&mut self, text: &str) -> Vec<SchedulerOutput> {
        let mut out = Vec::new();
        if is_control_class(text) || is_realtime_only(text) {
            self.bypass(text, &mut out);
        } else {
            self.line_buffer.push_back(text.to_string());
        }
        self.drain(&mut out);
        out
    }

    /// Submit a batch of lines (buffered; one drain pass at the end).
    pub fn submit_lines<I, S>(&mut self, lines: I) -> Vec<SchedulerOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for line in lines {
            self.line_buffer.push_back(line.into());
        }
        self.drain(&mut out);
        out
    }

    /// Submit serialized non-text content (a JSON command). Always
    /// bypasses the buffer and is accounted as an out-of-band write.
    pub fn submit_control(&mut self, text: &str) -> Vec<SchedulerOutput> {
        let mut out = Vec::new();
        self.bypass(text, &mut out);
        self.drain(&mut out);
        out
    }

    /// Credit accounting for one `response` event. `rx` is the device's
    /// receive-buffer capacity when the response carried one;
    /// `single_channel` is true when no data channel exists.
    pub fn on_response(&mut self, rx: Option<u64>, single_channel: bool) -> Vec<SchedulerOutput> {
        let mut out = Vec::new();
        match rx {
            Some(rx) if single_channel => {
                // The rx report answers an out-of-band query; consume the
                // pairing and take the device's absolute capacity. -1 is
                // legal: it means wait out two in-flight lines.
                self.ignored_responses = self.ignored_responses.saturating_sub(1);
                if !self.timed_sends_only {
                    self.lines_requested = rx as i64 - 1;
                    tracing::debug!("rx capacity report: credit window now {}", self.lines_requested);
                }
            }
            _ => {
                if self.ignored_responses > 0 {
                    // Acknowledgement of a bypassed control write.
                    self.ignored_responses -= 1;
                    return out;
                }
                if !self.timed_sends_only {
                    self.lines_requested += 1;
                }
            }
        }
        self.drain(&mut out);
        out
    }

    /// Grant extra credits directly (setup seeding and timed-replay
    /// timers).
    pub fn grant_credits(&mut self, n: i64) -> Vec<SchedulerOutput> {
        let mut out = Vec::new();
        self.lines_requested += n;
        self.drain(&mut out);
        out
    }

    /// Mark the input producer exhausted (or reset it for the next send).
    pub fn set_done_reading(&mut self, done: bool) -> Vec<SchedulerOutput> {
        self.done_reading = done;
        let mut out = Vec::new();
        if done {
            self.drain(&mut out);
        }
        out
    }

    /// Whether the producer has been marked exhausted.
    pub fn done_reading(&self) -> bool {
        self.done_reading
    }

    /// Discard all unsent buffered content, signal a forced stop, and
    /// reset the credit window for a restart. The abort byte and alarm
    /// clear go straight to the transport, bypassing the (now empty)
    /// buffer.
    pub fn flush(&mut self) -> Vec<SchedulerOutput> {
        let discarded = self.line_buffer.len();
        tracing::debug!("flush: discarding {} buffered lines", discarded);
        self.line_buffer.clear();
        self.lines_requested = RESTART_CREDITS;
        self.lines_sent = 0;
        vec![
            SchedulerOutput::DoneSending { forced: true },
            SchedulerOutput::Transmit("\u{04}".to_string()),
            SchedulerOutput::Transmit("{clr:n}".to_string()),
        ]
    }

    /// Clear everything at session close.
    pub fn reset(&mut self) {
        self.line_buffer.clear();
        self.lines_requested = 0;
        self.lines_sent = 0;
        self.ignored_responses = 0;
        self.done_reading = false;
    }

    fn bypass(&mut self, text: &str, out: &mut Vec<SchedulerOutput>) {
        // Single real-time bytes get no acknowledgement, so only body-
        // carrying control writes are added to the ignore count.
        if !is_realtime_only(text) {
            self.ignored_responses += 1;
        }
        out.push(SchedulerOutput::Transmit(text.to_string()));
    }

    /// The only place lines leave the buffer: strict FIFO, gated on the
    /// credit window.
    fn drain(&mut self, out: &mut Vec<SchedulerOutput>) {
        let mut last_line = None;
        while self.lines_requested - self.lines_sent > 0 {
            let Some(line) = self.line_buffer.pop_front() else {
                break;
            };
            if let (Some(n), _) = split_line_number(&line) {
                last_line = Some(n);
            }
            let framed = if self.use_checksums {
                checksum::frame_with_checksum(line.trim_end_matches(['\r', '\n']))
            } else {
                line
            };
            out.push(SchedulerOutput::Transmit(framed));
            self.lines_sent += 1;
        }
        if let Some(n) = last_line {
            out.push(SchedulerOutput::SentLine(n));
        }

        if self.done_reading {
            if self.line_buffer.is_empty() {
                out.push(SchedulerOutput::DoneSending { forced: false });
            }
        } else {
            let target = self.usable_credits() as usize + PREFETCH_SLACK;
            if self.line_buffer.len() < target {
                out.push(SchedulerOutput::NeedLines(target - self.line_buffer.len()));
            }
        }
    }
}
