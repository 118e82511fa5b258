//! Frame decoder
//!
//! Splits the raw byte stream from a channel into discrete protocol units:
//! bare text lines or parsed JSON objects. The decoder keeps a carry-over
//! buffer for the trailing undelimited fragment, so emitted units are
//! invariant to where chunk boundaries fall.

use serde_json::Value;

/// A single decoded protocol unit.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedUnit {
    /// A bare non-JSON line.
    Text(String),
    /// A parsed JSON object.
    Json(Value),
    /// A line that looked like JSON but failed to parse. Recoverable:
    /// subsequent units keep flowing.
    Invalid {
        /// The offending line.
        text: String,
        /// The parser's complaint.
        reason: String,
    },
}

/// Stream decoder with carry-over buffering.
///
/// One decoder per channel; units are produced in receive order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: String,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of received bytes; returns every complete unit it
    /// delimits. Invalid UTF-8 bytes are replaced rather than dropped so a
    /// corrupt frame still surfaces for diagnosis.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedUnit> {
        self.feed_str(&String::from_utf8_lossy(chunk))
    }

    /// Feed already-decoded text.
    pub fn feed_str(&mut self, chunk: &str) -> Vec<DecodedUnit> {
        self.carry.push_str(chunk);

        let mut units = Vec::new();
        // Split on runs of \r / \n; the final fragment may still be
        // incomplete and becomes the new carry buffer.
        let mut parts: Vec<&str> = self.carry.split(['\r', '\n']).collect();
        let rest = parts.pop().unwrap_or("").to_string();

        for part in parts {
            if let Some(unit) = Self::decode_line(part) {
                units.push(unit);
            }
        }

        self.carry = rest;
        units
    }

    /// Any buffered trailing fragment not yet terminated by a delimiter.
    pub fn pending(&self) -> &str {
        &self.carry
    }

    /// Drop any buffered fragment (channel teardown).
    pub fn reset(&mut self) {
        self.carry.clear();
    }

    fn decode_line(part: &str) -> Option<DecodedUnit> {
        if part.chars().all(char::is_whitespace) {
            return None;
        }

        // Stray XON/XOFF bytes sometimes survive the serial layer.
        let line: String = part.chars().filter(|c| *c != '\u{11}' && *c != '\u{13}').collect();
        if line.chars().all(char::is_whitespace) {
            return None;
        }

        if line.trim_start().starts_with('{') {
            match serde_json::from_str::<Value>(&line) {
                Ok(value) => Some(DecodedUnit::Json(value)),
                Err(err) => {
                    tracing::debug!("unparseable frame {:?}: {}", line, err);
                    Some(DecodedUnit::Invalid {
                        text: line,
                        reason: err.to_string(),
                    })
                }
            }
        } else {
            Some(DecodedUnit::Text(line))
        }
    }
}
