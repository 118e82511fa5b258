#![allow(dead_code)]

//! Scripted in-memory device for session tests.
//!
//! Implements [`Channel`] without hardware: every write is recorded per
//! channel, and when auto-ack is on the device answers like real firmware
//! does: JSON commands are echoed back wrapped in `r` with an ok footer,
//! numbered G-code lines are acknowledged with their line number, and
//! real-time bytes get no answer. All acknowledgements arrive on the
//! control channel, whichever channel carried the write.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use g2kit_driver::Channel;

/// Per-channel log of everything written.
#[derive(Clone, Default)]
pub struct PortRecord(Arc<Mutex<Vec<String>>>);

impl PortRecord {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.lock().iter().any(|w| w.contains(needle))
    }
}

/// A scripted device shared by one or two mock channels.
#[derive(Clone)]
pub struct ScriptedDevice {
    auto_ack: bool,
    inbound: Arc<Mutex<VecDeque<u8>>>,
}

impl ScriptedDevice {
    pub fn new(auto_ack: bool) -> Self {
        Self {
            auto_ack,
            inbound: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue a line for the control reader to pick up.
    pub fn push_line(&self, line: &str) {
        let mut inbound = self.inbound.lock();
        inbound.extend(line.bytes());
        inbound.push_back(b'\n');
    }

    /// Create a channel endpoint. Only the channel with `serves_inbound`
    /// hands queued bytes to its reader (the control channel of a real
    /// board; the data channel never returns protocol frames).
    pub fn make_channel(&self, name: &str, serves_inbound: bool) -> (Box<dyn Channel>, PortRecord) {
        let record = PortRecord::default();
        let port = MockPort {
            name: name.to_string(),
            auto_ack: self.auto_ack,
            serves_inbound,
            inbound: self.inbound.clone(),
            written: record.clone(),
        };
        (Box::new(port), record)
    }
}

struct MockPort {
    name: String,
    auto_ack: bool,
    serves_inbound: bool,
    inbound: Arc<Mutex<VecDeque<u8>>>,
    written: PortRecord,
}

impl Channel for MockPort {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(data).to_string();
        self.written.0.lock().push(text.clone());
        if self.auto_ack {
            if let Some(ack) = ack_for(&text) {
                let mut inbound = self.inbound.lock();
                inbound.extend(ack.bytes());
                inbound.push_back(b'\n');
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.serves_inbound {
            return Ok(0);
        }
        let mut inbound = self.inbound.lock();
        let n = buf.len().min(inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inbound.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn ack_for(text: &str) -> Option<String> {
    let line = text.trim_end();
    if line.is_empty() {
        return None;
    }
    // Real-time bytes are never acknowledged.
    if line
        .chars()
        .all(|c| matches!(c, '!' | '~' | '%' | '\u{03}' | '\u{04}'))
    {
        return None;
    }
    if line.starts_with('{') {
        let body = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(m)) => Value::Object(m),
            _ => Value::Object(Map::new()),
        };
        return Some(json!({"r": body, "f": [1, 0, line.len()]}).to_string());
    }
    // A numbered G-code line echoes its number back.
    let mut body = Map::new();
    if let Some(n) = leading_line_number(line) {
        body.insert("n".to_string(), json!(n));
    }
    Some(json!({"r": body, "f": [1, 0, line.len()]}).to_string())
}

fn leading_line_number(line: &str) -> Option<u64> {
    let rest = line.strip_prefix(['N', 'n'])?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Poll `cond` until it holds, panicking after a couple of seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
