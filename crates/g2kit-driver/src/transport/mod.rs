//! Transport management
//!
//! Owns the physical channels of a session: one control channel, plus an
//! optional data channel on dual-port devices. Outbound writes are routed
//! by content inspection: JSON/control-class traffic stays on the control
//! channel, bulk G-code goes to the data channel when one exists, and
//! queue-clear commands are forced in-band onto the data channel so they
//! land behind the queued motion they are meant to clear.

pub mod serial;

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

use g2kit_core::{ChannelKind, DriverError, Result};

use crate::protocol::{is_control_class, is_queue_clear, is_realtime_only};

/// Low-level byte channel. Implementations block with a short read
/// timeout; a timeout is reported as a zero-length read, not an error.
pub trait Channel: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read available bytes; returns 0 when nothing arrived within the
    /// channel's timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Human-readable channel name (port path).
    fn name(&self) -> &str;
}

/// Shared handle to a channel, cloneable into reader tasks.
pub type SharedChannel = Arc<Mutex<Box<dyn Channel>>>;

/// Owns both channels of a session as a unit.
pub struct TransportManager {
    control: SharedChannel,
    data: Option<SharedChannel>,
}

impl TransportManager {
    /// Assemble a transport from freshly opened channels.
    pub fn new(control: Box<dyn Channel>, data: Option<Box<dyn Channel>>) -> Self {
        Self {
            control: Arc::new(Mutex::new(control)),
            data: data.map(|d| Arc::new(Mutex::new(d))),
        }
    }

    /// Whether a data channel exists.
    pub fn has_data_channel(&self) -> bool {
        self.data.is_some()
    }

    /// Handle for a reader task. The data channel should never produce
    /// protocol frames; its reader surfaces anything inbound as a
    /// diagnostic, not as protocol.
    pub fn channel(&self, kind: ChannelKind) -> Option<SharedChannel> {
        match kind {
            ChannelKind::Control => Some(self.control.clone()),
            ChannelKind::Data => self.data.clone(),
        }
    }

    /// Decide which channel carries this text.
    pub fn route(&self, text: &str) -> ChannelKind {
        if self.data.is_none() {
            return ChannelKind::Control;
        }
        if is_control_class(text) && !is_queue_clear(text) {
            ChannelKind::Control
        } else {
            ChannelKind::Data
        }
    }

    /// Write one unit of text, newline-terminating it unless it is purely
    /// real-time bytes (those are sent verbatim, immediately).
    pub fn write(&self, text: &str) -> Result<ChannelKind> {
        let payload: std::borrow::Cow<'_, str> =
            if !is_realtime_only(text) && !text.ends_with(['\r', '\n']) {
                format!("{text}\n").into()
            } else {
                text.into()
            };

        let kind = self.route(&payload);
        // route() only returns Data when the channel exists.
        let channel = match (kind, self.data.as_ref()) {
            (ChannelKind::Data, Some(data)) => data,
            _ => &self.control,
        };

        channel
            .lock()
            .write_all(payload.as_bytes())
            .map_err(|e| DriverError::Transport {
                channel: kind,
                reason: e.to_string(),
            })?;
        Ok(kind)
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("control", &self.control.lock().name())
            .field("dual_channel", &self.has_data_channel())
            .finish()
    }
}
