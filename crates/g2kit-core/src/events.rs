//! Driver event hub
//!
//! Per-session event distribution: a broadcast channel for async consumers
//! plus synchronous handlers registered under a [`SubscriptionId`].
//! Per-operation listeners (`get`/`set`/file sends) take a scoped
//! `broadcast::Receiver` that is dropped on every exit path, so there is no
//! manual add/remove pairing to get wrong.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::DriverError;
use crate::status::Footer;

/// Which physical channel a write or read touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Primary channel: JSON requests/responses and real-time commands.
    Control,
    /// Optional secondary channel: bulk G-code traffic only.
    Data,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// Events emitted by a driver session.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Channels are open; traffic may flow.
    Open,
    /// The connection banner (first response after open) was received.
    Connected(Value),
    /// The post-open handshake finished and credits were seeded.
    SetupDone,
    /// The session closed; emitted exactly once per open.
    Close,
    /// An error surfaced from an I/O completion path or the device.
    Error(DriverError),
    /// A raw decoded line, before classification.
    Data(String),
    /// A response envelope: the unwrapped `r` body and its footer.
    Response {
        /// Echo of the request, keyed by the field names sent.
        body: Value,
        /// The status footer, when present.
        footer: Option<Footer>,
    },
    /// A sparse status delta was merged into the machine status.
    StatusChanged(Map<String, Value>),
    /// The device pushed an exception report (`er`).
    ErrorReport(Value),
    /// The device echoed a G-code line (`gc`).
    GcodeReceived(Value),
    /// The device reported its receive-buffer capacity (`rx`).
    RxReceived(u64),
    /// The send buffer is running low; a producer should enqueue this many
    /// more lines.
    NeedLines(usize),
    /// The send buffer drained. `forced` distinguishes a flush from natural
    /// end-of-input completion.
    DoneSending {
        /// True when the drain was caused by `flush()`.
        forced: bool,
    },
    /// A buffered line left for the wire; carries its line number.
    SentLine(u64),
    /// Raw bytes were written, tagged with the channel that carried them.
    SentRaw {
        /// The exact text written.
        data: String,
        /// The channel it was routed to.
        channel: ChannelKind,
    },
}

/// Coarse event grouping for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Open/close/setup lifecycle.
    Connection,
    /// Decoded frames, responses, and errors.
    Protocol,
    /// Machine status telemetry.
    Status,
    /// Send-buffer flow control.
    Flow,
}

impl DriverEvent {
    /// The category this event belongs to.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Open | Self::Connected(_) | Self::SetupDone | Self::Close => {
                EventCategory::Connection
            }
            Self::Error(_)
            | Self::Data(_)
            | Self::Response { .. }
            | Self::ErrorReport(_)
            | Self::GcodeReceived(_) => EventCategory::Protocol,
            Self::StatusChanged(_) => EventCategory::Status,
            Self::RxReceived(_)
            | Self::NeedLines(_)
            | Self::DoneSending { .. }
            | Self::SentLine(_)
            | Self::SentRaw { .. } => EventCategory::Flow,
        }
    }
}

/// Subscription handle for unsubscribing a synchronous handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

/// Filter to receive only specific event categories.
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events matching any of these categories.
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    /// Check whether an event matches this filter.
    pub fn matches(&self, event: &DriverEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

type EventHandler = Box<dyn Fn(DriverEvent) + Send + Sync>;

/// Per-session event hub.
///
/// Handlers run synchronously on the emitting context and must return
/// quickly; async consumers should take a [`EventHub::receiver`] instead.
pub struct EventHub {
    sender: broadcast::Sender<DriverEvent>,
    handlers: Arc<RwLock<HashMap<SubscriptionId, (EventFilter, EventHandler)>>>,
}

impl EventHub {
    /// Create a hub with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a hub with an explicit broadcast capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Emit an event to every subscriber. Lagging or absent receivers are
    /// not an error: events are advisory fan-out, never load-bearing state.
    pub fn emit(&self, event: DriverEvent) {
        let handlers = self.handlers.read();
        for (filter, handler) in handlers.values() {
            if filter.matches(&event) {
                handler(event.clone());
            }
        }
        let _ = self.sender.send(event);
    }

    /// Register a synchronous handler.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(DriverEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.handlers.write().insert(id, (filter, Box::new(handler)));
        tracing::debug!("subscription {} added", id);
        id
    }

    /// Remove a synchronous handler. Returns true if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.handlers.write().remove(&id).is_some();
        if removed {
            tracing::debug!("subscription {} removed", id);
        }
        removed
    }

    /// Take a scoped receiver for async consumption. Dropping the receiver
    /// is the unsubscribe.
    pub fn receiver(&self) -> broadcast::Receiver<DriverEvent> {
        self.sender.subscribe()
    }

    /// Number of registered synchronous handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
