//! Session orchestration
//!
//! [`G2Core`] is the driver facade: it owns the transport, the frame
//! decoder, the classifier, and the send scheduler behind one mutex, and
//! fans protocol events out through an [`EventHub`]. Reader tasks and
//! timed-send timers are the only background work; every state mutation
//! funnels through the session lock, so credit updates and enqueues never
//! interleave mid-operation.
//!
//! Lifecycle: `open` brings up the control channel, then the data channel
//! when configured, then waits for the device's connection banner and runs
//! the setup handshake (status poke, alarm clear, verbosity) before seeding
//! the first credits. `close` is idempotent unconditional teardown.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use g2kit_core::{
    ChannelKind, DriverError, DriverEvent, EventFilter, EventHub, MachineStatus, Result,
    SubscriptionId,
};

use crate::protocol::{Classified, DecodedUnit, FrameDecoder, ResponseClassifier};
use crate::sender::{SchedulerOutput, SendScheduler, PREFETCH_SLACK, RESTART_CREDITS};
use crate::streamer::StreamFeeder;
use crate::transport::serial::{
    CandidateDevice, DeviceLister, SerialChannel, SerialDeviceLister, SerialOptions,
};
use crate::transport::{Channel, SharedChannel, TransportManager};

/// How often reader tasks poll an idle channel.
const READ_POLL: Duration = Duration::from_millis(10);

/// Options recognized at `open`.
#[derive(Debug, Clone)]
pub struct G2CoreOptions {
    /// Baud rate for both channels.
    pub baud_rate: u32,
    /// Path of the secondary bulk-G-code channel, when the board has one.
    pub data_port_path: Option<String>,
    /// Timed-replay mode: credits come from recorded timecodes, not from
    /// device acknowledgements.
    pub timed_sends_only: bool,
    /// Append `;*<xor>` integrity trailers to buffered lines.
    pub use_checksums: bool,
    /// Skip the setup handshake after the connection banner.
    pub dont_setup: bool,
}

impl Default for G2CoreOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_port_path: None,
            timed_sends_only: false,
            use_checksums: false,
            dont_setup: false,
        }
    }
}

/// What `write` accepts: a single line, a batch, or a JSON command.
#[derive(Debug, Clone)]
pub enum WritePayload {
    /// One line of G-code or a control string.
    Line(String),
    /// A batch of lines, buffered together.
    Lines(Vec<String>),
    /// A JSON command object; always bypasses the line buffer.
    Command(Value),
}

impl From<&str> for WritePayload {
    fn from(s: &str) -> Self {
        Self::Line(s.to_string())
    }
}

impl From<String> for WritePayload {
    fn from(s: String) -> Self {
        Self::Line(s)
    }
}

impl From<Vec<String>> for WritePayload {
    fn from(lines: Vec<String>) -> Self {
        Self::Lines(lines)
    }
}

impl From<Value> for WritePayload {
    fn from(v: Value) -> Self {
        Self::Command(v)
    }
}

/// Pending credit grant for one timed-replay timecode. Lines recorded
/// after a timecode accrue to it until the next timecode arrives.
#[derive(Debug)]
struct TimecodeSlot {
    lines: i64,
    fired: bool,
}

struct SessionInner {
    transport: Option<TransportManager>,
    decoder: FrameDecoder,
    classifier: ResponseClassifier,
    scheduler: SendScheduler,
    timed_sends_only: bool,
    banner_seen: bool,
    setup_done: bool,
    in_hold: bool,
    readers: Vec<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    /// First timecode seen and when it was seen; replay timing is relative
    /// to this origin.
    timecode_origin: Option<(u64, Instant)>,
    previous_timecode: Arc<Mutex<TimecodeSlot>>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            transport: None,
            decoder: FrameDecoder::new(),
            classifier: ResponseClassifier::new(),
            scheduler: SendScheduler::new(false, false),
            timed_sends_only: false,
            banner_seen: false,
            setup_done: false,
            in_hold: false,
            readers: Vec::new(),
            timers: Vec::new(),
            timecode_origin: None,
            previous_timecode: Arc::new(Mutex::new(TimecodeSlot {
                lines: 0,
                fired: false,
            })),
        }
    }
}

/// A driver session for one g2core/TinyG device.
pub struct G2Core {
    inner: Arc<Mutex<SessionInner>>,
    hub: Arc<EventHub>,
    lister: Arc<dyn DeviceLister>,
}

impl Default for G2Core {
    fn default() -> Self {
        Self::new()
    }
}

impl G2Core {
    /// Create a session using serial-port device enumeration.
    pub fn new() -> Self {
        Self::with_lister(Arc::new(SerialDeviceLister))
    }

    /// Create a session with a custom device-enumeration capability.
    pub fn with_lister(lister: Arc<dyn DeviceLister>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner::new())),
            hub: Arc::new(EventHub::new()),
            lister,
        }
    }

    /// The session's event hub.
    pub fn events(&self) -> &EventHub {
        &self.hub
    }

    /// Register a synchronous event handler. See [`EventHub::subscribe`].
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(DriverEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(filter, handler)
    }

    /// Take a scoped async event receiver.
    pub fn receiver(&self) -> broadcast::Receiver<DriverEvent> {
        self.hub.receiver()
    }

    /// Whether a transport is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().transport.is_some()
    }

    /// Whether the setup handshake has completed.
    pub fn setup_done(&self) -> bool {
        self.inner.lock().setup_done
    }

    /// Whether the machine is currently in feed-hold, tracked from the
    /// `stat` transitions in status reports.
    pub fn in_hold(&self) -> bool {
        self.inner.lock().in_hold
    }

    /// Snapshot of the accumulated machine status.
    pub fn status(&self) -> MachineStatus {
        self.inner.lock().classifier.status().clone()
    }

    /// Open a serial session at `path` and run the post-open handshake.
    /// Resolves once the session is ready to accept lines.
    pub async fn open(&self, path: &str, options: G2CoreOptions) -> Result<()> {
        if self.is_open() {
            let err = DriverError::AlreadyOpen;
            self.hub.emit(DriverEvent::Error(err.clone()));
            return Err(err);
        }

        let control = SerialChannel::open(&SerialOptions {
            path: path.to_string(),
            baud_rate: options.baud_rate,
        })?;
        // Control first, then data: the board asserts the second endpoint
        // only after the first is up.
        let data = match &options.data_port_path {
            Some(data_path) => Some(Box::new(SerialChannel::open(&SerialOptions {
                path: data_path.clone(),
                baud_rate: options.baud_rate,
            })?) as Box<dyn Channel>),
            None => None,
        };

        self.open_channels(Box::new(control), data, &options).await
    }

    /// Open over already-constructed channels. This is the seam the serial
    /// path goes through and what harnesses use to drive a session without
    /// hardware.
    pub async fn open_channels(
        &self,
        control: Box<dyn Channel>,
        data: Option<Box<dyn Channel>>,
        options: &G2CoreOptions,
    ) -> Result<()> {
        // Subscribe before the readers spawn so the banner cannot be
        // emitted into nobody's queue.
        let mut rx = self.hub.receiver();
        {
            let mut inner = self.inner.lock();
            if inner.transport.is_some() {
                return Err(DriverError::AlreadyOpen);
            }
            let transport = TransportManager::new(control, data);
            let control_ch = transport.channel(ChannelKind::Control);
            let data_ch = transport.channel(ChannelKind::Data);
            inner.transport = Some(transport);
            inner.scheduler = SendScheduler::new(options.use_checksums, options.timed_sends_only);
            inner.timed_sends_only = options.timed_sends_only;
            inner.decoder.reset();
            inner.banner_seen = false;
            inner.setup_done = false;
            inner.in_hold = false;
            inner.timecode_origin = None;

            if let Some(ch) = control_ch {
                inner
                    .readers
                    .push(spawn_reader(self.inner.clone(), self.hub.clone(), ch, ChannelKind::Control));
            }
            if let Some(ch) = data_ch {
                inner
                    .readers
                    .push(spawn_reader(self.inner.clone(), self.hub.clone(), ch, ChannelKind::Data));
            }
        }
        self.hub.emit(DriverEvent::Open);

        if !options.dont_setup {
            // Poke the device so it says something.
            self.write(WritePayload::Command(single_key("sr", Value::Null)))?;
        }
        self.await_connected(&mut rx).await?;

        if !options.dont_setup {
            // Clear any alarm or stale queue state, then set JSON
            // verbosity to medium. The clear is fire-and-forget; its
            // acknowledgement is swallowed as out-of-band.
            self.write(WritePayload::Command(single_key("clr", Value::Null)))?;
            self.set("jv", Value::from(4)).await?;
        }

        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.setup_done = true;
            let outs = inner.scheduler.grant_credits(RESTART_CREDITS);
            execute_outputs(&mut inner, &mut events, outs);
        }
        self.emit_all(events);
        self.hub.emit(DriverEvent::SetupDone);
        tracing::info!("session ready");
        Ok(())
    }

    /// Enumerate candidate devices via the injected lister.
    pub async fn list(&self) -> Result<Vec<CandidateDevice>> {
        self.lister.list().await
    }

    /// Autodetect and open the first candidate device. With
    /// `fail_if_multiple`, refuses to guess between several boards.
    pub async fn open_first(&self, fail_if_multiple: bool, mut options: G2CoreOptions) -> Result<()> {
        let devices = self.list().await?;
        let Some(device) = devices.first() else {
            return Err(DriverError::NoDevicesFound);
        };
        if fail_if_multiple && devices.len() > 1 {
            return Err(DriverError::MultipleDevicesFound {
                ports: devices.iter().map(|d| d.path.clone()).collect(),
            });
        }
        if options.data_port_path.is_none() {
            options.data_port_path = device.data_port_path.clone();
        }
        let path = device.path.clone();
        self.open(&path, options).await
    }

    /// Submit content for transmission: a line, a batch of lines, or a
    /// JSON command. Buffered lines leave under flow control; transport
    /// failures surface as `Error` events, not as a return value.
    pub fn write(&self, payload: impl Into<WritePayload>) -> Result<()> {
        let payload = payload.into();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.transport.is_none() {
                return Err(DriverError::NotOpen);
            }
            match payload {
                WritePayload::Command(value) => {
                    let text = serde_json::to_string(&value)
                        .map_err(|e| DriverError::other(format!("unserializable command: {e}")))?;
                    let outs = inner.scheduler.submit_control(&text);
                    execute_outputs(&mut inner, &mut events, outs);
                }
                WritePayload::Line(line) => {
                    if inner.timed_sends_only {
                        let line = self.prepare_timed_line(&mut inner, &line);
                        let outs = inner.scheduler.submit_lines([line]);
                        execute_outputs(&mut inner, &mut events, outs);
                    } else {
                        let outs = inner.scheduler.submit_text(&line);
                        execute_outputs(&mut inner, &mut events, outs);
                    }
                }
                WritePayload::Lines(lines) => {
                    let lines: Vec<String> = if inner.timed_sends_only {
                        lines
                            .iter()
                            .map(|l| self.prepare_timed_line(&mut inner, l))
                            .collect()
                    } else {
                        lines
                    };
                    let outs = inner.scheduler.submit_lines(lines);
                    execute_outputs(&mut inner, &mut events, outs);
                }
            }
        }
        self.emit_all(events);
        Ok(())
    }

    /// Discard unsent buffered lines, abort queued motion, and reset the
    /// credit window for a restart.
    pub fn flush(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.transport.is_none() {
                return Err(DriverError::NotOpen);
            }
            let outs = inner.scheduler.flush();
            execute_outputs(&mut inner, &mut events, outs);
        }
        self.emit_all(events);
        Ok(())
    }

    /// Unconditional teardown. Idempotent; emits a single `Close` event
    /// per open. Aborts reader tasks and any in-progress file send's
    /// event scopes (their outcome is unknown, not failed).
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.transport.is_none() {
                return;
            }
            for task in inner.readers.drain(..) {
                task.abort();
            }
            for task in inner.timers.drain(..) {
                task.abort();
            }
            // Dropping the transport closes both serial ports.
            inner.transport = None;
            inner.scheduler.reset();
            inner.decoder.reset();
            inner.banner_seen = false;
            inner.setup_done = false;
            inner.in_hold = false;
            inner.timecode_origin = None;
        }
        tracing::info!("session closed");
        self.hub.emit(DriverEvent::Close);
    }

    /// Query one configuration key (`{key: null}`), resolving with the
    /// echoed value.
    pub async fn get(&self, key: &str) -> Result<Value> {
        self.set(key, Value::Null).await
    }

    /// Set one configuration key, resolving with the device's echo once a
    /// response carrying the key arrives. Rejects on any `Error` event
    /// observed while waiting.
    pub async fn set(&self, key: &str, value: Value) -> Result<Value> {
        let mut rx = self.hub.receiver();
        self.write(WritePayload::Command(single_key(key, value)))?;
        loop {
            match rx.recv().await {
                Ok(DriverEvent::Response { body, .. }) => {
                    if let Some(echo) = body.get(key) {
                        return Ok(echo.clone());
                    }
                }
                Ok(DriverEvent::Error(e)) => return Err(e),
                Ok(DriverEvent::Close) => return Err(DriverError::SessionClosed),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("set({key}) receiver lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(DriverError::SessionClosed),
            }
        }
    }

    /// Apply an ordered list of settings one at a time. A failed step is
    /// reported as an `Error` event and the sequence continues; order is
    /// explicit, never dependent on map iteration.
    pub async fn set_many<I>(&self, settings: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (key, value) in settings {
            if let Err(e) = self.set(&key, value).await {
                tracing::warn!("set {} failed: {}", key, e);
                self.hub.emit(DriverEvent::Error(e));
            }
        }
        Ok(())
    }

    /// Stream a G-code file to the device, resolving when the program has
    /// been fully sent and the machine reports it stopped or ended. A
    /// device alarm resolves with an error regardless of send progress.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = tokio::fs::File::open(path.as_ref()).await.map_err(|e| {
            let err = DriverError::ReadStream {
                reason: format!("{}: {e}", path.as_ref().display()),
            };
            self.hub.emit(DriverEvent::Error(err.clone()));
            err
        })?;
        self.send_stream(file).await
    }

    /// Stream G-code from any async byte source. See [`G2Core::send_file`].
    pub async fn send_stream<R: AsyncRead + Unpin>(&self, reader: R) -> Result<()> {
        let timed = {
            let inner = self.inner.lock();
            if inner.transport.is_none() {
                return Err(DriverError::NotOpen);
            }
            inner.timed_sends_only
        };
        let mut feeder = StreamFeeder::new(reader, !timed);
        // The receiver is scoped to this send; dropping it on any exit
        // path is the unsubscribe.
        let mut rx = self.hub.receiver();

        let result = self.drive_send(&mut feeder, &mut rx, timed).await;

        // Reset the shared done-reading flag so the next send starts
        // clean.
        self.inner.lock().scheduler.set_done_reading(false);
        result
    }

    async fn drive_send<R: AsyncRead + Unpin>(
        &self,
        feeder: &mut StreamFeeder<R>,
        rx: &mut broadcast::Receiver<DriverEvent>,
        timed: bool,
    ) -> Result<()> {
        let mut file_ended = false;
        let mut done_sending = false;
        let mut stop_or_end = false;
        let mut hold = false;

        // Prime the buffer up to the scheduler's current appetite.
        let want = {
            let inner = self.inner.lock();
            inner.scheduler.usable_credits() as usize + PREFETCH_SLACK
        };
        self.feed_lines(feeder, want, timed, &mut file_ended).await?;

        loop {
            match rx.recv().await {
                Ok(DriverEvent::NeedLines(n)) if !file_ended => {
                    self.feed_lines(feeder, n, timed, &mut file_ended).await?;
                }
                Ok(DriverEvent::DoneSending { forced: true }) => {
                    // A flush aborts the send; that is cancellation, not
                    // failure.
                    return Ok(());
                }
                Ok(DriverEvent::DoneSending { forced: false }) => {
                    if file_ended && stop_or_end {
                        return Ok(());
                    }
                    done_sending = true;
                }
                Ok(DriverEvent::StatusChanged(delta)) => {
                    let Some(stat) = delta.get("stat").and_then(Value::as_i64) else {
                        continue;
                    };
                    match stat {
                        // Alarm wins over any end-of-file sequencing.
                        2 if !timed => {
                            return Err(DriverError::Alarm {
                                raw: Value::Object(delta).to_string(),
                            });
                        }
                        3 => stop_or_end = true,
                        4 => {
                            if file_ended && done_sending {
                                return Ok(());
                            }
                            stop_or_end = true;
                        }
                        // A hold, or resuming from one, invalidates any
                        // stop/end already observed.
                        6 => {
                            hold = true;
                            stop_or_end = false;
                        }
                        5 if hold => {
                            hold = false;
                            stop_or_end = false;
                        }
                        _ => {}
                    }
                }
                Ok(DriverEvent::Close) => return Err(DriverError::SessionClosed),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("file send receiver lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(DriverError::SessionClosed),
            }
        }
    }

    async fn feed_lines<R: AsyncRead + Unpin>(
        &self,
        feeder: &mut StreamFeeder<R>,
        want: usize,
        timed: bool,
        file_ended: &mut bool,
    ) -> Result<()> {
        let lines = feeder.next_lines(want).await.map_err(|e| {
            self.hub.emit(DriverEvent::Error(e.clone()));
            e
        })?;
        if feeder.at_eof() {
            *file_ended = true;
        }
        if !lines.is_empty() {
            if timed {
                // Timed lines carry timecodes that must be parsed one at
                // a time in arrival order.
                for line in lines {
                    self.write(WritePayload::Line(line))?;
                }
            } else {
                self.write(WritePayload::Lines(lines))?;
            }
        }
        if *file_ended {
            let mut events = Vec::new();
            {
                let mut inner = self.inner.lock();
                let outs = inner.scheduler.set_done_reading(true);
                execute_outputs(&mut inner, &mut events, outs);
            }
            self.emit_all(events);
        }
        Ok(())
    }

    async fn await_connected(&self, rx: &mut broadcast::Receiver<DriverEvent>) -> Result<Value> {
        loop {
            match rx.recv().await {
                Ok(DriverEvent::Connected(banner)) => return Ok(banner),
                Ok(DriverEvent::Close) => return Err(DriverError::SessionClosed),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(DriverError::SessionClosed),
            }
        }
    }

    /// Strip a recorded timecode from a line, scheduling its credit grant
    /// relative to the replay origin, and unescape recorded control bytes.
    fn prepare_timed_line(&self, inner: &mut SessionInner, line: &str) -> String {
        let line = match parse_timecode(line) {
            Some((stripped, timecode)) => {
                self.schedule_timecode(inner, timecode);
                stripped
            }
            None => {
                // Untimed lines accrue to the most recent timecode's
                // grant.
                inner.previous_timecode.lock().lines += 1;
                line.to_string()
            }
        };
        unescape_hex(&line)
    }

    fn schedule_timecode(&self, inner: &mut SessionInner, timecode: u64) {
        let (origin_code, origin_at) = *inner
            .timecode_origin
            .get_or_insert((timecode, Instant::now()));
        let target_ms = timecode.saturating_sub(origin_code);
        let elapsed_ms = origin_at.elapsed().as_millis() as u64;
        let delay = Duration::from_millis(target_ms.saturating_sub(elapsed_ms));

        // If the previous timecode already fired, its late-accrued lines
        // roll into this grant; otherwise its own timer will cover them.
        let rolled = {
            let prev = inner.previous_timecode.lock();
            if prev.fired {
                prev.lines
            } else {
                0
            }
        };
        let slot = Arc::new(Mutex::new(TimecodeSlot {
            lines: 1 + rolled,
            fired: false,
        }));
        inner.previous_timecode = slot.clone();

        let session = self.inner.clone();
        let hub = self.hub.clone();
        // Long replays schedule one timer per timecode; drop the handles
        // of timers that already fired.
        inner.timers.retain(|t| !t.is_finished());
        inner.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut events = Vec::new();
            {
                let mut inner = session.lock();
                let grant = {
                    let mut slot = slot.lock();
                    slot.fired = true;
                    std::mem::take(&mut slot.lines)
                };
                let outs = inner.scheduler.grant_credits(grant);
                execute_outputs(&mut inner, &mut events, outs);
            }
            for event in events {
                hub.emit(event);
            }
        }));
    }

    fn emit_all(&self, events: Vec<DriverEvent>) {
        for event in events {
            self.hub.emit(event);
        }
    }
}

impl Drop for G2Core {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for task in inner.readers.drain(..) {
            task.abort();
        }
        for task in inner.timers.drain(..) {
            task.abort();
        }
    }
}

fn single_key(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// Carry out scheduler actions: transmits go to the transport while the
/// state lock is held (write order is transmission order); everything else
/// becomes an event emitted after the lock drops.
fn execute_outputs(
    inner: &mut SessionInner,
    events: &mut Vec<DriverEvent>,
    outputs: Vec<SchedulerOutput>,
) {
    for output in outputs {
        match output {
            SchedulerOutput::Transmit(text) => {
                let Some(transport) = inner.transport.as_ref() else {
                    continue;
                };
                match transport.write(&text) {
                    Ok(channel) => events.push(DriverEvent::SentRaw { data: text, channel }),
                    Err(e) => {
                        tracing::error!("transport write failed: {}", e);
                        events.push(DriverEvent::Error(e));
                    }
                }
            }
            SchedulerOutput::SentLine(n) => events.push(DriverEvent::SentLine(n)),
            SchedulerOutput::NeedLines(n) => events.push(DriverEvent::NeedLines(n)),
            SchedulerOutput::DoneSending { forced } => {
                events.push(DriverEvent::DoneSending { forced })
            }
        }
    }
}

fn spawn_reader(
    inner: Arc<Mutex<SessionInner>>,
    hub: Arc<EventHub>,
    channel: SharedChannel,
    kind: ChannelKind,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let n = {
                let mut ch = channel.lock();
                match ch.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        hub.emit(DriverEvent::Error(DriverError::Transport {
                            channel: kind,
                            reason: e.to_string(),
                        }));
                        break;
                    }
                }
            };
            if n == 0 {
                tokio::time::sleep(READ_POLL).await;
                continue;
            }
            match kind {
                ChannelKind::Control => process_inbound(&inner, &hub, &buf[..n]),
                ChannelKind::Data => {
                    // The data channel should never return protocol
                    // frames; surface whatever arrived as a diagnostic.
                    let text = String::from_utf8_lossy(&buf[..n]).to_string();
                    tracing::warn!("unexpected inbound bytes on data channel: {:?}", text);
                    hub.emit(DriverEvent::Data(text));
                }
            }
        }
    })
}

/// Decode, classify, and dispatch one read's worth of control-channel
/// bytes. Runs under the session lock so units are handled strictly in
/// arrival order; events are emitted after the lock drops, in that order.
fn process_inbound(inner: &Arc<Mutex<SessionInner>>, hub: &Arc<EventHub>, bytes: &[u8]) {
    let mut events = Vec::new();
    {
        let mut inner = inner.lock();
        let units = inner.decoder.feed(bytes);
        for unit in units {
            match unit {
                DecodedUnit::Text(line) => events.push(DriverEvent::Data(line)),
                DecodedUnit::Invalid { text, reason } => {
                    events.push(DriverEvent::Data(text.clone()));
                    events.push(DriverEvent::Error(DriverError::Parse { text, reason }));
                }
                DecodedUnit::Json(value) => {
                    events.push(DriverEvent::Data(value.to_string()));
                    dispatch_json(&mut inner, &mut events, &value);
                }
            }
        }
    }
    for event in events {
        hub.emit(event);
    }
}

fn dispatch_json(inner: &mut SessionInner, events: &mut Vec<DriverEvent>, value: &Value) {
    let classifieds = inner.classifier.classify(value);

    // The first response or status report after open is the connection
    // banner, whatever its content. The banner response grants no credit.
    let mut banner_response = false;
    if !inner.banner_seen {
        let banner = classifieds.iter().find_map(|c| match c {
            Classified::Response { body, .. } => Some((body.clone(), true)),
            Classified::StatusChanged(delta) => Some((Value::Object(delta.clone()), false)),
            _ => None,
        });
        if let Some((banner, was_response)) = banner {
            inner.banner_seen = true;
            banner_response = was_response;
            events.push(DriverEvent::Connected(banner));
        }
    }

    let rx_capacity = classifieds.iter().find_map(|c| match c {
        Classified::RxReceived(n) => Some(*n),
        _ => None,
    });

    for classified in classifieds {
        match classified {
            Classified::DeviceError(e) => events.push(DriverEvent::Error(e)),
            Classified::ErrorReport(v) => events.push(DriverEvent::ErrorReport(v)),
            Classified::GcodeReceived(v) => events.push(DriverEvent::GcodeReceived(v)),
            Classified::RxReceived(n) => events.push(DriverEvent::RxReceived(n)),
            Classified::StatusChanged(delta) => {
                if let Some(stat) = delta.get("stat").and_then(Value::as_i64) {
                    if stat == 6 {
                        inner.in_hold = true;
                    } else if stat == 5 && inner.in_hold {
                        inner.in_hold = false;
                    }
                }
                events.push(DriverEvent::StatusChanged(delta));
            }
            Classified::Response { body, footer } => {
                events.push(DriverEvent::Response { body, footer });
                if !banner_response {
                    let single_channel = inner
                        .transport
                        .as_ref()
                        .is_none_or(|t| !t.has_data_channel());
                    let outs = inner.scheduler.on_response(rx_capacity, single_channel);
                    execute_outputs(inner, events, outs);
                }
            }
        }
    }
}

/// Parse a recorded `[[C<ms>]]` / `[[G<ms>]]` timecode, optionally behind
/// an `N<line>` prefix. Returns the line with the timecode removed and the
/// millisecond value.
fn parse_timecode(line: &str) -> Option<(String, u64)> {
    let start = line.find("[[")?;
    let prefix = &line[..start];
    if !prefix.is_empty() {
        // Only a line-number prefix may precede the timecode.
        let trimmed = prefix.trim_end();
        let digits = trimmed.strip_prefix(['N', 'n'])?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    let rest = &line[start + 2..];
    let end = rest.find("]]")?;
    let code = &rest[..end];
    let digits = code.strip_prefix(['C', 'G'])?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let timecode = digits.parse().ok()?;
    Some((format!("{prefix}{}", &rest[end + 2..]), timecode))
}

/// Replace recorded `\xNN` escapes with the bytes they stand for, so
/// captured real-time commands replay as real bytes.
fn unescape_hex(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'x') {
            chars.next();
            let mut value: u32 = 0;
            let mut digits = 0;
            while digits < 2 {
                match chars.peek().and_then(|d| d.to_digit(16)) {
                    Some(d) => {
                        value = value * 16 + d;
                        chars.next();
                        digits += 1;
                    }
                    None => break,
                }
            }
            match (digits, char::from_u32(value)) {
                (0, _) | (_, None) => {
                    out.push('\\');
                    out.push('x');
                }
                (_, Some(decoded)) => out.push(decoded),
            }
            continue;
        }
        out.push(c);
    }
    out
}
