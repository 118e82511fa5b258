//! # g2kit Driver
//!
//! Host-side protocol engine for g2core/TinyG motion controllers: frame
//! decoding, response classification, dual-channel transport routing,
//! credit-based send scheduling, file streaming, and session setup.
//!
//! The entry point is [`G2Core`]: open a session, subscribe to its events,
//! then `write` lines or `send_file` a whole program.

pub mod protocol;
pub mod sender;
pub mod session;
pub mod streamer;
pub mod transport;

pub use protocol::{
    checksum::{frame_with_checksum, xor_checksum},
    Classified, DecodedUnit, FrameDecoder, ResponseClassifier,
};
pub use sender::{SchedulerOutput, SendScheduler, PREFETCH_SLACK, RESTART_CREDITS};
pub use session::{G2Core, G2CoreOptions, WritePayload};
pub use streamer::{LineFeeder, StreamFeeder, CHUNK_SIZE};
pub use transport::{
    serial::{CandidateDevice, DeviceLister, SerialChannel, SerialDeviceLister, SerialOptions},
    Channel, SharedChannel, TransportManager,
};

pub use g2kit_core::{
    ChannelKind, DeviceErrorKind, DriverError, DriverEvent, EventCategory, EventFilter, EventHub,
    Footer, MachineStatus, MotionState, Position, Result, SubscriptionId,
};
