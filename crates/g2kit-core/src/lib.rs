//! # g2kit Core
//!
//! Core types, error taxonomy, and the event hub shared by the g2kit
//! driver crates. Everything here is transport-agnostic: the wire-facing
//! protocol engine lives in `g2kit-driver`.

pub mod error;
pub mod events;
pub mod status;

pub use error::{DeviceErrorKind, DriverError, Result};
pub use events::{
    ChannelKind, DriverEvent, EventCategory, EventFilter, EventHub, SubscriptionId,
};
pub use status::{Footer, MachineStatus, MotionState, Position};
