//! Error handling for g2kit
//!
//! One taxonomy covers the whole driver surface:
//! - open/lifecycle errors (`AlreadyOpen`, `OpenFailed`, `NotOpen`)
//! - channel-level I/O failures (`Transport`)
//! - malformed protocol frames (`Parse`, recoverable)
//! - device-reported response errors (`Device` with sub-kinds)
//! - source-stream failures during a file send (`ReadStream`)
//!
//! All variants use `thiserror` and are `Clone` so they can travel through
//! the broadcast event channel. Errors raised from I/O completion paths are
//! surfaced as `DriverEvent::Error` rather than returned, since those paths
//! have no synchronous caller.

use thiserror::Error;

use crate::events::ChannelKind;

/// Device-reported response error sub-kinds, mapped from the status code in
/// a response footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Footer status 108: the device could not parse the line.
    Syntax,
    /// Footer status 20: internal firmware error.
    Internal,
    /// Footer status 202: move too short to execute.
    TooShortMove,
    /// Footer status 204: command rejected while the machine is in alarm.
    RejectedByAlarm,
    /// Any other nonzero footer status.
    Generic,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax error"),
            Self::Internal => write!(f, "internal error"),
            Self::TooShortMove => write!(f, "too short move"),
            Self::RejectedByAlarm => write!(f, "rejected by alarm"),
            Self::Generic => write!(f, "device error"),
        }
    }
}

/// Driver error type
///
/// Every variant carries enough raw context (offending text or serialized
/// object) to diagnose a failure without re-running the session.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// A session is already open; `open()` does not silently replace it.
    #[error("device already open")]
    AlreadyOpen,

    /// No session is open for the requested operation.
    #[error("device not open")]
    NotOpen,

    /// The underlying channel failed to open.
    #[error("failed to open port {port}: {reason}")]
    OpenFailed {
        /// Path of the port that failed to open.
        port: String,
        /// The reason the open failed.
        reason: String,
    },

    /// Channel-level I/O failure after open.
    #[error("transport error on {channel} channel: {reason}")]
    Transport {
        /// Which channel failed.
        channel: ChannelKind,
        /// The underlying I/O error, stringified.
        reason: String,
    },

    /// A frame that looked like JSON failed to parse. Recoverable: the
    /// stream continues with the next frame.
    #[error("unable to parse frame {text:?}: {reason}")]
    Parse {
        /// The offending frame text.
        text: String,
        /// The parser's complaint.
        reason: String,
    },

    /// The device reported a nonzero status code in a response footer.
    #[error("device reported {kind} (status {status}{}): {raw}", line.map(|n| format!(", line {n}")).unwrap_or_default())]
    Device {
        /// Mapped sub-kind of the failure.
        kind: DeviceErrorKind,
        /// The raw footer status code.
        status: u16,
        /// Offending line number, when the device reported one.
        line: Option<u64>,
        /// The raw response object, serialized.
        raw: String,
    },

    /// The machine entered alarm state during a file send.
    #[error("machine entered alarm state: {raw}")]
    Alarm {
        /// The status report that carried the alarm, serialized.
        raw: String,
    },

    /// Failure reading the source file or stream during a file send.
    #[error("file reading error: {reason}")]
    ReadStream {
        /// The underlying read error, stringified.
        reason: String,
    },

    /// The session was closed while an awaited operation was in flight.
    /// Lines already written may or may not have executed.
    #[error("session closed before the operation completed")]
    SessionClosed,

    /// Device auto-detection found nothing.
    #[error("autodetect found no connected devices")]
    NoDevicesFound,

    /// Device auto-detection found more than one candidate and the caller
    /// asked to fail in that case.
    #[error("autodetect found multiple devices: {}", ports.join(", "))]
    MultipleDevicesFound {
        /// Control-port paths of every candidate found.
        ports: Vec<String>,
    },

    /// Generic driver error.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Create an error from a string message.
    pub fn other(msg: impl Into<String>) -> Self {
        DriverError::Other(msg.into())
    }

    /// True for device-reported response errors.
    pub fn is_device_error(&self) -> bool {
        matches!(self, DriverError::Device { .. })
    }

    /// True for recoverable frame parse errors.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, DriverError::Parse { .. })
    }
}

/// Result type using [`DriverError`].
pub type Result<T> = std::result::Result<T, DriverError>;
