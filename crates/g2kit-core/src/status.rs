//! Machine status model
//!
//! The device pushes sparse status reports (`{"sr":{...}}`) carrying only
//! the fields that changed. [`MachineStatus`] accumulates them into the
//! authoritative merged view, last-write-wins per field. Motion state is a
//! closed enum carried on the wire as an integer `stat` code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response footer: the fixed 3-element status tuple `[revision, status,
/// bytes_read]` appended to device responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footer {
    /// Footer schema revision.
    pub revision: u8,
    /// Device status code; 0 is success.
    pub status: u16,
    /// Count of bytes the device read to produce this response.
    pub bytes_read: u64,
}

impl Footer {
    /// Parse a footer from the raw JSON tuple, tolerating extra elements.
    pub fn from_value(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        if arr.len() < 3 {
            return None;
        }
        Some(Footer {
            revision: arr[0].as_u64().unwrap_or(0) as u8,
            status: arr[1].as_u64().unwrap_or(0) as u16,
            bytes_read: arr[2].as_u64().unwrap_or(0),
        })
    }

    /// True when the status code reports success.
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Machine motion state, reported as the integer `stat` field in status
/// reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotionState {
    /// Machine is initializing.
    Init = 0,
    /// Machine is ready for use.
    Ready = 1,
    /// Machine is in alarm state (shut down).
    Alarm = 2,
    /// Program stop or no more blocks (M0, M1, M60).
    Stop = 3,
    /// Program end via M2, M30.
    Ended = 4,
    /// Motion is running.
    Running = 5,
    /// Motion is holding (feed-hold).
    Hold = 6,
    /// A probe cycle is in progress.
    Probing = 7,
    /// Machine is running a canned cycle.
    RunningCycle = 8,
    /// A homing cycle is in progress.
    Homing = 9,
    /// A jog is in progress.
    Jogging = 10,
    /// Machine is stopped by a safety interlock.
    Interlock = 11,
    /// Machine is shut down.
    Shutdown = 12,
    /// Machine is panicked and requires a reset.
    Panic = 13,
}

impl MotionState {
    /// Map a wire `stat` code to a motion state.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Alarm,
            3 => Self::Stop,
            4 => Self::Ended,
            5 => Self::Running,
            6 => Self::Hold,
            7 => Self::Probing,
            8 => Self::RunningCycle,
            9 => Self::Homing,
            10 => Self::Jogging,
            11 => Self::Interlock,
            12 => Self::Shutdown,
            13 => Self::Panic,
            _ => return None,
        })
    }

    /// Stop and Ended are the terminal states a finished program settles in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::Ended)
    }
}

/// Machine position snapshot in the current work coordinate system.
///
/// Sparse: axes the device never reported stay at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X axis position.
    pub x: f64,
    /// Y axis position.
    pub y: f64,
    /// Z axis position.
    pub z: f64,
    /// A (rotational) axis position.
    pub a: f64,
    /// B (rotational) axis position.
    pub b: f64,
    /// C (rotational) axis position.
    pub c: f64,
}

/// Accumulated machine status: the merged superset of every sparse status
/// report seen this session.
#[derive(Debug, Clone, Default)]
pub struct MachineStatus {
    fields: Map<String, Value>,
}

impl MachineStatus {
    /// Create an empty status map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a sparse delta into the accumulated status, last-write-wins
    /// per field.
    pub fn merge(&mut self, delta: &Map<String, Value>) {
        for (key, value) in delta {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Raw field lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All accumulated fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Current motion state, if a `stat` field has been reported.
    pub fn motion_state(&self) -> Option<MotionState> {
        self.fields
            .get("stat")
            .and_then(Value::as_i64)
            .and_then(MotionState::from_code)
    }

    /// Last active G-code line number reported by the device.
    pub fn line(&self) -> Option<u64> {
        self.fields.get("line").and_then(Value::as_u64)
    }

    /// Feed rate in units per minute, if reported.
    pub fn feed_rate(&self) -> Option<f64> {
        self.fields.get("feed").and_then(Value::as_f64)
    }

    /// Current work position assembled from the `posx`..`posc` fields.
    pub fn position(&self) -> Position {
        let axis = |k: &str| self.fields.get(k).and_then(Value::as_f64).unwrap_or(0.0);
        Position {
            x: axis("posx"),
            y: axis("posy"),
            z: axis("posz"),
            a: axis("posa"),
            b: axis("posb"),
            c: axis("posc"),
        }
    }
}
