//! Response classifier
//!
//! Inspects decoded JSON units and turns them into semantic protocol
//! events: response envelopes with footers, sparse status deltas, exception
//! reports, G-code echoes, and receive-buffer capacity signals. The
//! classifier owns the session's accumulated [`MachineStatus`]; nothing
//! else mutates it.

use serde_json::{Map, Value};

use g2kit_core::{DeviceErrorKind, DriverError, Footer, MachineStatus};

/// One semantic outcome of classifying a JSON unit. A single unit can
/// yield several: a response envelope, its status delta, and a device
/// error may all co-occur.
#[derive(Debug, Clone)]
pub enum Classified {
    /// The footer carried a nonzero status code.
    DeviceError(DriverError),
    /// The body carried an `er` exception report.
    ErrorReport(Value),
    /// The body carried an `sr` status report; the sparse delta is
    /// returned after being merged into the machine status.
    StatusChanged(Map<String, Value>),
    /// The body carried a `gc` G-code echo.
    GcodeReceived(Value),
    /// The body carried an `rx` receive-buffer capacity signal.
    RxReceived(u64),
    /// The unit was a response envelope (top-level `r`); always produced
    /// for envelopes, after any of the above.
    Response {
        /// The unwrapped `r` body.
        body: Value,
        /// The footer, when the device supplied one.
        footer: Option<Footer>,
    },
}

/// Stateful classifier for one session.
#[derive(Debug, Default)]
pub struct ResponseClassifier {
    status: MachineStatus,
}

impl ResponseClassifier {
    /// Create a classifier with an empty status map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulated machine status.
    pub fn status(&self) -> &MachineStatus {
        &self.status
    }

    /// Classify one decoded JSON unit.
    pub fn classify(&mut self, unit: &Value) -> Vec<Classified> {
        let mut out = Vec::new();

        let is_envelope = unit.get("r").is_some();

        // The footer normally sits at top level, but some TinyG firmware
        // nests it inside r.
        let footer = unit
            .get("f")
            .or_else(|| unit.get("r").and_then(|r| r.get("f")))
            .and_then(Footer::from_value);

        if is_envelope {
            if let Some(footer) = footer {
                if !footer.is_ok() {
                    out.push(Classified::DeviceError(self.map_footer_error(unit, footer)));
                }
            }
        }

        // Envelopes are unwrapped to r for body inspection.
        let body = if is_envelope { &unit["r"] } else { unit };

        if let Some(er) = body.get("er") {
            out.push(Classified::ErrorReport(er.clone()));
        } else if let Some(sr) = body.get("sr").and_then(Value::as_object) {
            self.status.merge(sr);
            out.push(Classified::StatusChanged(sr.clone()));
        } else if let Some(gc) = body.get("gc") {
            out.push(Classified::GcodeReceived(gc.clone()));
        }

        if let Some(rx) = body.get("rx").and_then(Value::as_u64) {
            out.push(Classified::RxReceived(rx));
        }

        if is_envelope {
            out.push(Classified::Response {
                body: body.clone(),
                footer,
            });
        }

        out
    }

    fn map_footer_error(&self, unit: &Value, footer: Footer) -> DriverError {
        let kind = match footer.status {
            108 => DeviceErrorKind::Syntax,
            20 => DeviceErrorKind::Internal,
            202 => DeviceErrorKind::TooShortMove,
            204 => DeviceErrorKind::RejectedByAlarm,
            _ => DeviceErrorKind::Generic,
        };
        let line = if footer.status == 202 {
            unit.get("r").and_then(|r| r.get("n")).and_then(Value::as_u64)
        } else {
            None
        };
        DriverError::Device {
            kind,
            status: footer.status,
            line,
            raw: unit.to_string(),
        }
    }
}
