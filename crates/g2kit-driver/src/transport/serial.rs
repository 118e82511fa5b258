//! Serial port transport and device enumeration
//!
//! Real channels over USB/RS-232 via the `serialport` crate, plus the
//! device-discovery seam: the engine depends only on the [`DeviceLister`]
//! trait, and [`SerialDeviceLister`] is the stock implementation that
//! recognizes Synthetos boards and pairs their control/data ports.

use async_trait::async_trait;
use std::io;
use std::time::Duration;

use g2kit_core::{DriverError, Result};

use super::Channel;

/// Synthetos USB vendor id.
const SYNTHETOS_VID: u16 = 0x1D50;
/// g2core/TinyG v2 USB product id.
const G2_PID: u16 = 0x606D;

/// Serial open parameters. The protocol is fixed at 8N1 with RTS/CTS flow
/// control; only the path and baud rate vary.
#[derive(Debug, Clone)]
pub struct SerialOptions {
    /// Port path, e.g. `/dev/ttyACM0` or `COM3`.
    pub path: String,
    /// Baud rate; the device default is 115200.
    pub baud_rate: u32,
}

impl SerialOptions {
    /// Options for a path at the default baud rate.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: 115_200,
        }
    }
}

/// A real serial channel.
pub struct SerialChannel {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialChannel {
    /// Open a port with a short read timeout so reader loops can poll
    /// without blocking shutdown.
    pub fn open(options: &SerialOptions) -> Result<Self> {
        let builder = serialport::new(&options.path, options.baud_rate)
            .timeout(Duration::from_millis(10))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::Hardware);

        match builder.open() {
            Ok(port) => Ok(Self {
                port,
                name: options.path.clone(),
            }),
            Err(e) => {
                tracing::warn!("failed to open serial port {}: {}", options.path, e);
                Err(DriverError::OpenFailed {
                    port: options.path.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl Channel for SerialChannel {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // A poll timeout just means no data yet.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// One discovered device: a control port, optionally paired with the data
/// port of a dual-endpoint board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    /// Control (command) port path.
    pub path: String,
    /// Data port path when the board exposes a second endpoint.
    pub data_port_path: Option<String>,
    /// USB serial number when the OS reports one.
    pub serial_number: Option<String>,
}

/// Abstract "list candidate devices" capability, injected from outside the
/// engine so platform heuristics stay replaceable (and testable).
#[async_trait]
pub trait DeviceLister: Send + Sync {
    /// Enumerate candidate devices.
    async fn list(&self) -> Result<Vec<CandidateDevice>>;
}

/// Stock lister built on `serialport::available_ports()`.
///
/// Matches Synthetos boards by VID/PID (0x1D50/0x606D) or manufacturer
/// string, plus FTDI adapters carrying older TinyG hardware. Dual-endpoint
/// boards enumerate as two ports sharing a USB serial number; the
/// lower-numbered port is the command port and the other becomes the data
/// port.
#[derive(Debug, Default)]
pub struct SerialDeviceLister;

#[async_trait]
impl DeviceLister for SerialDeviceLister {
    async fn list(&self) -> Result<Vec<CandidateDevice>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| DriverError::other(format!("port enumeration task failed: {e}")))?
            .map_err(|e| {
                tracing::error!("failed to enumerate serial ports: {}", e);
                DriverError::other(format!("failed to enumerate ports: {e}"))
            })?;
        Ok(pair_candidates(ports))
    }
}

fn pair_candidates(mut ports: Vec<serialport::SerialPortInfo>) -> Vec<CandidateDevice> {
    // Enumeration order is not guaranteed; sort so the command endpoint
    // (lower interface number, hence lower path) comes first.
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));

    let mut found: Vec<CandidateDevice> = Vec::new();
    for port in ports {
        let serialport::SerialPortType::UsbPort(usb) = &port.port_type else {
            continue;
        };
        let is_g2 = (usb.vid == SYNTHETOS_VID && usb.pid == G2_PID)
            || usb.manufacturer.as_deref() == Some("Synthetos");
        let is_ftdi = usb.manufacturer.as_deref() == Some("FTDI");
        if !is_g2 && !is_ftdi {
            continue;
        }

        // Second endpoint of the same physical board: same serial number.
        if is_g2 {
            if let (Some(last), Some(serial)) = (found.last_mut(), &usb.serial_number) {
                if last.data_port_path.is_none()
                    && last.serial_number.as_deref() == Some(serial.as_str())
                {
                    last.data_port_path = Some(port.port_name.clone());
                    continue;
                }
            }
        }

        found.push(CandidateDevice {
            path: port.port_name.clone(),
            data_port_path: None,
            serial_number: usb.serial_number.clone(),
        });
    }
    found
}
