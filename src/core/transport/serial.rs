//! Serial port transport implementation

use super::{RxFrame, Routing, Transport, TransportError, TransportStats};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 115200)
    }
}

/// Serial port transport.
///
/// Reads and writes go through two handles on the same port, so a blocking
/// `receive` never holds up a `send`.
pub struct SerialTransport {
    config: SerialConfig,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    stats: RwLock<TransportStats>,
}

impl SerialTransport {
    /// Create a new, closed serial transport
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            stats: RwLock::new(TransportStats::default()),
        }
    }

    /// Configuration
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }

    fn install(&self, port: Box<dyn SerialPort>) -> Result<(), TransportError> {
        let writer = port
            .try_clone()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        *self.reader.lock() = Some(port);
        *self.writer.lock() = Some(writer);
        *self.stats.write() = TransportStats::default();
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn open(&self) -> Result<(), TransportError> {
        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let port = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    TransportError::PortNotFound(self.config.port.clone())
                }
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(self.config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        self.install(port)?;
        tracing::debug!(
            port = %self.config.port,
            baud = self.config.baud_rate,
            "Serial port opened"
        );
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        *self.writer.lock() = None;
        *self.reader.lock() = None;
        Ok(())
    }

    fn send(&self, data: &[u8], _routing: Routing) -> Result<(), TransportError> {
        let mut port_guard = self.writer.lock();
        let port = port_guard.as_mut().ok_or(TransportError::NotConnected)?;

        port.write_all(data)?;
        port.flush()?;
        drop(port_guard);

        let mut stats = self.stats.write();
        stats.bytes_sent += data.len() as u64;
        stats.packets_sent += 1;
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<RxFrame, TransportError> {
        let mut port_guard = self.reader.lock();
        let port = port_guard.as_mut().ok_or(TransportError::NotConnected)?;
        port.set_timeout(timeout)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut buffer = vec![0u8; READ_CHUNK];
        match port.read(&mut buffer) {
            Ok(0) => Ok(RxFrame::empty()),
            Ok(n) => {
                drop(port_guard);
                buffer.truncate(n);

                let mut stats = self.stats.write();
                stats.bytes_received += n as u64;
                stats.packets_received += 1;

                Ok(RxFrame::data(Bytes::from(buffer), None))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(RxFrame::empty()),
            Err(e) => Err(TransportError::IoError(e)),
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            match self.config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.config.stop_bits,
        )
    }
}
