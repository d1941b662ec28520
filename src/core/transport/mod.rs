//! Transport layer
//!
//! The core only ever relies on four calls: `open`, `close`, `send` and
//! `receive`. Implementations guard their own I/O so that concurrent callers
//! never interleave bytes mid-frame.
//!
//! Supports:
//! - In-memory loopback (testing, process-proxy smoke runs)
//! - Serial ports (RS-232, RS-485, USB-Serial)
//! - Proxy channels (stand-ins multiplexed over one real transport)

mod loopback;
mod serial;

pub use loopback::LoopbackTransport;
pub use serial::{SerialConfig, SerialFlowControl, SerialParity, SerialTransport};

use crate::core::proxy::ProxyChannel;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Disconnected
    #[error("Disconnected")]
    Disconnected,

    /// Proxy channel used before a proxy bound it
    #[error("Proxy channel is not bound to a proxy")]
    NotBound,

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),
}

/// Routing metadata attached to a send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Routing {
    /// Remote node / arbitration id, when the bus has one
    pub remote_id: Option<u32>,
}

impl Routing {
    /// Route to a specific remote id
    pub fn to(remote_id: u32) -> Self {
        Self {
            remote_id: Some(remote_id),
        }
    }
}

/// Result of a `receive` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxFrame {
    /// Payload, `None` on timeout
    pub msg: Option<Bytes>,
    /// Source id reported by the transport
    pub remote_id: Option<u32>,
}

impl RxFrame {
    /// Nothing arrived within the timeout
    pub fn empty() -> Self {
        Self::default()
    }

    /// A received payload
    pub fn data(msg: impl Into<Bytes>, remote_id: Option<u32>) -> Self {
        Self {
            msg: Some(msg.into()),
            remote_id,
        }
    }

    /// True when no payload is present
    pub fn is_empty(&self) -> bool {
        self.msg.is_none()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
}

/// Byte-level I/O capability
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Acquire the underlying resource
    fn open(&self) -> Result<(), TransportError>;

    /// Release the underlying resource
    fn close(&self) -> Result<(), TransportError>;

    /// Send one payload
    fn send(&self, data: &[u8], routing: Routing) -> Result<(), TransportError>;

    /// Wait up to `timeout` for one payload
    fn receive(&self, timeout: Duration) -> Result<RxFrame, TransportError>;

    /// The proxy stand-in behind this transport, if it is one
    fn as_proxy_channel(&self) -> Option<ProxyChannel> {
        None
    }

    /// Human-readable description for logs
    fn describe(&self) -> String {
        String::from("transport")
    }
}

/// Builds fresh transports for an auxiliary (and for its copies)
pub trait TransportFactory: Send + Sync {
    /// Build a new, unopened transport
    fn build(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn build(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self()
    }
}

/// Declarative transport selection, as found in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-memory loopback
    Loopback,
    /// Serial port
    Serial(SerialConfig),
    /// Stand-in bound later by a proxy
    Proxy,
}

impl TransportFactory for TransportConfig {
    fn build(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(match self {
            TransportConfig::Loopback => Arc::new(LoopbackTransport::new()),
            TransportConfig::Serial(cfg) => Arc::new(SerialTransport::new(cfg.clone())),
            TransportConfig::Proxy => Arc::new(ProxyChannel::new()),
        })
    }
}
