//! # auxlink Core Library
//!
//! Host-side driver for auxiliary devices that speak a small framed
//! command/acknowledge protocol:
//! - Binary wire codec with TLV payloads and CRC trailer
//! - Command/response engine with per-command timeouts and retries
//! - Proxy multiplexer letting several auxiliaries share one serial line
//! - Registry of named auxiliaries, including temporary copies
//!
//! ## Example
//!
//! ```rust,no_run
//! use auxlink_core::{
//!     Auxiliary, AuxiliaryConfig, CommandData, CommandType, ControllerContext, SerialConfig,
//!     SerialTransport,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 115200)));
//!     let ctx = ControllerContext::shared();
//!     let aux = Auxiliary::new("dut", AuxiliaryConfig::default(), transport, ctx);
//!     aux.create_instance()?;
//!
//!     let passed: bool = aux.run_command(
//!         CommandType::TestCaseRun,
//!         CommandData::new(1, 4),
//!         true,
//!         Some(Duration::from_secs(2)),
//!         false,
//!     )?;
//!     println!("acknowledged: {}", passed);
//!
//!     aux.delete_instance();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::config::{AuxiliaryEntry, ConfigError, CoreConfig, ProxyEntry};
pub use crate::core::auxiliary::{
    Auxiliary, AuxiliaryConfig, AuxiliaryError, AuxiliaryResult, CommandData, CommandResponse,
};
pub use crate::core::context::{ControllerContext, RunController, TokenAllocator};
pub use crate::core::lifecycle::{AuxiliaryState, StateTransition};
pub use crate::core::protocol::{
    AckType, CommandType, LogType, MalformedMessage, Message, MessageKind, MessageType, ReportType,
    Tlv, TlvError, TlvTag,
};
pub use crate::core::proxy::{
    ProxyAuxiliary, ProxyChannel, ProxyError, ProxyMode, ProxyOptions, ProxyTarget,
};
pub use crate::core::registry::{AuxiliaryParams, Registry, RegistryError};
pub use crate::core::trace::{TraceConfig, TraceFormat};
pub use crate::core::transport::{
    LoopbackTransport, Routing, RxFrame, SerialConfig, SerialTransport, Transport, TransportConfig,
    TransportError, TransportFactory,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
