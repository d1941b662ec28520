//! Core module containing the auxiliary engine
//!
//! This module provides:
//! - Wire codec for the auxiliary message protocol
//! - Transport contract with loopback and serial drivers
//! - Command/response engine with per-token ack routing
//! - Proxy multiplexer sharing one transport between auxiliaries
//! - Registry of named auxiliaries and their copies
//! - Forwarded-frame tracing

pub mod auxiliary;
pub mod context;
pub(crate) mod hex_serde;
pub mod lifecycle;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod trace;
pub mod transport;
pub(crate) mod worker;
