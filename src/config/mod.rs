//! Configuration module
//!
//! TOML declarations of the auxiliaries and proxies a registry builds

mod settings;

pub use settings::{AuxiliaryEntry, ConfigError, CoreConfig, ProxyEntry};
