//! Auxiliary and proxy declarations

use crate::core::auxiliary::AuxiliaryConfig;
use crate::core::proxy::{ProxyMode, ProxyOptions};
use crate::core::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid configuration
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be rendered
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level configuration file
///
/// ```toml
/// [[auxiliary]]
/// alias = "dut"
/// transport = { type = "serial", port = "/dev/ttyUSB0", baud_rate = 115200 }
///
/// [auxiliary.settings]
/// ack_tries = 3
///
/// [[proxy]]
/// name = "shared_uart"
/// transport = { type = "serial", port = "/dev/ttyUSB1" }
/// subscribers = ["fw_a", "fw_b"]
/// mode = "process"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Auxiliaries to build
    #[serde(rename = "auxiliary")]
    pub auxiliaries: Vec<AuxiliaryEntry>,
    /// Proxies to attach
    #[serde(rename = "proxy")]
    pub proxies: Vec<ProxyEntry>,
}

impl CoreConfig {
    /// Load config from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Save config to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Declaration for `alias`
    pub fn auxiliary(&self, alias: &str) -> Option<&AuxiliaryEntry> {
        self.auxiliaries.iter().find(|a| a.alias == alias)
    }
}

/// One `[[auxiliary]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryEntry {
    /// Registry alias
    pub alias: String,
    /// Transport to build for each instance
    pub transport: TransportConfig,
    /// Engine settings
    #[serde(default)]
    pub settings: AuxiliaryConfig,
}

/// One `[[proxy]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEntry {
    /// Proxy name
    pub name: String,
    /// The shared real transport
    pub transport: TransportConfig,
    /// Aliases of the subscribing auxiliaries
    #[serde(default)]
    pub subscribers: Vec<String>,
    /// Where dispatch runs
    #[serde(default)]
    pub mode: ProxyMode,
    /// Tuning
    #[serde(default)]
    pub options: ProxyOptions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trace::TraceFormat;
    use crate::core::transport::SerialConfig;

    const SAMPLE: &str = r#"
[[auxiliary]]
alias = "fw_a"
transport = { type = "proxy" }

[auxiliary.settings]
proxy_capable = true
ack_tries = 4

[[auxiliary]]
alias = "fw_b"
transport = { type = "proxy" }
settings = { proxy_capable = true, handshake = false }

[[proxy]]
name = "uart"
transport = { type = "serial", port = "/dev/ttyS3", baud_rate = 9600 }
subscribers = ["fw_a", "fw_b"]
mode = "process"

[proxy.options]
poll_interval_ms = 5
trace = { path = "uart.trace", format = "json_lines" }
"#;

    #[test]
    fn test_parse_sample() {
        let config = CoreConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.auxiliaries.len(), 2);

        let a = config.auxiliary("fw_a").unwrap();
        assert_eq!(a.transport, TransportConfig::Proxy);
        assert!(a.settings.proxy_capable);
        assert_eq!(a.settings.ack_tries, 4);
        assert!(a.settings.handshake);
        assert!(!config.auxiliary("fw_b").unwrap().settings.handshake);

        let proxy = &config.proxies[0];
        assert_eq!(proxy.mode, ProxyMode::Process);
        assert_eq!(proxy.subscribers, vec!["fw_a", "fw_b"]);
        assert_eq!(proxy.options.poll_interval_ms, 5);
        assert_eq!(proxy.options.trace.as_ref().unwrap().format, TraceFormat::JsonLines);
        match &proxy.transport {
            TransportConfig::Serial(serial) => {
                assert_eq!(serial.port, "/dev/ttyS3");
                assert_eq!(serial.baud_rate, 9600);
                assert_eq!(serial.data_bits, 8);
            }
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_empty_config() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn test_unknown_setting_rejected() {
        let bad = r#"
[[auxiliary]]
alias = "x"
transport = { type = "loopback" }
settings = { retries = 3 }
"#;
        assert!(matches!(CoreConfig::from_toml_str(bad), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auxlink.toml");

        let config = CoreConfig {
            auxiliaries: vec![AuxiliaryEntry {
                alias: "dut".into(),
                transport: TransportConfig::Serial(SerialConfig::new("/dev/ttyACM0", 57600)),
                settings: AuxiliaryConfig::default().without_handshake(),
            }],
            proxies: Vec::new(),
        };
        config.save(&path).unwrap();

        assert_eq!(CoreConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CoreConfig::load(dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
