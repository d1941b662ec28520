//! Per-auxiliary settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Auxiliary engine settings.
///
/// Timeouts are in milliseconds so the struct maps one-to-one onto a TOML
/// table; the registry relies on that when applying copy overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuxiliaryConfig {
    /// Ping the device on creation and fail if it never acks
    pub handshake: bool,
    /// Execute commands on a dedicated transmit thread
    pub tx_loop: bool,
    /// May be attached to a proxy as a subscriber
    pub proxy_capable: bool,
    /// Routing id attached to every send
    pub remote_id: Option<u32>,
    /// Only handle inbound frames whose source id matches; frames without
    /// an id are dropped too. `None` takes everything.
    pub accept_remote_id: Option<u32>,
    /// Default wait for `run_command` responses
    pub command_timeout_ms: u64,
    /// Per-try wait for an ack
    pub ack_timeout_ms: u64,
    /// Tries per command
    pub ack_tries: u32,
    /// Tries for the creation handshake
    pub handshake_tries: u32,
    /// Tries for a soft abort before the hard reset
    pub abort_tries: u32,
    /// Receive poll interval of the background loops
    pub poll_interval_ms: u64,
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            handshake: true,
            tx_loop: true,
            proxy_capable: false,
            remote_id: None,
            accept_remote_id: None,
            command_timeout_ms: 5000,
            ack_timeout_ms: 1000,
            ack_tries: 2,
            handshake_tries: 3,
            abort_tries: 2,
            poll_interval_ms: 50,
        }
    }
}

impl AuxiliaryConfig {
    /// Default `run_command` wait
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Per-try ack wait
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Loop poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Builder: skip the creation handshake
    #[must_use]
    pub fn without_handshake(mut self) -> Self {
        self.handshake = false;
        self
    }

    /// Builder: execute commands inline on the caller thread
    #[must_use]
    pub fn inline(mut self) -> Self {
        self.tx_loop = false;
        self
    }

    /// Builder: route sends to `id` and only listen to frames from it
    #[must_use]
    pub fn addressed(mut self, id: u32) -> Self {
        self.remote_id = Some(id);
        self.accept_remote_id = Some(id);
        self
    }

    /// True when a frame from `source` is meant for this auxiliary
    pub fn accepts(&self, source: Option<u32>) -> bool {
        self.accept_remote_id.map_or(true, |want| source == Some(want))
    }

    /// Builder: allow proxy subscription
    #[must_use]
    pub fn proxy_capable(mut self) -> Self {
        self.proxy_capable = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: AuxiliaryConfig = toml::from_str("ack_tries = 5\nproxy_capable = true").unwrap();
        assert_eq!(cfg.ack_tries, 5);
        assert!(cfg.proxy_capable);
        assert!(cfg.handshake);
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_source_filter() {
        let open = AuxiliaryConfig::default();
        assert!(open.accepts(None));
        assert!(open.accepts(Some(4)));

        let addressed = AuxiliaryConfig::default().addressed(4);
        assert_eq!(addressed.remote_id, Some(4));
        assert!(addressed.accepts(Some(4)));
        assert!(!addressed.accepts(Some(5)));
        assert!(!addressed.accepts(None));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<AuxiliaryConfig>("baud = 9600").is_err());
    }
}
