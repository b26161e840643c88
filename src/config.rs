use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::auth::DEFAULT_EXTENSION_IDS;
use crate::error::RelayError;

/// Configuration for the relay server.
///
/// All fields have serviceable defaults; a YAML file and CLI flags may
/// override them. The relay keeps no state beyond this struct across
/// restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address, localhost by default (the relay trusts its host).
    pub host: String,
    /// TCP listen port. Port 0 binds an ephemeral port (test harnesses).
    pub port: u16,
    /// Shared secret for `/cdp` clients. `None` admits unauthenticated
    /// clients under the localhost trust model.
    pub token: Option<String>,
    /// Extension ids accepted on `/extension`.
    pub extension_ids: Vec<String>,
    /// WebSocket ping cadence.
    pub ping_interval_ms: u64,
    /// Deadline for forwarded commands.
    pub command_timeout_ms: u64,
    /// Deadline for navigation / evaluation / capture commands.
    pub long_command_timeout_ms: u64,
    /// Event forwards to a client are dropped once its send queue holds
    /// this many bytes. Command responses are exempt.
    pub max_client_queue_bytes: usize,
    /// Frame-count companion to `max_client_queue_bytes`.
    pub max_client_queue_frames: usize,
    /// How long the extension may stay silent after admission before it
    /// is treated as unresponsive.
    pub handshake_timeout_ms: u64,
    /// Grace window for clean closures during shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 19988,
            token: None,
            extension_ids: DEFAULT_EXTENSION_IDS
                .iter()
                .map(|id| id.to_string())
                .collect(),
            ping_interval_ms: 30_000,
            command_timeout_ms: 30_000,
            long_command_timeout_ms: 60_000,
            max_client_queue_bytes: 1_048_576,
            max_client_queue_frames: 1_000,
            handshake_timeout_ms: 5_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl RelayConfig {
    /// Load a YAML config file, leaving unset keys at their defaults.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| RelayError::Config(format!("reading {}: {err}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|err| RelayError::Config(format!("parsing {}: {err}", path.display())))
    }

    /// Reject configurations an operator should never run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        self.host
            .parse::<IpAddr>()
            .map_err(|_| RelayError::Config(format!("invalid host address: {}", self.host)))?;
        if self.port == 0 {
            return Err(RelayError::Config("port must be in 1-65535".to_string()));
        }
        if matches!(self.token.as_deref(), Some("")) {
            return Err(RelayError::Config("token must not be empty".to_string()));
        }
        if self.extension_ids.is_empty() {
            return Err(RelayError::Config(
                "extension allowlist must not be empty".to_string(),
            ));
        }
        if self.ping_interval_ms == 0 || self.command_timeout_ms == 0 {
            return Err(RelayError::Config(
                "timer intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RelayConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.port, 19988);
        assert_eq!(cfg.host, "127.0.0.1");
        assert!(cfg.token.is_none());
        assert!(!cfg.extension_ids.is_empty());
    }

    #[test]
    fn rejects_zero_port() {
        let cfg = RelayConfig {
            port: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_token() {
        let cfg = RelayConfig {
            token: Some(String::new()),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_host() {
        let cfg = RelayConfig {
            host: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_allowlist() {
        let cfg = RelayConfig {
            extension_ids: Vec::new(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
