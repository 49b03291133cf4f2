// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

/// Upstream relay. An empty address runs the hub without a proxy link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_conn_timeout_ms")]
    pub conn_timeout_ms: Option<u64>,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_hub_port")]
    pub port: u16,
}

fn default_conn_timeout_ms() -> Option<u64> {
    Some(500)
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_hub_port() -> u16 {
    3000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            conn_timeout_ms: default_conn_timeout_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_hub_port(),
        }
    }
}

impl Config {
    pub fn load(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn has_relay(&self) -> bool {
        !self.relay.address.is_empty()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_ADDRESS") {
            self.relay.address = val;
        }
        if let Ok(val) = env::var("RELAY_AUTH_TOKEN") {
            self.auth.token = Some(val).filter(|t| !t.is_empty());
        }
        if let Ok(val) = env::var("RECONNECT_CONN_TIMEOUT_MS") {
            if val.is_empty() || val == "null" {
                self.reconnect.conn_timeout_ms = None;
            } else if let Ok(ms) = val.parse() {
                self.reconnect.conn_timeout_ms = Some(ms);
            }
        }
        if let Ok(val) = env::var("RECONNECT_MAX_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                self.reconnect.max_delay_ms = ms;
            }
        }
        if let Ok(val) = env::var("RECONNECT_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                self.reconnect.max_attempts = Some(attempts);
            }
        }
        if let Ok(val) = env::var("ACK_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.requests.ack_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("HUB_PORT") {
            if let Ok(port) = val.parse() {
                self.hub.port = port;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.has_relay()
            && !(self.relay.address.starts_with("ws://") || self.relay.address.starts_with("wss://"))
        {
            anyhow::bail!("RELAY_ADDRESS must be a ws:// or wss:// URL");
        }
        if self.requests.ack_timeout_ms == 0 {
            anyhow::bail!("ACK_TIMEOUT_MS must be greater than zero");
        }
        if self.reconnect.max_delay_ms == 0 {
            anyhow::bail!("RECONNECT_MAX_DELAY_MS must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.has_relay());
        assert_eq!(config.reconnect.conn_timeout_ms, Some(500));
        assert_eq!(config.requests.ack_timeout_ms, 10_000);
        assert_eq!(config.hub.port, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            address = "ws://relay.local:8080/proxy"

            [auth]
            token = "tok1"

            [reconnect]
            conn_timeout_ms = 10
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert!(config.has_relay());
        assert_eq!(config.auth.token.as_deref(), Some("tok1"));
        assert_eq!(config.reconnect.conn_timeout_ms, Some(10));
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.hub.port, 3000);
    }

    #[test]
    fn test_validate_rejects_non_ws_address() {
        let mut config = Config::default();
        config.relay.address = "http://relay.local".to_string();
        assert!(config.validate().is_err());
    }
}
