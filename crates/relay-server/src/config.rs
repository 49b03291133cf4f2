// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Shared secret for proxy links. Without one every link is accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_users")]
    pub max_users: usize,
}

fn default_port() -> u16 {
    8080
}

fn default_max_users() -> usize {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_users: default_max_users(),
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

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var("AUTH_TOKEN") {
            self.auth.token = Some(val);
        }
        if let Ok(val) = env::var("LIMITS_MAX_USERS") {
            if let Ok(max) = val.parse() {
                self.limits.max_users = max;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.auth.token.as_deref() == Some("") {
            anyhow::bail!("AUTH_TOKEN must not be empty when set");
        }
        if self.limits.max_users == 0 {
            anyhow::bail!("LIMITS_MAX_USERS must be greater than zero");
        }
        Ok(())
    }
}
