// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

//! State of a relay-side socket as mirrored onto a proxy link.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketSnapshot {
    pub id: String,
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub transport: TransportSnapshot,
    #[serde(default = "default_protocol")]
    pub protocol: u8,
    #[serde(default)]
    pub handshake: Handshake,
    #[serde(default = "default_nsp")]
    pub nsp: String,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub name: String,
    pub ready_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub xdomain: bool,
    #[serde(default)]
    pub issued: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub address: String,
}

fn default_protocol() -> u8 {
    4
}

fn default_nsp() -> String {
    "/".to_string()
}

fn default_connected() -> bool {
    true
}

impl Default for TransportSnapshot {
    fn default() -> Self {
        Self {
            name: "websocket".to_string(),
            ready_state: "open".to_string(),
        }
    }
}

impl Handshake {
    /// Captures the upgrade request of a freshly accepted socket.
    pub fn new(
        headers: BTreeMap<String, String>,
        query: BTreeMap<String, String>,
        url: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let issued = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let xdomain = headers.contains_key("origin");
        Self {
            headers,
            query,
            time: (issued / 1000).to_string(),
            secure: false,
            xdomain,
            issued,
            url: url.into(),
            address: address.into(),
        }
    }
}

impl SocketSnapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rooms: Vec::new(),
            transport: TransportSnapshot::default(),
            protocol: default_protocol(),
            handshake: Handshake::default(),
            nsp: default_nsp(),
            connected: default_connected(),
        }
    }

    /// Decodes and validates a snapshot pushed by the relay. Duplicate rooms
    /// are collapsed, keeping first-seen order.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut snapshot: SocketSnapshot = serde_json::from_value(value)
            .map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;

        let mut seen = std::collections::HashSet::new();
        snapshot.rooms.retain(|room| seen.insert(room.clone()));

        Ok(snapshot)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidSnapshot("id must not be empty".to_string()));
        }
        if !self.nsp.starts_with('/') {
            return Err(Error::InvalidSnapshot(format!(
                "namespace must start with '/': {}",
                self.nsp
            )));
        }
        if self.rooms.iter().any(|room| room.is_empty()) {
            return Err(Error::InvalidSnapshot("room names must not be empty".to_string()));
        }
        Ok(())
    }
}
