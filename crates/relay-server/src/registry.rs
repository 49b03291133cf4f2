// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use relay_core::ws::Outbound;
use relay_core::{Packet, RelayEvent, SocketSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct UserEntry {
    pub snapshot: SocketSnapshot,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub sid: String,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub authenticated: bool,
}

/// End-user sockets and chat-server links known to the relay.
pub struct RelayRegistry {
    users: Arc<RwLock<HashMap<String, UserEntry>>>,
    links: Arc<RwLock<HashMap<String, LinkEntry>>>,
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_user(&self, snapshot: SocketSnapshot, outbound: mpsc::UnboundedSender<Outbound>) {
        let mut users = self.users.write().await;
        users.insert(snapshot.id.clone(), UserEntry { snapshot, outbound });
    }

    pub async fn remove_user(&self, id: &str) -> Option<UserEntry> {
        let mut users = self.users.write().await;
        users.remove(id)
    }

    pub async fn user(&self, id: &str) -> Option<SocketSnapshot> {
        let users = self.users.read().await;
        users.get(id).map(|entry| entry.snapshot.clone())
    }

    pub async fn snapshots(&self) -> Vec<SocketSnapshot> {
        let users = self.users.read().await;
        users.values().map(|entry| entry.snapshot.clone()).collect()
    }

    pub async fn user_count(&self) -> usize {
        let users = self.users.read().await;
        users.len()
    }

    pub async fn send_to_user(&self, id: &str, packet: Packet) -> bool {
        let users = self.users.read().await;
        match users.get(id) {
            Some(entry) => entry.outbound.send(Outbound::Packet(packet)).is_ok(),
            None => {
                debug!("Dropping packet for unknown user {}", id);
                false
            }
        }
    }

    /// Adds `room` to the user's rooms. Returns the updated snapshot, or
    /// `None` for an unknown user. Joining twice keeps one entry.
    pub async fn join(&self, id: &str, room: &str) -> Option<SocketSnapshot> {
        let mut users = self.users.write().await;
        let entry = users.get_mut(id)?;
        if !entry.snapshot.rooms.iter().any(|r| r == room) {
            entry.snapshot.rooms.push(room.to_string());
        }
        Some(entry.snapshot.clone())
    }

    /// Returns the updated snapshot, or `None` when the user is unknown or
    /// was not in `room`.
    pub async fn leave(&self, id: &str, room: &str) -> Option<SocketSnapshot> {
        let mut users = self.users.write().await;
        let entry = users.get_mut(id)?;
        let before = entry.snapshot.rooms.len();
        entry.snapshot.rooms.retain(|r| r != room);
        if entry.snapshot.rooms.len() == before {
            return None;
        }
        Some(entry.snapshot.clone())
    }

    /// Sends `packet` to every member of `room` except `except`.
    pub async fn broadcast(&self, room: &str, packet: &Packet, except: Option<&str>) -> usize {
        let users = self.users.read().await;
        let mut delivered = 0;
        for entry in users.values() {
            if except == Some(entry.snapshot.id.as_str()) {
                continue;
            }
            if !entry.snapshot.rooms.iter().any(|r| r == room) {
                continue;
            }
            if entry.outbound.send(Outbound::Packet(packet.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn add_link(&self, sid: String, outbound: mpsc::UnboundedSender<Outbound>) {
        let mut links = self.links.write().await;
        links.insert(
            sid.clone(),
            LinkEntry {
                sid,
                outbound,
                authenticated: false,
            },
        );
    }

    pub async fn authenticate_link(&self, sid: &str) -> bool {
        let mut links = self.links.write().await;
        match links.get_mut(sid) {
            Some(link) => {
                link.authenticated = true;
                true
            }
            None => false,
        }
    }

    pub async fn is_authenticated(&self, sid: &str) -> bool {
        let links = self.links.read().await;
        links.get(sid).is_some_and(|link| link.authenticated)
    }

    pub async fn remove_link(&self, sid: &str) {
        let mut links = self.links.write().await;
        links.remove(sid);
    }

    pub async fn link_count(&self) -> usize {
        let links = self.links.read().await;
        links.values().filter(|link| link.authenticated).count()
    }

    /// Asks every user and link socket to close.
    pub async fn close_all(&self) {
        {
            let users = self.users.read().await;
            for entry in users.values() {
                let _ = entry.outbound.send(Outbound::Close);
            }
        }
        let links = self.links.read().await;
        for link in links.values() {
            let _ = link.outbound.send(Outbound::Close);
        }
    }

    /// Pushes `event` to every authenticated link.
    pub async fn push_to_links(&self, event: RelayEvent) -> usize {
        let name = event.name();
        let packet = match event.into_packet(None) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to encode {}: {}", name, e);
                return 0;
            }
        };

        let links = self.links.read().await;
        let mut delivered = 0;
        for link in links.values().filter(|link| link.authenticated) {
            if link.outbound.send(Outbound::Packet(packet.clone())).is_ok() {
                delivered += 1;
            }
        }
        debug!("Pushed {} to {} links", name, delivered);
        delivered
    }
}
