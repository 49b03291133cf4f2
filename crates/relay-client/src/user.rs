// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

//! Local stand-in for a socket that is connected to the relay rather than
//! to this process. Every operation is forwarded over the shared
//! [`RelayLink`]; local state only changes when the relay pushes a snapshot
//! or the facade is disconnected.

use crate::connection::RelayLink;
use crate::socket::{EventListeners, SocketEvent};
use relay_core::{
    value_kind, DisconnectRequest, Error, Handshake, RelayEvent, Result, RoomRequest,
    SocketSnapshot, TransportSnapshot,
};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::debug;

pub fn facade_id(link_sid: &str, remote_id: &str) -> String {
    format!("{}_PROXY_{}", link_sid, remote_id)
}

#[derive(Clone)]
pub struct ProxyUser {
    inner: Arc<UserInner>,
}

struct UserInner {
    id: String,
    remote_id: String,
    link: Arc<RelayLink>,
    state: RwLock<UserState>,
    events: EventListeners,
}

struct UserState {
    snapshot: SocketSnapshot,
    data: Value,
    connected: bool,
    disconnected: bool,
}

/// Room broadcast requested on behalf of a facade.
pub struct UserBroadcast<'a> {
    user: &'a ProxyUser,
    room: String,
}

impl UserBroadcast<'_> {
    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        if self.user.is_disconnected() {
            return false;
        }
        self.user.inner.link.send(RelayEvent::UserBroadcast {
            id: self.user.inner.remote_id.clone(),
            room: self.room.clone(),
            event: event.to_string(),
            args,
        })
    }
}

impl ProxyUser {
    pub fn new(link: Arc<RelayLink>, snapshot: SocketSnapshot) -> Self {
        let remote_id = snapshot.id.clone();
        Self {
            inner: Arc::new(UserInner {
                id: facade_id(link.sid(), &remote_id),
                remote_id,
                link,
                state: RwLock::new(UserState {
                    snapshot,
                    data: Value::Object(Default::default()),
                    connected: true,
                    disconnected: false,
                }),
                events: EventListeners::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn remote_id(&self) -> &str {
        &self.inner.remote_id
    }

    pub fn rooms(&self) -> Vec<String> {
        self.state().snapshot.rooms.clone()
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.state().snapshot.rooms.iter().any(|r| r == room)
    }

    pub fn handshake(&self) -> Handshake {
        self.state().snapshot.handshake.clone()
    }

    pub fn transport(&self) -> TransportSnapshot {
        self.state().snapshot.transport.clone()
    }

    pub fn protocol(&self) -> u8 {
        self.state().snapshot.protocol
    }

    pub fn nsp(&self) -> String {
        self.state().snapshot.nsp.clone()
    }

    pub fn data(&self) -> Value {
        self.state().data.clone()
    }

    /// Replaces the data bag. Only JSON objects are accepted.
    pub fn set_data(&self, data: Value) -> Result<()> {
        if !data.is_object() {
            return Err(Error::InvalidArgument(format!(
                "data must be an object, got {}",
                value_kind(&data)
            )));
        }
        self.state_mut().data = data;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state().disconnected
    }

    /// Asks the relay to deliver an event to the remote socket. The return
    /// value only says the request left this process.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.inner.link.send(RelayEvent::ProxyEmit {
            id: self.inner.remote_id.clone(),
            event: event.to_string(),
            args,
        })
    }

    pub fn to(&self, room: impl Into<String>) -> UserBroadcast<'_> {
        UserBroadcast {
            user: self,
            room: room.into(),
        }
    }

    pub async fn join(&self, room: &str) -> bool {
        self.room_request(RelayEvent::UserJoin(RoomRequest {
            id: self.inner.remote_id.clone(),
            room: room.to_string(),
        }))
        .await
    }

    pub async fn leave(&self, room: &str) -> bool {
        self.room_request(RelayEvent::UserLeave(RoomRequest {
            id: self.inner.remote_id.clone(),
            room: room.to_string(),
        }))
        .await
    }

    async fn room_request(&self, event: RelayEvent) -> bool {
        if self.is_disconnected() {
            return false;
        }
        let name = event.name();
        match self.inner.link.request(event).await {
            Ok(args) => matches!(args.first(), Some(Value::Bool(true))),
            Err(e) => {
                debug!("{} for {} not confirmed: {}", name, self.inner.id, e);
                false
            }
        }
    }

    /// Ends the remote session. With `close` the relay also closes the
    /// underlying transport. The local transition happens immediately.
    pub fn disconnect(&self, close: bool) {
        if self.is_disconnected() {
            return;
        }
        self.inner.link.send(RelayEvent::DisconnectUser(DisconnectRequest {
            id: self.inner.remote_id.clone(),
            close,
        }));
        self.mark_disconnected("server namespace disconnect");
    }

    pub fn disconnect_value(&self, close: &Value) -> Result<()> {
        match close {
            Value::Bool(close) => {
                self.disconnect(*close);
                Ok(())
            }
            other => Err(Error::InvalidArgument(format!(
                "close must be a boolean, got {}",
                value_kind(other)
            ))),
        }
    }

    /// Receives events sent by the remote socket plus local notifications
    /// (`join`, `leave`, `disconnect`). The receiver ends on disconnect.
    /// Events pushed before the first subscription are replayed to it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.inner.events.subscribe()
    }

    /// Replaces all mirrored fields with the pushed snapshot and fires the
    /// notification, if any.
    pub(crate) fn apply_update(
        &self,
        snapshot: SocketSnapshot,
        kind: Option<String>,
        room: Option<String>,
    ) {
        {
            let mut state = self.state_mut();
            if state.disconnected {
                return;
            }
            state.snapshot = snapshot;
        }

        if let Some(kind) = kind {
            let args = room.map(|r| vec![Value::String(r)]).unwrap_or_default();
            self.deliver(SocketEvent::notification(kind, args));
        }
    }

    pub(crate) fn mark_disconnected(&self, reason: &str) {
        {
            let mut state = self.state_mut();
            if state.disconnected {
                return;
            }
            state.connected = false;
            state.disconnected = true;
            state.snapshot.rooms.clear();
        }

        self.inner.events.close(SocketEvent::notification(
            "disconnect",
            vec![Value::String(reason.to_string())],
        ));
    }

    pub(crate) fn deliver(&self, event: SocketEvent) {
        self.inner.events.deliver(event);
    }

    fn state(&self) -> RwLockReadGuard<'_, UserState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, UserState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProxyUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyUser")
            .field("id", &self.inner.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}
