// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::hub::LocalSocket;
use crate::user::ProxyUser;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Sent by the client over its transport.
    Client,
    /// Raised by this process: room updates and `disconnect`.
    Notification,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub name: String,
    pub args: Vec<Value>,
    pub origin: EventOrigin,
}

impl SocketEvent {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
            origin: EventOrigin::Client,
        }
    }

    pub fn notification(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
            origin: EventOrigin::Notification,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.origin == EventOrigin::Notification
    }
}

/// Event fan-out for one socket.
///
/// Events delivered before the first subscription are held and replayed to
/// it. Once someone has subscribed, events with no live receiver are
/// dropped. After `close` every receiver ends and new ones start closed.
#[derive(Default)]
pub(crate) struct EventListeners {
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    senders: Vec<mpsc::UnboundedSender<SocketEvent>>,
    backlog: Vec<SocketEvent>,
    subscribed: bool,
    closed: bool,
}

impl EventListeners {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        if state.closed {
            return rx;
        }
        for event in state.backlog.drain(..) {
            let _ = tx.send(event);
        }
        state.subscribed = true;
        state.senders.push(tx);
        rx
    }

    pub(crate) fn deliver(&self, event: SocketEvent) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        if !state.subscribed {
            state.backlog.push(event);
            return;
        }
        state
            .senders
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Sends `last` to the current receivers, then ends them.
    pub(crate) fn close(&self, last: SocketEvent) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        state.backlog.clear();
        for sender in state.senders.drain(..) {
            let _ = sender.send(last.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn held(&self) -> usize {
        self.state().backlog.len()
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connected client as seen by application code, whichever transport it
/// arrived on.
#[derive(Debug, Clone)]
pub enum ClientSocket {
    Local(LocalSocket),
    Proxy(ProxyUser),
}

impl ClientSocket {
    pub fn id(&self) -> &str {
        match self {
            ClientSocket::Local(socket) => socket.id(),
            ClientSocket::Proxy(user) => user.id(),
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, ClientSocket::Proxy(_))
    }

    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        match self {
            ClientSocket::Local(socket) => socket.emit(event, args),
            ClientSocket::Proxy(user) => user.emit(event, args),
        }
    }

    pub async fn join(&self, room: &str) -> bool {
        match self {
            ClientSocket::Local(socket) => socket.join(room).await,
            ClientSocket::Proxy(user) => user.join(room).await,
        }
    }

    pub async fn leave(&self, room: &str) -> bool {
        match self {
            ClientSocket::Local(socket) => socket.leave(room).await,
            ClientSocket::Proxy(user) => user.leave(room).await,
        }
    }

    pub async fn rooms(&self) -> Vec<String> {
        match self {
            ClientSocket::Local(socket) => socket.rooms().await,
            ClientSocket::Proxy(user) => user.rooms(),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        match self {
            ClientSocket::Local(socket) => socket.subscribe(),
            ClientSocket::Proxy(user) => user.subscribe(),
        }
    }

    pub fn disconnect(&self) {
        match self {
            ClientSocket::Local(socket) => socket.disconnect(),
            ClientSocket::Proxy(user) => user.disconnect(false),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        match self {
            ClientSocket::Local(socket) => socket.is_disconnected(),
            ClientSocket::Proxy(user) => user.is_disconnected(),
        }
    }
}
