// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::socket::{EventListeners, SocketEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use relay_core::upgrade::{headers_to_map, spawn_writer};
use relay_core::ws::Outbound;
use relay_core::{codec, Handshake, Packet};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Real-time server for clients connected directly to this process.
pub struct Hub {
    sockets: RwLock<HashMap<String, LocalSocket>>,
    rooms: RwLock<HashMap<String, HashSet<String>>>,
    connections: broadcast::Sender<LocalSocket>,
}

#[derive(Clone)]
pub struct LocalSocket {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    id: String,
    hub: Weak<Hub>,
    outbound: mpsc::UnboundedSender<Outbound>,
    handshake: Handshake,
    events: EventListeners,
    disconnected: AtomicBool,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (connections, _) = broadcast::channel(256);
        Arc::new(Self {
            sockets: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            connections,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalSocket> {
        self.connections.subscribe()
    }

    /// Adds a socket and announces it. The returned receiver yields the
    /// frames to write to the client, starting with its `open` packet.
    pub async fn register(
        self: &Arc<Self>,
        handshake: Handshake,
    ) -> (LocalSocket, mpsc::UnboundedReceiver<Outbound>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Outbound::Packet(Packet::open(id.clone())));

        let socket = LocalSocket {
            inner: Arc::new(LocalInner {
                id: id.clone(),
                hub: Arc::downgrade(self),
                outbound: tx,
                handshake,
                events: EventListeners::default(),
                disconnected: AtomicBool::new(false),
            }),
        };

        {
            let mut sockets = self.sockets.write().await;
            sockets.insert(id.clone(), socket.clone());
        }

        info!("Local socket {} connected", id);
        let _ = self.connections.send(socket.clone());
        (socket, rx)
    }

    pub async fn socket(&self, id: &str) -> Option<LocalSocket> {
        let sockets = self.sockets.read().await;
        sockets.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        let sockets = self.sockets.read().await;
        sockets.len()
    }

    pub async fn join(&self, id: &str, room: &str) -> bool {
        if !self.sockets.read().await.contains_key(id) {
            return false;
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.to_string());
        true
    }

    pub async fn leave(&self, id: &str, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(id);
        if members.is_empty() {
            rooms.remove(room);
        }
        removed
    }

    pub async fn rooms_of(&self, id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut joined: Vec<String> = rooms
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(room, _)| room.clone())
            .collect();
        joined.sort();
        joined
    }

    pub async fn members(&self, room: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends an event to every member of `room` except `except`. Returns
    /// the number of sockets written to.
    pub async fn broadcast(
        &self,
        room: &str,
        event: &str,
        args: Vec<Value>,
        except: Option<&str>,
    ) -> usize {
        let members = self.members(room).await;
        let sockets = self.sockets.read().await;

        let mut delivered = 0;
        for id in members {
            if except == Some(id.as_str()) {
                continue;
            }
            if let Some(socket) = sockets.get(&id) {
                if socket.emit(event, args.clone()) {
                    delivered += 1;
                }
            }
        }
        debug!("Broadcast {} to {} ({} sockets)", event, room, delivered);
        delivered
    }

    pub async fn remove(&self, id: &str) {
        let socket = {
            let mut sockets = self.sockets.write().await;
            sockets.remove(id)
        };

        {
            let mut rooms = self.rooms.write().await;
            rooms.retain(|_, members| {
                members.remove(id);
                !members.is_empty()
            });
        }

        if let Some(socket) = socket {
            socket.mark_disconnected("transport close");
            info!("Local socket {} disconnected", id);
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/socket", get(socket_upgrade))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(self: Arc<Self>, port: u16) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Hub listening on {}", addr);
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    async fn serve_socket(self: Arc<Self>, socket: WebSocket, handshake: Handshake) {
        let (local, outbound) = self.register(handshake).await;
        let (mut sender, mut receiver) = socket.split();

        let writer = spawn_writer(sender, outbound);

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match codec::decode_packet(&text) {
                    Ok(Packet::Event(event)) => {
                        local.deliver(SocketEvent::new(event.event, event.args));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Dropping frame from {}: {}", local.id(), e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        writer.abort();
        self.remove(local.id()).await;
    }
}

impl LocalSocket {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn handshake(&self) -> &Handshake {
        &self.inner.handshake
    }

    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.inner
            .outbound
            .send(Outbound::Packet(Packet::event(event, args)))
            .is_ok()
    }

    pub async fn join(&self, room: &str) -> bool {
        match self.inner.hub.upgrade() {
            Some(hub) if !self.is_disconnected() => hub.join(self.id(), room).await,
            _ => false,
        }
    }

    pub async fn leave(&self, room: &str) -> bool {
        match self.inner.hub.upgrade() {
            Some(hub) => hub.leave(self.id(), room).await,
            None => false,
        }
    }

    pub async fn rooms(&self) -> Vec<String> {
        match self.inner.hub.upgrade() {
            Some(hub) => hub.rooms_of(self.id()).await,
            None => Vec::new(),
        }
    }

    /// Registers an event listener. The first listener also receives any
    /// events the client sent before it subscribed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.inner.events.subscribe()
    }

    /// Closes the client's transport and drops it from the hub.
    pub fn disconnect(&self) {
        if self.is_disconnected() {
            return;
        }
        let _ = self.inner.outbound.send(Outbound::Close);
        self.mark_disconnected("server namespace disconnect");

        if let Some(hub) = self.inner.hub.upgrade() {
            let id = self.inner.id.clone();
            tokio::spawn(async move { hub.remove(&id).await });
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn deliver(&self, event: SocketEvent) {
        self.inner.events.deliver(event);
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.close(SocketEvent::notification(
            "disconnect",
            vec![Value::String(reason.to_string())],
        ));
    }
}

impl std::fmt::Debug for LocalSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSocket")
            .field("id", &self.inner.id)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

async fn socket_upgrade(
    State(hub): State<Arc<Hub>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<BTreeMap<String, String>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let address = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let handshake = Handshake::new(headers_to_map(&headers), query, uri.to_string(), address);
    ws.on_upgrade(move |socket| hub.serve_socket(socket, handshake))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connect(hub: &Arc<Hub>) -> (LocalSocket, mpsc::UnboundedReceiver<Outbound>) {
        let (socket, mut rx) = hub.register(Handshake::default()).await;
        match rx.recv().await {
            Some(Outbound::Packet(Packet::Open(open))) => assert_eq!(open.sid, socket.id()),
            other => panic!("expected open packet, got {:?}", other),
        }
        (socket, rx)
    }

    fn event_name(item: Option<Outbound>) -> String {
        match item {
            Some(Outbound::Packet(Packet::Event(ev))) => ev.event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_announces_connection() {
        let hub = Hub::new();
        let mut connections = hub.subscribe();
        let (socket, _rx) = connect(&hub).await;

        let announced = connections.recv().await.unwrap();
        assert_eq!(announced.id(), socket.id());
        assert_eq!(hub.count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_socket() {
        let hub = Hub::new();
        let (a, mut rx_a) = connect(&hub).await;
        let (b, mut rx_b) = connect(&hub).await;
        let (_c, mut rx_c) = connect(&hub).await;

        assert!(a.join("room").await);
        assert!(b.join("room").await);

        let delivered = hub
            .broadcast("room", "msg", vec![json!("x")], Some(a.id()))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(event_name(rx_b.recv().await), "msg");
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_and_rooms() {
        let hub = Hub::new();
        let (a, _rx) = connect(&hub).await;

        assert!(a.join("b-room").await);
        assert!(a.join("a-room").await);
        assert_eq!(a.rooms().await, vec!["a-room", "b-room"]);

        assert!(a.leave("a-room").await);
        assert!(!a.leave("a-room").await);
        assert_eq!(a.rooms().await, vec!["b-room"]);
    }

    #[tokio::test]
    async fn test_remove_clears_membership_and_listeners() {
        let hub = Hub::new();
        let (a, _rx) = connect(&hub).await;
        let mut events = a.subscribe();
        a.join("room").await;

        hub.remove(a.id()).await;

        assert!(hub.members("room").await.is_empty());
        assert!(a.is_disconnected());
        assert_eq!(events.recv().await.unwrap().name, "disconnect");
        assert!(events.recv().await.is_none());
        assert!(!a.emit("x", vec![]));
        assert!(!a.join("room").await);
    }

    #[tokio::test]
    async fn test_disconnect_sends_close() {
        let hub = Hub::new();
        let (a, mut rx) = connect(&hub).await;

        a.disconnect();
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(a.is_disconnected());
    }

    #[tokio::test]
    async fn test_early_events_are_held_for_first_subscriber() {
        let hub = Hub::new();
        let (a, _rx) = connect(&hub).await;

        a.deliver(SocketEvent::new("join", vec![json!("lobby")]));
        let mut events = a.subscribe();
        assert_eq!(events.recv().await.unwrap().name, "join");

        let mut late = a.subscribe();
        a.deliver(SocketEvent::new("message", vec![]));
        assert_eq!(events.recv().await.unwrap().name, "message");
        assert_eq!(late.recv().await.unwrap().name, "message");
    }

    #[tokio::test]
    async fn test_events_not_held_after_subscriber_drops() {
        let hub = Hub::new();
        let (a, _rx) = connect(&hub).await;
        drop(a.subscribe());

        for n in 0..100 {
            a.deliver(SocketEvent::new("message", vec![json!(n)]));
        }
        assert_eq!(a.inner.events.held(), 0);
    }

    #[tokio::test]
    async fn test_deliver_reaches_subscribers() {
        let hub = Hub::new();
        let (a, _rx) = connect(&hub).await;
        let mut events = a.subscribe();

        a.deliver(SocketEvent::new("message", vec![json!("hi")]));
        assert_eq!(
            events.recv().await.unwrap(),
            SocketEvent::new("message", vec![json!("hi")])
        );
    }
}
