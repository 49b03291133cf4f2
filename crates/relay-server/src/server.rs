// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::config::Config;
use crate::registry::RelayRegistry;
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
use relay_core::{
    codec, AuthToken, EventPacket, Handshake, Packet, RelayEvent, RoomRequest, SocketSnapshot,
    UserDisconnect, UserUpdate,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upstream relay: end users connect on `/socket`, chat servers on `/proxy`.
pub struct RelayServer {
    config: Config,
    registry: Arc<RelayRegistry>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: Config) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry: Arc::new(RelayRegistry::new()),
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/socket", get(user_upgrade))
            .route("/proxy", get(link_upgrade))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);
        let mut stopped = self.shutdown.subscribe();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stopped.wait_for(|stop| *stop).await;
        })
        .await?;
        info!("Relay stopped");
        Ok(())
    }

    /// Stops accepting connections and closes every user and link socket.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.registry.close_all().await;
    }

    fn accepts(&self, auth: Option<&AuthToken>) -> bool {
        match (&self.config.auth.token, auth) {
            (None, _) => true,
            (Some(expected), Some(token)) => token.matches(expected),
            (Some(_), None) => false,
        }
    }

    async fn serve_user(self: Arc<Self>, socket: WebSocket, handshake: Handshake) {
        let (sender, mut receiver) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(sender, rx);

        if self.registry.user_count().await >= self.config.limits.max_users {
            warn!("User limit {} reached, refusing socket", self.config.limits.max_users);
            let _ = tx.send(Outbound::Packet(Packet::event(
                "error",
                vec![Value::String("user limit reached".to_string())],
            )));
            let _ = tx.send(Outbound::Close);
            let _ = writer.await;
            return;
        }

        let id = Uuid::new_v4().to_string();
        let mut snapshot = SocketSnapshot::new(id.clone());
        snapshot.handshake = handshake;

        let _ = tx.send(Outbound::Packet(Packet::open(id.clone())));
        self.registry.add_user(snapshot.clone(), tx).await;
        info!("User {} connected", id);

        match RelayEvent::connection(&snapshot) {
            Ok(event) => {
                self.registry.push_to_links(event).await;
            }
            Err(e) => error!("Failed to encode snapshot of {}: {}", id, e),
        }

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match codec::decode_packet(&text) {
                    Ok(Packet::Event(event)) => {
                        self.registry
                            .push_to_links(RelayEvent::UserEvent {
                                id: id.clone(),
                                event: event.event,
                                args: event.args,
                            })
                            .await;
                    }
                    Ok(other) => debug!("Ignoring {} packet from user {}", other.packet_type(), id),
                    Err(e) => warn!("Dropping frame from user {}: {}", id, e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.drop_user(&id, "transport close").await;
        writer.abort();
    }

    /// Removes a user and tells every link. Only the first caller for a
    /// given user has any effect.
    async fn drop_user(&self, id: &str, reason: &str) -> bool {
        let Some(entry) = self.registry.remove_user(id).await else {
            return false;
        };
        let _ = entry.outbound.send(Outbound::Close);
        info!("User {} disconnected: {}", id, reason);
        self.registry
            .push_to_links(RelayEvent::UserDisconnect(UserDisconnect {
                id: id.to_string(),
                reason: reason.to_string(),
            }))
            .await;
        true
    }

    async fn serve_link(self: Arc<Self>, socket: WebSocket) {
        let (sender, mut receiver) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(sender, rx);

        let sid = Uuid::new_v4().to_string();
        let _ = tx.send(Outbound::Packet(Packet::open(sid.clone())));
        self.registry.add_link(sid.clone(), tx.clone()).await;
        info!("Proxy link {} opened", sid);

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match codec::decode_packet(&text) {
                    Ok(Packet::Event(packet)) => {
                        self.handle_link_event(&sid, &tx, packet).await;
                    }
                    Ok(other) => debug!("Ignoring {} packet from link {}", other.packet_type(), sid),
                    Err(e) => warn!("Dropping frame from link {}: {}", sid, e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.registry.remove_link(&sid).await;
        writer.abort();
        info!("Proxy link {} closed", sid);
    }

    async fn handle_link_event(
        &self,
        sid: &str,
        tx: &mpsc::UnboundedSender<Outbound>,
        packet: EventPacket,
    ) {
        let ack_id = packet.ack;
        let event = match RelayEvent::from_event(&packet) {
            Ok(event) => event,
            Err(e) => {
                warn!("Invalid {} from link {}: {}", packet.event, sid, e);
                if let Some(ack_id) = ack_id {
                    send_ack(tx, ack_id, false);
                }
                return;
            }
        };

        if let RelayEvent::AuthProxy { auth } = &event {
            let accepted = self.accepts(auth.as_ref());
            if let Some(ack_id) = ack_id {
                send_ack(tx, ack_id, accepted);
            }
            if !accepted {
                warn!("Proxy link {} failed authentication", sid);
                return;
            }
            if self.registry.is_authenticated(sid).await {
                return;
            }
            self.registry.authenticate_link(sid).await;
            info!("Proxy link {} authenticated", sid);

            for snapshot in self.registry.snapshots().await {
                match RelayEvent::connection(&snapshot).and_then(|e| e.into_packet(None)) {
                    Ok(packet) => {
                        let _ = tx.send(Outbound::Packet(packet));
                    }
                    Err(e) => error!("Failed to encode snapshot of {}: {}", snapshot.id, e),
                }
            }
            return;
        }

        if !self.registry.is_authenticated(sid).await {
            debug!("Ignoring {} from unauthenticated link {}", event.name(), sid);
            return;
        }

        match event {
            RelayEvent::ProxyEmit { id, event, args } => {
                self.registry.send_to_user(&id, Packet::event(event, args)).await;
            }
            RelayEvent::UserBroadcast {
                id,
                room,
                event,
                args,
            } => {
                let packet = Packet::event(event, args);
                self.registry.broadcast(&room, &packet, Some(id.as_str())).await;
            }
            RelayEvent::Broadcast { room, event, args } => {
                let packet = Packet::event(event, args);
                self.registry.broadcast(&room, &packet, None).await;
            }
            RelayEvent::UserJoin(RoomRequest { id, room }) => {
                let updated = self.registry.join(&id, &room).await;
                self.finish_room_request(tx, ack_id, id, room, "join", updated)
                    .await;
            }
            RelayEvent::UserLeave(RoomRequest { id, room }) => {
                let updated = self.registry.leave(&id, &room).await;
                self.finish_room_request(tx, ack_id, id, room, "leave", updated)
                    .await;
            }
            RelayEvent::DisconnectUser(request) => {
                debug!(
                    "Link {} disconnects user {} (close={})",
                    sid, request.id, request.close
                );
                self.drop_user(&request.id, "server namespace disconnect")
                    .await;
            }
            other => warn!("Unexpected {} from link {}", other.name(), sid),
        }
    }

    async fn finish_room_request(
        &self,
        tx: &mpsc::UnboundedSender<Outbound>,
        ack_id: Option<u64>,
        id: String,
        room: String,
        kind: &str,
        updated: Option<SocketSnapshot>,
    ) {
        if let Some(ack_id) = ack_id {
            send_ack(tx, ack_id, updated.is_some());
        }

        let Some(snapshot) = updated else {
            return;
        };
        let snapshot = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode snapshot of {}: {}", id, e);
                return;
            }
        };
        self.registry
            .push_to_links(RelayEvent::UserUpdate(UserUpdate {
                id,
                snapshot,
                kind: Some(kind.to_string()),
                room: Some(room),
            }))
            .await;
    }
}

fn send_ack(tx: &mpsc::UnboundedSender<Outbound>, ack_id: u64, ok: bool) {
    let _ = tx.send(Outbound::Packet(Packet::ack(ack_id, vec![Value::Bool(ok)])));
}

async fn user_upgrade(
    State(server): State<Arc<RelayServer>>,
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
    ws.on_upgrade(move |socket| server.serve_user(socket, handshake))
}

async fn link_upgrade(State(server): State<Arc<RelayServer>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| server.serve_link(socket))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
