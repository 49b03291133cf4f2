// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::dispatcher::Connection;
use serde_json::Value;
use tracing::{debug, info};

/// Minimal room chat: `join` enters a room, `message` goes to everyone else
/// in the sender's current room. Local notifications are not requests; only
/// `disconnect` ends the session.
pub async fn room_chat(conn: Connection) {
    let mut events = conn.socket.subscribe();
    let mut room: Option<String> = None;

    info!(
        "Chat client {} connected (proxied: {})",
        conn.socket.id(),
        conn.is_proxy
    );

    while let Some(event) = events.recv().await {
        if event.is_notification() {
            if event.name == "disconnect" {
                break;
            }
            continue;
        }
        match event.name.as_str() {
            "join" => {
                let Some(Value::String(next)) = event.args.first().cloned() else {
                    continue;
                };
                if let Some(previous) = room.take() {
                    conn.socket.leave(&previous).await;
                }
                if conn.socket.join(&next).await {
                    conn.delivery
                        .socket_emit("joined", vec![Value::String(next.clone())])
                        .await;
                    room = Some(next);
                }
            }
            "message" => {
                if let Some(room) = &room {
                    let mut args = vec![Value::String(conn.socket.id().to_string())];
                    args.extend(event.args);
                    conn.delivery.socket_to(room, "message", args).await;
                }
            }
            other => debug!("Ignoring {} from {}", other, conn.socket.id()),
        }
    }

    info!("Chat client {} left", conn.socket.id());
}
