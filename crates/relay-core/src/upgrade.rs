// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

//! Server-side helpers for sockets accepted through an axum upgrade.

use crate::codec;
use crate::ws::Outbound;
use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use futures::stream::SplitSink;
use futures::SinkExt;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Drains `outbound` into the socket until a `Close` item, a send error, or
/// the channel closing.
pub fn spawn_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Packet(packet) => match codec::encode_packet(&packet) {
                    Ok(text) => {
                        if let Err(e) = sender.send(Message::Text(text)).await {
                            debug!("Socket writer stopped: {}", e);
                            break;
                        }
                    }
                    Err(e) => error!("Dropping {} packet: {}", packet.packet_type(), e),
                },
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    })
}

/// Request headers with non-UTF-8 values left out.
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_headers_to_map_skips_opaque_values() {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("http://chat.local"));
        headers.insert("x-raw", HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());

        let map = headers_to_map(&headers);
        assert_eq!(map.get("origin").map(String::as_str), Some("http://chat.local"));
        assert!(!map.contains_key("x-raw"));
    }
}
