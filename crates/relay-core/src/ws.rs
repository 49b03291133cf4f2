// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::{codec, Error, Packet, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Work item for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Packet(Packet),
    Close,
}

pub async fn send_packet<S>(sink: &mut S, packet: &Packet) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = codec::encode_packet(packet)?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| Error::Connection(e.to_string()))
}

/// Reads the next packet, skipping control frames. `Ok(None)` means the
/// peer closed the socket.
pub async fn recv_packet<S, E>(stream: &mut S) -> Result<Option<Packet>>
where
    S: Stream<Item = std::result::Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => return codec::decode_packet(&text).map(Some),
            Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Error::Connection(e.to_string())),
        }
    }
}

/// Waits for the server's `open` packet and returns the assigned sid.
pub async fn expect_open<S, E>(stream: &mut S) -> Result<String>
where
    S: Stream<Item = std::result::Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    match recv_packet(stream).await? {
        Some(Packet::Open(open)) => Ok(open.sid),
        Some(other) => Err(Error::InvalidPacket(format!(
            "expected open packet, got {}",
            other.packet_type()
        ))),
        None => Err(Error::Connection("stream closed".to_string())),
    }
}
