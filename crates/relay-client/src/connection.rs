// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::pending::PendingAcks;
use futures::{SinkExt, StreamExt};
use relay_core::ws::{self, Outbound};
use relay_core::{AuthToken, Error, EventPacket, Packet, RelayEvent, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One WebSocket connection to the relay, shared by the proxy client and
/// every facade created from it.
pub struct RelayLink {
    sid: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingAcks,
    ack_timeout: Duration,
    closed: AtomicBool,
}

impl RelayLink {
    /// Builds a link around an outbound queue. The caller drains the
    /// returned receiver into the actual socket.
    pub fn channel(
        sid: impl Into<String>,
        ack_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            sid: sid.into(),
            outbound: tx,
            pending: PendingAcks::new(),
            ack_timeout,
            closed: AtomicBool::new(false),
        });
        (link, rx)
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    /// Fire-and-forget. Returns whether the event was queued.
    pub fn send(&self, event: RelayEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        let name = event.name();
        match event.into_packet(None) {
            Ok(packet) => self.outbound.send(Outbound::Packet(packet)).is_ok(),
            Err(e) => {
                warn!("Failed to encode {}: {}", name, e);
                false
            }
        }
    }

    /// Sends an event that expects an acknowledgement and waits for it.
    pub async fn request(&self, event: RelayEvent) -> Result<Vec<Value>> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }

        let (ack_id, rx) = self.pending.register().await;
        let packet = match event.into_packet(Some(ack_id)) {
            Ok(packet) => packet,
            Err(e) => {
                self.pending.cancel(ack_id).await;
                return Err(e);
            }
        };

        if self.outbound.send(Outbound::Packet(packet)).is_err() {
            self.pending.cancel(ack_id).await;
            return Err(Error::NotConnected);
        }

        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(args)) => Ok(args),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.pending.cancel(ack_id).await;
                Err(Error::RequestTimeout)
            }
        }
    }

    pub async fn complete_ack(&self, ack_id: u64, args: Vec<Value>) -> bool {
        self.pending.complete(ack_id, args).await
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.cancel_all().await;
    }
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("sid", &self.sid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens the transport and waits for the relay to assign a sid.
///
/// Returns the link and the stream of relay events. The stream ends when the
/// transport closes, after pending acknowledgements have been dropped.
pub async fn open(
    address: &str,
    ack_timeout: Duration,
) -> Result<(Arc<RelayLink>, mpsc::UnboundedReceiver<EventPacket>)> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(address)
        .await
        .map_err(|e| Error::Connection(format!("connection failed: {}", e)))?;

    let (mut sink, mut stream) = ws_stream.split();
    let sid = ws::expect_open(&mut stream).await?;
    info!("Relay transport open, sid={}", sid);

    let (link, mut outbound) = RelayLink::channel(sid, ack_timeout);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Packet(packet) => {
                    if let Err(e) = ws::send_packet(&mut sink, &packet).await {
                        warn!("Failed to write to relay: {}", e);
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    let reader_link = link.clone();
    tokio::spawn(async move {
        loop {
            match ws::recv_packet(&mut stream).await {
                Ok(Some(Packet::Ack(ack))) => {
                    if !reader_link.complete_ack(ack.ack, ack.args).await {
                        debug!("Ack {} arrived with no waiter", ack.ack);
                    }
                }
                Ok(Some(Packet::Event(event))) => {
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
                Ok(Some(Packet::Open(_))) => {
                    warn!("Ignoring repeated open packet on sid={}", reader_link.sid());
                }
                Ok(None) => break,
                Err(Error::InvalidPacket(e)) => {
                    warn!("Dropping malformed relay frame: {}", e);
                }
                Err(e) => {
                    warn!("Relay transport error: {}", e);
                    break;
                }
            }
        }
        reader_link.close();
        reader_link.shutdown().await;
    });

    Ok((link, events_rx))
}

/// Performs the `AUTH_PROXY` round trip. Only an acknowledgement of `true`
/// counts as success.
pub async fn authenticate(link: &RelayLink, auth: Option<AuthToken>) -> Result<()> {
    let args = link.request(RelayEvent::AuthProxy { auth }).await?;
    match args.first() {
        Some(Value::Bool(true)) => Ok(()),
        _ => Err(Error::AuthenticationFailed),
    }
}
