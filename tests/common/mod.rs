// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use futures::{SinkExt, StreamExt};
use relay_client::{Hub, ProxyClient, ProxyOptions};
use relay_core::{codec, EventPacket, Packet};
use relay_server::config::Config as RelayConfig;
use relay_server::RelayServer;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestEnvironment {
    pub relay_port: u16,
    pub hub_port: u16,
    pub token: String,
    pub relay: Arc<RelayServer>,
    pub hub: Arc<Hub>,
    _relay_handle: JoinHandle<()>,
    _hub_handle: JoinHandle<()>,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .try_init();

        let token = format!("test-token-{}", rand::random::<u32>());
        let relay_port = get_free_port().await;
        let hub_port = get_free_port().await;

        let (relay, relay_handle) = spawn_relay(relay_port, &token).await;

        let hub = Hub::new();
        let hub_handle = {
            let hub = hub.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.serve(hub_port).await {
                    eprintln!("Hub error: {}", e);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;

        Self {
            relay_port,
            hub_port,
            token,
            relay,
            hub,
            _relay_handle: relay_handle,
            _hub_handle: hub_handle,
        }
    }

    pub fn relay_url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}/{}", self.relay_port, path.trim_start_matches('/'))
    }

    #[allow(dead_code)]
    pub fn hub_url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}/{}", self.hub_port, path.trim_start_matches('/'))
    }

    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions::new(self.relay_url("proxy"))
            .with_auth(self.token.clone())
            .with_conn_timeout(Some(Duration::from_millis(50)))
            .with_max_delay(Duration::from_millis(500))
            .with_ack_timeout(Duration::from_secs(2))
    }

    /// A proxy client that has completed the handshake.
    pub async fn connected_proxy(&self) -> ProxyClient {
        let client = ProxyClient::new(self.proxy_options());
        assert!(client.connect().await.expect("proxy handshake failed"));
        client
    }

    #[allow(dead_code)]
    pub async fn restart_relay(&mut self) {
        self.relay.shutdown().await;
        let _ = tokio::time::timeout(STEP_TIMEOUT, &mut self._relay_handle).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (relay, handle) = spawn_relay(self.relay_port, &self.token).await;
        self.relay = relay;
        self._relay_handle = handle;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn get_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_relay(port: u16, token: &str) -> (Arc<RelayServer>, JoinHandle<()>) {
    let mut config = RelayConfig::default();
    config.server.port = port;
    config.auth.token = Some(token.to_string());

    let relay = RelayServer::new(config);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("relay port in use");
    let handle = {
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.serve(listener).await {
                eprintln!("Relay error: {}", e);
            }
        })
    };
    (relay, handle)
}

/// Polls `check` until it holds or `STEP_TIMEOUT` elapses.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// End-user WebSocket client speaking the packet protocol.
pub struct TestSocket {
    pub sid: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestSocket {
    pub async fn connect(url: &str) -> Self {
        let (mut ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("Failed to connect");
        let sid = loop {
            match next_packet(&mut ws).await {
                Some(Packet::Open(open)) => break open.sid,
                Some(other) => panic!("expected open packet, got {:?}", other),
                None => panic!("socket closed before open"),
            }
        };
        Self { sid, ws }
    }

    pub async fn emit(&mut self, event: &str, args: Vec<Value>) {
        let text = codec::encode_packet(&Packet::event(event, args)).unwrap();
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    /// Next event packet, failing the test after `STEP_TIMEOUT`.
    pub async fn next_event(&mut self) -> EventPacket {
        let packet = tokio::time::timeout(STEP_TIMEOUT, next_packet(&mut self.ws))
            .await
            .expect("timed out waiting for event");
        match packet {
            Some(Packet::Event(event)) => event,
            other => panic!("expected event packet, got {:?}", other),
        }
    }

    /// Asserts nothing arrives within `window`.
    #[allow(dead_code)]
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(packet) = tokio::time::timeout(window, next_packet(&mut self.ws)).await {
            panic!("expected no traffic, got {:?}", packet);
        }
    }

    #[allow(dead_code)]
    pub async fn expect_closed(&mut self) {
        let packet = tokio::time::timeout(STEP_TIMEOUT, next_packet(&mut self.ws))
            .await
            .expect("socket was not closed");
        assert!(packet.is_none(), "expected close, got {:?}", packet);
    }

    #[allow(dead_code)]
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

async fn next_packet(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Option<Packet> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(codec::decode_packet(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}
