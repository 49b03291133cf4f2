// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::config::Config;
use crate::connection::{self, RelayLink};
use crate::reconnect::ReconnectStrategy;
use crate::user::ProxyUser;
use relay_core::{
    value_kind, AuthToken, Error, EventPacket, RelayEvent, Result, SocketSnapshot,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_millis(500);

/// Construction-time settings of a [`ProxyClient`].
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub address: String,
    pub auth: Option<AuthToken>,
    /// Base retry interval. `None` retries without an initial delay.
    pub conn_timeout: Option<Duration>,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
    pub ack_timeout: Duration,
}

impl ProxyOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auth: None,
            conn_timeout: Some(DEFAULT_CONN_TIMEOUT),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            ack_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.relay.address.clone(),
            auth: config.auth.token.clone().map(AuthToken::Text),
            conn_timeout: config.reconnect.conn_timeout_ms.map(Duration::from_millis),
            max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
            max_attempts: config.reconnect.max_attempts,
            ack_timeout: Duration::from_millis(config.requests.ack_timeout_ms),
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: impl Into<AuthToken>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    #[must_use]
    pub fn with_conn_timeout(mut self, conn_timeout: Option<Duration>) -> Self {
        self.conn_timeout = conn_timeout;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Connect,
    Disconnect,
    Connection(ProxyUser),
}

/// Outbound link from this chat server to the upstream relay.
///
/// `connected` is only true once the transport is open, the relay has
/// assigned a sid and the `AUTH_PROXY` handshake was acknowledged. When an
/// established link drops while the client is enabled, a retry task
/// reconnects with exponential backoff until [`ProxyClient::disconnect`]
/// cancels it.
#[derive(Clone)]
pub struct ProxyClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: RwLock<ProxyOptions>,
    link: RwLock<Option<Arc<RelayLink>>>,
    generation: AtomicU64,
    enabled: AtomicBool,
    first_time: AtomicBool,
    authenticated: AtomicBool,
    connecting: tokio::sync::Mutex<()>,
    users: RwLock<HashMap<String, ProxyUser>>,
    events: broadcast::Sender<ProxyEvent>,
    retry: Mutex<Option<JoinHandle<()>>>,
}

/// Room broadcast issued by this server through the relay.
pub struct RelayRoom<'a> {
    client: &'a ProxyClient,
    room: String,
}

impl RelayRoom<'_> {
    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        match self.client.current_link() {
            Some(link) if self.client.is_connected() => link.send(RelayEvent::Broadcast {
                room: self.room.clone(),
                event: event.to_string(),
                args,
            }),
            _ => false,
        }
    }
}

impl ProxyClient {
    pub fn new(options: ProxyOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ClientInner {
                options: RwLock::new(options),
                link: RwLock::new(None),
                generation: AtomicU64::new(0),
                enabled: AtomicBool::new(false),
                first_time: AtomicBool::new(true),
                authenticated: AtomicBool::new(false),
                connecting: tokio::sync::Mutex::new(()),
                users: RwLock::new(HashMap::new()),
                events,
                retry: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.events.subscribe()
    }

    pub fn options(&self) -> ProxyOptions {
        self.inner
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sets the credential for the next handshake. Accepts a string, a
    /// number or null.
    pub fn set_auth(&self, value: &Value) -> Result<()> {
        let auth = AuthToken::from_value(value)?;
        self.options_mut().auth = auth;
        Ok(())
    }

    /// Sets the retry interval in milliseconds, or null for no initial delay.
    pub fn set_conn_timeout(&self, value: &Value) -> Result<()> {
        let conn_timeout = match value {
            Value::Null => None,
            Value::Number(n) => match n.as_f64() {
                Some(ms) if ms.is_finite() && ms >= 0.0 => {
                    Some(Duration::from_secs_f64(ms / 1000.0))
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "connTimeout must be a non-negative number, got {}",
                        n
                    )))
                }
            },
            other => {
                return Err(Error::InvalidArgument(format!(
                    "connTimeout must be a number or null, got {}",
                    value_kind(other)
                )))
            }
        };
        self.options_mut().conn_timeout = conn_timeout;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_first_time(&self) -> bool {
        self.inner.first_time.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.is_enabled()
            && self.inner.authenticated.load(Ordering::SeqCst)
            && self.current_link().is_some_and(|link| !link.is_closed())
    }

    /// Transport id assigned by the relay, while a link is open.
    pub fn sid(&self) -> Option<String> {
        self.current_link()
            .filter(|link| !link.is_closed())
            .map(|link| link.sid().to_string())
    }

    pub fn users(&self) -> Vec<ProxyUser> {
        self.inner
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn user(&self, remote_id: &str) -> Option<ProxyUser> {
        self.inner
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote_id)
            .cloned()
    }

    pub fn to(&self, room: impl Into<String>) -> RelayRoom<'_> {
        RelayRoom {
            client: self,
            room: room.into(),
        }
    }

    /// Connects and authenticates. Resolves `Ok(false)` when already
    /// connected, without repeating the handshake. A failure while the
    /// client stays enabled hands over to the retry task.
    pub async fn connect(&self) -> Result<bool> {
        self.inner.enabled.store(true, Ordering::SeqCst);
        self.inner.first_time.store(false, Ordering::SeqCst);

        let result = self.try_connect().await;
        if result.is_err() && self.should_reconnect() {
            self.ensure_retry();
        }
        result
    }

    async fn try_connect(&self) -> Result<bool> {
        let _guard = self.inner.connecting.lock().await;

        if self.is_connected() {
            return Ok(false);
        }

        let link = match self.current_link() {
            Some(link) if !link.is_closed() => link,
            _ => self.open_link().await?,
        };

        let auth = self.options().auth;
        if let Err(e) = connection::authenticate(&link, auth).await {
            warn!("Relay handshake failed on sid={}: {}", link.sid(), e);
            if matches!(e, Error::AuthenticationFailed) {
                link.close();
            }
            return Err(e);
        }

        if !self.is_enabled() {
            link.close();
            return Err(Error::NotConnected);
        }

        self.inner.authenticated.store(true, Ordering::SeqCst);
        info!("Proxy link authenticated, sid={}", link.sid());
        let _ = self.inner.events.send(ProxyEvent::Connect);
        Ok(true)
    }

    /// Closes the link and stops reconnecting. A later [`connect`] starts
    /// over as a first connection.
    ///
    /// [`connect`]: ProxyClient::connect
    pub fn disconnect(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.first_time.store(true, Ordering::SeqCst);

        if let Some(handle) = self.retry_slot().take() {
            handle.abort();
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let link = self
            .inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            link.close();
        }

        self.drop_session("client namespace disconnect");
    }

    fn current_link(&self) -> Option<Arc<RelayLink>> {
        self.inner
            .link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn options_mut(&self) -> std::sync::RwLockWriteGuard<'_, ProxyOptions> {
        self.inner
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn retry_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_reconnect(&self) -> bool {
        self.is_enabled() && !self.is_connected() && !self.is_first_time()
    }

    async fn open_link(&self) -> Result<Arc<RelayLink>> {
        let options = self.options();
        let (link, incoming) = connection::open(&options.address, options.ack_timeout).await?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(link.clone());

        tokio::spawn(self.clone().route_incoming(link.clone(), incoming, generation));
        Ok(link)
    }

    async fn route_incoming(
        self,
        link: Arc<RelayLink>,
        mut incoming: mpsc::UnboundedReceiver<EventPacket>,
        generation: u64,
    ) {
        while let Some(packet) = incoming.recv().await {
            match RelayEvent::from_event(&packet) {
                Ok(event) => self.handle_push(&link, event),
                Err(e) => warn!("Dropping relay event {}: {}", packet.event, e),
            }
        }
        self.handle_link_lost(generation);
    }

    fn handle_push(&self, link: &Arc<RelayLink>, event: RelayEvent) {
        match event {
            RelayEvent::Connection(value) => {
                let snapshot = match SocketSnapshot::from_value(value) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("Ignoring proxied connection: {}", e);
                        return;
                    }
                };
                let user = ProxyUser::new(link.clone(), snapshot);
                let previous = self
                    .inner
                    .users
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(user.remote_id().to_string(), user.clone());
                if let Some(previous) = previous {
                    previous.mark_disconnected("transport close");
                }
                info!("Proxied socket {} connected", user.id());
                let _ = self.inner.events.send(ProxyEvent::Connection(user));
            }
            RelayEvent::UserUpdate(update) => {
                let Some(user) = self.user(&update.id) else {
                    debug!("Update for unknown proxied socket {}", update.id);
                    return;
                };
                match SocketSnapshot::from_value(update.snapshot) {
                    Ok(snapshot) if snapshot.id == update.id => {
                        user.apply_update(snapshot, update.kind, update.room);
                    }
                    Ok(snapshot) => warn!(
                        "Snapshot id {} does not match update target {}",
                        snapshot.id, update.id
                    ),
                    Err(e) => warn!("Ignoring update for {}: {}", user.id(), e),
                }
            }
            RelayEvent::UserDisconnect(gone) => {
                let user = self
                    .inner
                    .users
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&gone.id);
                if let Some(user) = user {
                    info!("Proxied socket {} disconnected: {}", user.id(), gone.reason);
                    user.mark_disconnected(&gone.reason);
                }
            }
            RelayEvent::UserEvent { id, event, args } => match self.user(&id) {
                Some(user) => user.deliver(crate::socket::SocketEvent::new(event, args)),
                None => debug!("Event {} for unknown proxied socket {}", event, id),
            },
            other => warn!("Unexpected {} from relay", other.name()),
        }
    }

    fn handle_link_lost(&self, generation: u64) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        {
            let mut link = self
                .inner
                .link
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *link = None;
        }

        warn!("Relay link lost");
        let was_connected = self.drop_session("transport close");

        if self.should_reconnect() {
            if was_connected {
                self.restart_retry();
            } else {
                self.ensure_retry();
            }
        }
    }

    fn drop_session(&self, reason: &str) -> bool {
        let was_connected = self.inner.authenticated.swap(false, Ordering::SeqCst);

        let users: Vec<ProxyUser> = self
            .inner
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, user)| user)
            .collect();
        for user in users {
            user.mark_disconnected(reason);
        }

        if was_connected {
            let _ = self.inner.events.send(ProxyEvent::Disconnect);
        }
        was_connected
    }

    fn ensure_retry(&self) {
        let mut slot = self.retry_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(self.clone().retry_loop()));
    }

    fn restart_retry(&self) {
        let mut slot = self.retry_slot();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(self.clone().retry_loop()));
    }

    async fn retry_loop(self) {
        let options = self.options();
        let mut strategy =
            ReconnectStrategy::new(options.conn_timeout, options.max_delay, options.max_attempts);

        loop {
            if !strategy.wait_before_retry().await {
                error!(
                    "Giving up on relay after {} reconnect attempts",
                    strategy.attempt
                );
                break;
            }

            if !self.should_reconnect() {
                break;
            }

            match self.try_connect().await {
                Ok(_) => {
                    info!("Reconnected to relay after {} attempts", strategy.attempt);
                    break;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", strategy.attempt, e),
            }
        }
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("enabled", &self.is_enabled())
            .field("connected", &self.is_connected())
            .field("first_time", &self.is_first_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use relay_core::{codec, Packet, AUTH_PROXY};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Minimal relay: assigns a sid, answers `AUTH_PROXY` with `accept`
    /// and records every handshake credential it sees.
    struct FakeRelay {
        address: String,
        accepted: Arc<AtomicUsize>,
        handshakes: Arc<Mutex<Vec<Value>>>,
        _task: JoinHandle<()>,
    }

    impl FakeRelay {
        async fn start(accept: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = format!("ws://{}", listener.local_addr().unwrap());
            let accepted = Arc::new(AtomicUsize::new(0));
            let handshakes = Arc::new(Mutex::new(Vec::new()));

            let counter = accepted.clone();
            let seen = handshakes.clone();
            let task = tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let seen = seen.clone();
                    tokio::spawn(async move {
                        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                        let open = codec::encode_packet(&Packet::open(format!("sid{}", n))).unwrap();
                        ws.send(WsMessage::Text(open)).await.unwrap();

                        while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                            if let Ok(Packet::Event(ev)) = codec::decode_packet(&text) {
                                if ev.event == AUTH_PROXY {
                                    seen.lock().unwrap().push(ev.args[0].clone());
                                    let ack = Packet::ack(ev.ack.unwrap(), vec![json!(accept)]);
                                    let text = codec::encode_packet(&ack).unwrap();
                                    if ws.send(WsMessage::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
            });

            Self {
                address,
                accepted,
                handshakes,
                _task: task,
            }
        }
    }

    fn drain(events: &mut broadcast::Receiver<ProxyEvent>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(match event {
                ProxyEvent::Connect => "connect".to_string(),
                ProxyEvent::Disconnect => "disconnect".to_string(),
                ProxyEvent::Connection(user) => format!("connection:{}", user.id()),
            });
        }
        names
    }

    #[test]
    fn test_set_auth_accepts_string_number_null() {
        let client = ProxyClient::new(ProxyOptions::new("ws://127.0.0.1:1"));
        client.set_auth(&json!("tok")).unwrap();
        assert_eq!(client.options().auth, Some(AuthToken::from("tok")));
        client.set_auth(&json!(12)).unwrap();
        assert_eq!(client.options().auth, Some(AuthToken::from(12i64)));
        client.set_auth(&Value::Null).unwrap();
        assert_eq!(client.options().auth, None);
    }

    #[test]
    fn test_set_auth_rejects_other_types() {
        let client = ProxyClient::new(ProxyOptions::new("ws://127.0.0.1:1").with_auth("keep"));
        for value in [json!(true), json!({}), json!(["a"])] {
            assert!(matches!(
                client.set_auth(&value),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert_eq!(client.options().auth, Some(AuthToken::from("keep")));
    }

    #[test]
    fn test_set_conn_timeout() {
        let client = ProxyClient::new(ProxyOptions::new("ws://127.0.0.1:1"));
        assert_eq!(client.options().conn_timeout, Some(Duration::from_millis(500)));

        client.set_conn_timeout(&json!(10)).unwrap();
        assert_eq!(client.options().conn_timeout, Some(Duration::from_millis(10)));
        client.set_conn_timeout(&Value::Null).unwrap();
        assert_eq!(client.options().conn_timeout, None);

        assert!(client.set_conn_timeout(&json!("10")).is_err());
        assert!(client.set_conn_timeout(&json!(-1)).is_err());
    }

    #[tokio::test]
    async fn test_connect_handshake_fires_connect_once() {
        let relay = FakeRelay::start(true).await;
        let client = ProxyClient::new(ProxyOptions::new(&relay.address).with_auth("tok1"));
        client.set_conn_timeout(&json!(10)).unwrap();
        let mut events = client.subscribe();

        assert!(client.connect().await.unwrap());
        assert!(client.is_connected());
        assert_eq!(client.sid().as_deref(), Some("sid1"));
        assert_eq!(*relay.handshakes.lock().unwrap(), vec![json!("tok1")]);
        assert_eq!(drain(&mut events), vec!["connect"]);
    }

    #[tokio::test]
    async fn test_second_connect_is_noop() {
        let relay = FakeRelay::start(true).await;
        let client = ProxyClient::new(ProxyOptions::new(&relay.address).with_auth(7i64));
        let mut events = client.subscribe();

        assert!(client.connect().await.unwrap());
        assert!(!client.connect().await.unwrap());

        assert_eq!(relay.handshakes.lock().unwrap().len(), 1);
        assert_eq!(relay.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut events), vec!["connect"]);
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let relay = FakeRelay::start(false).await;
        let client = ProxyClient::new(ProxyOptions::new(&relay.address).with_auth("bad"));

        let result = client.connect().await;
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
        assert!(!client.is_connected());
        client.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_resets_and_stops_retrying() {
        let relay = FakeRelay::start(true).await;
        let client = ProxyClient::new(
            ProxyOptions::new(&relay.address).with_conn_timeout(Some(Duration::from_millis(10))),
        );
        let mut events = client.subscribe();

        client.connect().await.unwrap();
        client.disconnect();

        assert!(!client.is_connected());
        assert!(!client.is_enabled());
        assert!(client.is_first_time());
        assert_eq!(client.sid(), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(relay.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut events), vec!["connect", "disconnect"]);

        assert!(client.connect().await.unwrap());
        assert_eq!(relay.accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ProxyClient::new(
            ProxyOptions::new(format!("ws://{}", addr))
                .with_conn_timeout(Some(Duration::from_millis(10)))
                .with_max_delay(Duration::from_millis(20)),
        );

        assert!(matches!(client.connect().await, Err(Error::Connection(_))));
        assert!(client.is_enabled());
        assert!(!client.is_first_time());
        assert!(client.retry_slot().is_some());

        client.disconnect();
        assert!(client.retry_slot().is_none());
    }

    #[tokio::test]
    async fn test_relay_broadcast_requires_connection() {
        let client = ProxyClient::new(ProxyOptions::new("ws://127.0.0.1:1"));
        assert!(!client.to("room").emit("e", vec![]));
    }
}
