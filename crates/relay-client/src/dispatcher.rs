// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

//! Routes local and proxied connections to one application handler and
//! serializes every room delivery through a shared [`DispatchQueue`].

use crate::client::{ProxyClient, ProxyEvent};
use crate::hub::Hub;
use crate::socket::ClientSocket;
use futures::future::BoxFuture;
use relay_core::DispatchQueue;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A target that can fan an event out to a room.
pub trait RoomBroadcast: Send + Sync {
    fn broadcast_room<'a>(
        &'a self,
        room: &'a str,
        event: &'a str,
        args: &'a [Value],
        except: Option<&'a str>,
    ) -> BoxFuture<'a, ()>;
}

impl RoomBroadcast for Hub {
    fn broadcast_room<'a>(
        &'a self,
        room: &'a str,
        event: &'a str,
        args: &'a [Value],
        except: Option<&'a str>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.broadcast(room, event, args.to_vec(), except).await;
        })
    }
}

/// The relay mirror never excludes the originating socket.
impl RoomBroadcast for ProxyClient {
    fn broadcast_room<'a>(
        &'a self,
        room: &'a str,
        event: &'a str,
        args: &'a [Value],
        _except: Option<&'a str>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.to(room).emit(event, args.to_vec()) {
                debug!("Relay mirror of {} to {} skipped: not connected", event, room);
            }
        })
    }
}

/// Delivery helpers bound to one connection.
#[derive(Clone)]
pub struct Delivery {
    queue: DispatchQueue,
    local: Arc<dyn RoomBroadcast>,
    relay: Option<Arc<dyn RoomBroadcast>>,
    socket: ClientSocket,
}

impl Delivery {
    pub fn new(
        queue: DispatchQueue,
        local: Arc<dyn RoomBroadcast>,
        relay: Option<Arc<dyn RoomBroadcast>>,
        socket: ClientSocket,
    ) -> Self {
        Self {
            queue,
            local,
            relay,
            socket,
        }
    }

    /// Broadcasts to `room` locally, then through the relay, as one job.
    pub async fn emit_to(&self, room: &str, event: &str, args: Vec<Value>) {
        self.queue
            .enqueue(self.fan_out(room, event, args, None))
            .await
    }

    /// Like [`emit_to`](Delivery::emit_to) but skips the originating socket.
    /// A proxied origin mirrors through its own facade so the relay can
    /// skip it too.
    pub async fn socket_to(&self, room: &str, event: &str, args: Vec<Value>) {
        let except = self.socket.id().to_string();
        self.queue
            .enqueue(self.fan_out(room, event, args, Some(except.as_str())))
            .await
    }

    /// Queued direct emit to the connecting socket only.
    pub async fn socket_emit(&self, event: &str, args: Vec<Value>) -> bool {
        self.queue
            .enqueue(async move { self.socket.emit(event, args) })
            .await
    }

    pub fn socket(&self) -> &ClientSocket {
        &self.socket
    }

    async fn fan_out(&self, room: &str, event: &str, args: Vec<Value>, except: Option<&str>) {
        self.local.broadcast_room(room, event, &args, except).await;
        let Some(relay) = &self.relay else {
            return;
        };
        match (&self.socket, except) {
            (ClientSocket::Proxy(user), Some(_)) => {
                if !user.to(room).emit(event, args) {
                    debug!("Relay mirror of {} from {} skipped", event, user.id());
                }
            }
            _ => relay.broadcast_room(room, event, &args, except).await,
        }
    }
}

/// What the application handler receives for every new connection.
#[derive(Clone)]
pub struct Connection {
    pub socket: ClientSocket,
    pub delivery: Delivery,
    pub is_proxy: bool,
}

/// Listener tasks feeding a single handler. Dropping the dispatcher stops
/// them.
pub struct Dispatcher {
    queue: DispatchQueue,
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn attach<F, Fut>(hub: Arc<Hub>, proxy: Option<ProxyClient>, handler: F) -> Self
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = DispatchQueue::new();
        let handler = Arc::new(handler);
        let local: Arc<dyn RoomBroadcast> = hub.clone();
        let relay: Option<Arc<dyn RoomBroadcast>> = proxy
            .clone()
            .map(|client| Arc::new(client) as Arc<dyn RoomBroadcast>);

        let mut tasks = Vec::new();

        let mut local_connections = hub.subscribe();
        {
            let queue = queue.clone();
            let local = local.clone();
            let relay = relay.clone();
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match local_connections.recv().await {
                        Ok(socket) => {
                            let socket = ClientSocket::Local(socket);
                            let delivery =
                                Delivery::new(queue.clone(), local.clone(), relay.clone(), socket.clone());
                            tokio::spawn((*handler)(Connection {
                                socket,
                                delivery,
                                is_proxy: false,
                            }));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Dispatcher missed {} local connections", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        if let Some(client) = proxy {
            let mut proxy_events = client.subscribe();
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match proxy_events.recv().await {
                        Ok(ProxyEvent::Connection(user)) => {
                            let socket = ClientSocket::Proxy(user);
                            let delivery =
                                Delivery::new(queue.clone(), local.clone(), relay.clone(), socket.clone());
                            tokio::spawn((*handler)(Connection {
                                socket,
                                delivery,
                                is_proxy: true,
                            }));
                        }
                        Ok(ProxyEvent::Connect) => info!("Relay link up"),
                        Ok(ProxyEvent::Disconnect) => info!("Relay link down"),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Dispatcher missed {} proxy events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        Self { queue, tasks }
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
