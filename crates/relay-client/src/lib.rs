// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

pub mod chat;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod hub;
pub mod pending;
pub mod reconnect;
pub mod socket;
pub mod user;

pub use client::{ProxyClient, ProxyEvent, ProxyOptions};
pub use dispatcher::{Connection, Delivery, Dispatcher, RoomBroadcast};
pub use hub::{Hub, LocalSocket};
pub use socket::{ClientSocket, EventOrigin, SocketEvent};
pub use user::ProxyUser;
