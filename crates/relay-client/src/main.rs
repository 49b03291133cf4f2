// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use relay_client::config::Config;
use relay_client::{chat, Dispatcher, Hub, ProxyClient, ProxyOptions};

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "relay-client")]
#[command(about = "Chat server mirrored through a socket relay", version)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config)?;

    tracing::info!("Starting chat server on port {}", config.hub.port);

    let hub = Hub::new();
    let proxy = if config.has_relay() {
        tracing::info!("Relay: {}", config.relay.address);
        Some(ProxyClient::new(ProxyOptions::from_config(&config)))
    } else {
        None
    };

    let _dispatcher = Dispatcher::attach(hub.clone(), proxy.clone(), chat::room_chat);

    if let Some(client) = &proxy {
        if let Err(e) = client.connect().await {
            tracing::warn!("Initial relay connection failed, retrying: {}", e);
        }
    }

    let served = hub.serve(config.hub.port).await;
    if let Some(client) = &proxy {
        client.disconnect();
    }
    served
}
