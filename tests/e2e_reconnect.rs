// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

mod common;

use common::{wait_until, TestEnvironment, TestSocket, STEP_TIMEOUT};
use relay_client::{ProxyClient, ProxyEvent};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_event(events: &mut broadcast::Receiver<ProxyEvent>) -> ProxyEvent {
    tokio::time::timeout(STEP_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for proxy event")
        .expect("proxy events closed")
}

#[tokio::test]
async fn test_reconnects_after_relay_restart() {
    let mut env = TestEnvironment::new().await;
    let client = ProxyClient::new(env.proxy_options());
    let mut events = client.subscribe();

    assert!(client.connect().await.unwrap());
    assert!(matches!(next_event(&mut events).await, ProxyEvent::Connect));
    let first_sid = client.sid().unwrap();

    let _socket = TestSocket::connect(&env.relay_url("socket")).await;
    let ProxyEvent::Connection(user) = next_event(&mut events).await else {
        panic!("expected proxied connection");
    };
    let mut user_events = user.subscribe();

    env.restart_relay().await;

    assert!(matches!(next_event(&mut events).await, ProxyEvent::Disconnect));
    let gone = tokio::time::timeout(STEP_TIMEOUT, user_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gone.name, "disconnect");
    assert_eq!(gone.args, vec![json!("transport close")]);
    assert!(user.is_disconnected());

    assert!(matches!(next_event(&mut events).await, ProxyEvent::Connect));
    assert!(client.is_connected());
    assert_ne!(client.sid().unwrap(), first_sid);
    assert_eq!(env.relay.registry().link_count().await, 1);

    client.disconnect();
}

#[tokio::test]
async fn test_no_retry_after_disconnect() {
    let mut env = TestEnvironment::new().await;
    let client = env.connected_proxy().await;

    client.disconnect();
    assert!(client.is_first_time());
    assert!(!client.is_enabled());

    env.restart_relay().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!client.is_connected());
    assert_eq!(env.relay.registry().link_count().await, 0);
}

#[tokio::test]
async fn test_initial_failure_keeps_retrying_until_relay_is_up() {
    let mut env = TestEnvironment::new().await;
    env.relay.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = ProxyClient::new(env.proxy_options());
    assert!(client.connect().await.is_err());
    assert!(client.is_enabled());
    assert!(!client.is_first_time());

    env.restart_relay().await;

    let client_ref = &client;
    assert!(wait_until(move || async move { client_ref.is_connected() }).await);
    client.disconnect();
}
