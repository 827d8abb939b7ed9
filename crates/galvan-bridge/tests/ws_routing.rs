// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! End-to-end routing tests against a real Bridge on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;

use galvan_bridge::BridgeState;
use galvan_bus::{BusClient, BusConfig};
use galvan_config::{BridgeConfig, Env};
use galvan_proto::{msg, Envelope, BROADCAST};

async fn start_bridge(token: &str) -> String {
    // No on-disk spill from tests.
    let env = Env::from_pairs([("BRIDGE_AUTH_TOKEN", token), ("BRIDGE_EVENT_LOG_PATH", "")]);
    let state = Arc::new(BridgeState::new(BridgeConfig::from_vars(&env)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        galvan_bridge::serve(listener, state).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

fn client(id: &str, url: &str, token: &str) -> (galvan_bus::BusHandle, tokio::sync::mpsc::Receiver<Envelope>) {
    BusClient::spawn(BusConfig::new(id, "test", url, token))
}

async fn recv_kind(
    rx: &mut tokio::sync::mpsc::Receiver<Envelope>,
    kind: &str,
) -> Envelope {
    loop {
        let env = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("ingress closed");
        if env.kind == kind {
            return env;
        }
    }
}

#[tokio::test]
async fn point_to_point_message_reaches_its_target() {
    let url = start_bridge("t0k3n").await;
    let (alpha, _alpha_rx) = client("alpha", &url, "t0k3n");
    let (_beta, mut beta_rx) = client("beta", &url, "t0k3n");
    alpha.wait_connected().await;

    // Give beta a moment to finish its own registration.
    tokio::time::sleep(Duration::from_millis(100)).await;

    alpha
        .send(Envelope::new("alpha", "beta", "ping.test", json!({"n": 1})))
        .await
        .unwrap();

    let env = recv_kind(&mut beta_rx, "ping.test").await;
    assert_eq!(env.source, "alpha");
    assert_eq!(env.payload["n"], 1);
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let url = start_bridge("t0k3n").await;
    let (alpha, mut alpha_rx) = client("alpha", &url, "t0k3n");
    let (_beta, mut beta_rx) = client("beta", &url, "t0k3n");
    let (_gamma, mut gamma_rx) = client("gamma", &url, "t0k3n");
    alpha.wait_connected().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alpha
        .send(Envelope::new("alpha", BROADCAST, "event.test", json!({})))
        .await
        .unwrap();

    recv_kind(&mut beta_rx, "event.test").await;
    recv_kind(&mut gamma_rx, "event.test").await;

    // The sender must not hear its own broadcast.
    let echoed = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Some(env) = alpha_rx.recv().await {
                if env.kind == "event.test" {
                    return;
                }
            }
        }
    })
    .await;
    assert!(echoed.is_err());
}

#[tokio::test]
async fn unreachable_target_yields_undeliverable() {
    let url = start_bridge("t0k3n").await;
    let (alpha, mut alpha_rx) = client("alpha", &url, "t0k3n");
    alpha.wait_connected().await;

    alpha
        .send(Envelope::new("alpha", "nobody", "ping.test", json!({})))
        .await
        .unwrap();

    let notice = recv_kind(&mut alpha_rx, msg::UNDELIVERABLE).await;
    assert_eq!(notice.payload["reason"], "unknown_target");
    assert_eq!(notice.payload["target"], "nobody");
}

#[tokio::test]
async fn wrong_token_is_rejected_at_handshake() {
    let url = start_bridge("right").await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let register = Envelope::new(
        "impostor",
        "bridge",
        msg::COMPONENT_REGISTER,
        json!({"component": "impostor", "version": "0", "token": "wrong"}),
    );
    ws.send(tungstenite::Message::Text(register.encode().unwrap()))
        .await
        .unwrap();

    // The bridge closes without ever sending component.registered.
    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    let env = Envelope::decode(&text).unwrap();
                    assert_ne!(env.kind, msg::COMPONENT_REGISTERED);
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "bridge never closed the unauthorized socket");
}

#[tokio::test]
async fn duplicate_live_id_loses_to_the_incumbent() {
    let url = start_bridge("t0k3n").await;
    let (alpha, _alpha_rx) = client("alpha", &url, "t0k3n");
    let (_beta, mut beta_rx) = client("beta", &url, "t0k3n");
    alpha.wait_connected().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Raw duplicate with the same id: handshake must not complete.
    let (mut dup, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let register = Envelope::new(
        "alpha",
        "bridge",
        msg::COMPONENT_REGISTER,
        json!({"component": "alpha", "version": "0", "token": "t0k3n"}),
    );
    dup.send(tungstenite::Message::Text(register.encode().unwrap()))
        .await
        .unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match dup.next().await {
                Some(Ok(tungstenite::Message::Close(_))) | None => return true,
                Some(Err(_)) => return true,
                _ => {}
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed, "duplicate registration should be closed");

    // The incumbent still routes fine.
    alpha
        .send(Envelope::new("alpha", "beta", "still.alive", json!({})))
        .await
        .unwrap();
    recv_kind(&mut beta_rx, "still.alive").await;
}

#[tokio::test]
async fn version_announce_reaches_existing_components() {
    let url = start_bridge("t0k3n").await;
    let (alpha, mut alpha_rx) = client("alpha", &url, "t0k3n");
    alpha.wait_connected().await;

    let (_beta, _beta_rx) = client("beta", &url, "t0k3n");

    let announce = recv_kind(&mut alpha_rx, msg::VERSION_ANNOUNCE).await;
    assert_eq!(announce.payload["component"], "beta");
}
