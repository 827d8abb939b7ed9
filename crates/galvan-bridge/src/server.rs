// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! WebSocket endpoint and connection lifecycle.
//!
//! A component's connection goes through three phases:
//!
//! 1. **Handshake** — the first frame must be a `component.register`
//!    envelope carrying id, version and the shared token, within 5 s.
//!    Bad token or a live duplicate id closes the socket immediately
//!    (the incumbent wins).
//! 2. **Accepted** — the Bridge replies `component.registered`, announces
//!    `version.announce` to everyone else, and spawns a writer task
//!    draining the connection's bounded outbound queue.
//! 3. **Pumping** — inbound frames are heartbeats or routed messages until
//!    the channel closes or the heartbeat sweeper reaps the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router as AxumRouter,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use galvan_config::BridgeConfig;
use galvan_proto::{msg, Envelope, HEARTBEAT_INTERVAL_SECS};

use crate::http;
use crate::router::{RegisterReject, Router};
use crate::token::AuthToken;

/// Everything the handlers share.
pub struct BridgeState {
    pub router: Router,
    pub token: AuthToken,
    pub config: BridgeConfig,
    pub started_at: std::time::Instant,
    /// Receiver half of the event spill, taken by [`spawn_spill_writer`].
    spill_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<crate::event_log::EventRecord>>>,
}

impl BridgeState {
    pub fn new(config: BridgeConfig) -> Self {
        let mut router = Router::new(config.event_log_cap);
        let mut spill_rx = None;
        if config.event_log_path.is_some() {
            let (tx, rx) = mpsc::unbounded_channel();
            router = router.with_spill(tx);
            spill_rx = Some(rx);
        }
        Self {
            router,
            token: AuthToken::new(&config.common.auth_token),
            started_at: std::time::Instant::now(),
            spill_rx: std::sync::Mutex::new(spill_rx),
            config,
        }
    }
}

/// Start the on-disk event-log writer, if configured. Idempotent: the
/// receiver is consumed on the first call.
pub fn spawn_spill_writer(state: &BridgeState) {
    let rx = state.spill_rx.lock().expect("spill slot poisoned").take();
    if let (Some(rx), Some(path)) = (rx, state.config.event_log_path.clone()) {
        tokio::spawn(crate::event_log::spill_writer(rx, path));
    }
}

/// Assemble the axum app: the ws endpoint plus the HTTP surface.
pub fn build_app(state: Arc<BridgeState>) -> AxumRouter {
    AxumRouter::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(http::health))
        .route("/events", get(http::events))
        .route("/screenshots", axum::routing::post(http::screenshots))
        .with_state(state)
}

/// Periodically reap connections whose heartbeat fell outside the window.
pub async fn liveness_sweeper(state: Arc<BridgeState>) {
    let mut tick = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    loop {
        tick.tick().await;
        for id in state.router.sweep_stale() {
            debug!(%id, "reaped by liveness sweeper");
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<BridgeState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<BridgeState>) {
    // ── Handshake ─────────────────────────────────────────────────────────────
    let register = match read_register(&mut socket).await {
        Some(env) => env,
        None => {
            let _ = socket.close().await;
            return;
        }
    };

    let id = register.payload["component"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let version = register.payload["version"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let token = register.payload["token"].as_str().unwrap_or_default();

    if id.is_empty() || !state.token.verify(token) {
        warn!(component = %id, "registration rejected: bad token");
        let _ = socket.close().await;
        return;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(state.config.outbound_queue_depth);
    let out_tx_tag = out_tx.clone();
    match state.router.register(&id, &version, out_tx) {
        Ok(()) => {}
        Err(RegisterReject::DuplicateLive) => {
            warn!(component = %id, "registration rejected: live duplicate, incumbent wins");
            let _ = socket.close().await;
            return;
        }
        Err(RegisterReject::BadToken) => {
            let _ = socket.close().await;
            return;
        }
    }
    info!(component = %id, %version, "component registered");

    // ── Accepted ──────────────────────────────────────────────────────────────
    let accepted = register.reply("bridge", msg::COMPONENT_REGISTERED, json!({"ok": true}));
    state.router.deliver_from_bridge(accepted);

    let announce = Envelope::new(
        "bridge",
        galvan_proto::BROADCAST,
        msg::VERSION_ANNOUNCE,
        json!({"component": id, "version": version}),
    );
    state.router.announce(announce, &id);

    let (mut sink, mut stream) = socket.split();

    // Single writer per connection: preserves per-sender delivery order.
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(env) = out_rx.recv().await {
            match env.encode() {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(component = %writer_id, "unencodable outbound envelope: {e}"),
            }
        }
        let _ = sink.close().await;
    });

    // ── Pumping ───────────────────────────────────────────────────────────────
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(component = %id, "ws recv error: {e}");
                break;
            }
        };
        match frame {
            Message::Text(text) => match Envelope::decode(&text) {
                Ok(env) => {
                    if env.kind == msg::COMPONENT_HEARTBEAT {
                        state.router.heartbeat(&id);
                    } else if env.source != id {
                        // A component may only speak as itself.
                        warn!(component = %id, claimed = %env.source, "source spoofing, frame dropped");
                    } else {
                        state.router.route(env);
                    }
                }
                Err(e) => warn!(component = %id, "unparseable frame: {e}"),
            },
            Message::Close(_) => break,
            // axum answers pings at the protocol layer.
            _ => {}
        }
    }

    state.router.disconnect_if_current(&id, &out_tx_tag);
    writer.abort();
}

/// Read the registration envelope, enforcing the handshake deadline.
async fn read_register(socket: &mut WebSocket) -> Option<Envelope> {
    let deadline = Duration::from_secs(5);
    let frame = tokio::time::timeout(deadline, socket.recv()).await.ok()??;
    let text = match frame.ok()? {
        Message::Text(text) => text,
        _ => return None,
    };
    let env = Envelope::decode(&text).ok()?;
    if env.kind != msg::COMPONENT_REGISTER {
        warn!(kind = %env.kind, "first frame was not component.register");
        return None;
    }
    Some(env)
}
