// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The bus connection task: one WebSocket to the Bridge, kept alive.
//!
//! ```text
//! component code ──► BusHandle::send / request ──► mpsc ──┐
//!                                                         ▼
//!                                              connection task ◄──► Bridge (ws)
//!                                                         │
//!          tracked replies → CorrelationMap ◄─────────────┤
//!          everything else → ingress mpsc  ◄──────────────┘
//! ```
//!
//! The task reconnects with capped exponential backoff (plus jitter so a
//! restarted Bridge is not hit by every component on the same tick) and
//! re-registers after every reconnect. Handlers never see transport frames;
//! they see [`Envelope`]s on the ingress channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::Message;
use uuid::Uuid;

use galvan_config::ReconnectConfig;
use galvan_proto::{msg, Envelope, HEARTBEAT_INTERVAL_SECS};

use crate::correlation::CorrelationMap;

/// How the client reaches and identifies itself to the Bridge.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub component_id: String,
    pub version: String,
    pub bridge_url: String,
    pub auth_token: String,
    pub reconnect: ReconnectConfig,
}

impl BusConfig {
    pub fn new(
        component_id: impl Into<String>,
        version: impl Into<String>,
        bridge_url: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            version: version.into(),
            bridge_url: bridge_url.into(),
            auth_token: auth_token.into(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection task has shut down")]
    Closed,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Cheap-to-clone handle to the connection task.
#[derive(Clone)]
pub struct BusHandle {
    component_id: String,
    out_tx: mpsc::Sender<Envelope>,
    correlations: Arc<CorrelationMap>,
    connected: watch::Receiver<bool>,
}

impl BusHandle {
    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Queue an envelope for delivery. Fails only when the connection task
    /// is gone; a temporarily-down link buffers until reconnect.
    pub async fn send(&self, env: Envelope) -> Result<(), BusError> {
        self.out_tx.send(env).await.map_err(|_| BusError::Closed)
    }

    /// Send a request and await the reply carrying `correlation_id ==
    /// request.id`. On deadline elapse the slot is purged so a late reply
    /// is discarded, never delivered.
    pub async fn request(&self, env: Envelope, timeout: Duration) -> Result<Envelope, BusError> {
        let request_id = env.id;
        let rx = self
            .correlations
            .register(request_id, Instant::now() + timeout);
        self.send(env).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.correlations.purge(request_id);
                Err(BusError::Timeout(timeout))
            }
        }
    }

    /// Build and send a reply to `request`.
    pub async fn reply(
        &self,
        request: &Envelope,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        self.send(request.reply(self.component_id.clone(), kind, payload))
            .await
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolve once the link is up (used by startup sequencing and tests).
    pub async fn wait_connected(&self) {
        let mut rx = self.connected.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Late/duplicate replies discarded so far.
    pub fn discarded_replies(&self) -> u64 {
        self.correlations.discarded()
    }
}

/// The connection task itself. Construct with [`BusClient::spawn`].
pub struct BusClient;

impl BusClient {
    /// Spawn the connection task; returns the handle plus the ingress
    /// channel carrying every non-reply message addressed to us.
    pub fn spawn(config: BusConfig) -> (BusHandle, mpsc::Receiver<Envelope>) {
        let (out_tx, out_rx) = mpsc::channel::<Envelope>(256);
        let (in_tx, in_rx) = mpsc::channel::<Envelope>(256);
        let (conn_tx, conn_rx) = watch::channel(false);
        let correlations = Arc::new(CorrelationMap::new());

        let handle = BusHandle {
            component_id: config.component_id.clone(),
            out_tx,
            correlations: correlations.clone(),
            connected: conn_rx,
        };

        tokio::spawn(run(config, out_rx, in_tx, conn_tx, correlations));

        (handle, in_rx)
    }
}

async fn run(
    config: BusConfig,
    mut out_rx: mpsc::Receiver<Envelope>,
    in_tx: mpsc::Sender<Envelope>,
    conn_tx: watch::Sender<bool>,
    correlations: Arc<CorrelationMap>,
) {
    let mut attempt: u32 = 0;

    loop {
        match connect_and_serve(&config, &mut out_rx, &in_tx, &conn_tx, &correlations).await {
            Ok(()) => {
                // Outbound channel closed: the component is shutting down.
                info!(component = %config.component_id, "bus client stopped");
                return;
            }
            Err(e) => {
                let _ = conn_tx.send(false);
                attempt += 1;
                if config.reconnect.max_attempts > 0 && attempt > config.reconnect.max_attempts {
                    warn!(
                        component = %config.component_id,
                        attempts = attempt,
                        "giving up on bridge reconnect: {e}"
                    );
                    return;
                }
                let delay = backoff_delay(&config.reconnect, attempt);
                warn!(
                    component = %config.component_id,
                    ?delay,
                    "bridge connection lost ({e}), reconnecting"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One connection lifetime: register, then pump frames until the link or
/// the outbound channel dies. `Ok(())` means clean shutdown.
async fn connect_and_serve(
    config: &BusConfig,
    out_rx: &mut mpsc::Receiver<Envelope>,
    in_tx: &mpsc::Sender<Envelope>,
    conn_tx: &watch::Sender<bool>,
    correlations: &CorrelationMap,
) -> Result<(), String> {
    let (mut ws, _) = connect_async(&config.bridge_url)
        .await
        .map_err(|e| format!("connect: {e}"))?;

    let register = Envelope::new(
        config.component_id.clone(),
        "bridge",
        msg::COMPONENT_REGISTER,
        serde_json::json!({
            "component": config.component_id,
            "version": config.version,
            "token": config.auth_token,
        }),
    );
    let frame = register.encode().map_err(|e| format!("encode: {e}"))?;
    ws.send(Message::Text(frame))
        .await
        .map_err(|e| format!("register send: {e}"))?;

    let _ = conn_tx.send(true);
    info!(component = %config.component_id, url = %config.bridge_url, "registered on bus");

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));

    loop {
        tokio::select! {
            // Outbound from the component.
            out = out_rx.recv() => {
                let Some(env) = out else { return Ok(()) };
                match env.encode() {
                    Ok(text) => ws
                        .send(Message::Text(text))
                        .await
                        .map_err(|e| format!("send: {e}"))?,
                    Err(e) => warn!("dropping unencodable envelope: {e}"),
                }
            }
            // Inbound from the Bridge.
            frame = ws.next() => {
                let frame = frame.ok_or_else(|| "stream closed".to_string())?;
                let frame = frame.map_err(|e| format!("recv: {e}"))?;
                match frame {
                    Message::Text(text) => match Envelope::decode(&text) {
                        Ok(env) => dispatch_inbound(env, in_tx, correlations).await,
                        Err(e) => warn!("unparseable frame from bridge: {e}"),
                    },
                    Message::Ping(data) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Message::Close(reason) => {
                        return Err(format!("bridge closed connection: {reason:?}"));
                    }
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                let beat = Envelope::new(
                    config.component_id.clone(),
                    "bridge",
                    msg::COMPONENT_HEARTBEAT,
                    serde_json::json!({}),
                );
                if let Ok(text) = beat.encode() {
                    ws.send(Message::Text(text))
                        .await
                        .map_err(|e| format!("heartbeat: {e}"))?;
                }
            }
            _ = sweep.tick() => {
                let swept = correlations.sweep(Instant::now());
                if swept > 0 {
                    debug!(swept, "purged expired correlation slots");
                }
            }
        }
    }
}

/// Replies go to their correlation slot. Unclaimed correlated traffic
/// (derived events, late replies whose slot is purged) flows to the ingress
/// channel; the original requester never sees a late reply because its slot
/// is gone, and the map counts the miss.
async fn dispatch_inbound(
    env: Envelope,
    in_tx: &mpsc::Sender<Envelope>,
    correlations: &CorrelationMap,
) {
    if let Some(correlation_id) = env.correlation_id {
        if correlations.complete(correlation_id, env.clone()) {
            return;
        }
        // Correlated but unclaimed: either a late reply (drop) or a derived
        // event the component wants to observe. Derived events are regular
        // traffic, so forward them; the map already counted the miss.
    }
    if in_tx.send(env).await.is_err() {
        debug!("ingress receiver dropped, discarding inbound message");
    }
}

/// Exponential backoff with ±25% jitter, capped.
fn backoff_delay(reconnect: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = reconnect
        .initial_delay
        .saturating_mul(2u32.saturating_pow(exp))
        .min(reconnect.max_delay);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    base.mul_f64(jitter).min(reconnect.max_delay)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
