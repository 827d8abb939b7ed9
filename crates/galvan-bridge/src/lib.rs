// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The Bridge — sole trusted router of the galvan cluster.
//!
//! Components connect over `/ws`, authenticate with the shared token, and
//! from then on every frame they send is routed point-to-point or broadcast
//! by the [`router::Router`]. The Bridge also keeps the bounded event log,
//! enforces heartbeat liveness, and serves the small HTTP surface
//! (`/health`, `/events`, `/screenshots`).
//!
//! The Bridge never retries delivery: an unreachable target produces an
//! `undeliverable` event back at the sender, a backpressured consumer is
//! dropped with `slow_consumer`, and the sender decides what to do next.

pub mod event_log;
pub mod http;
pub mod router;
pub mod server;
pub mod token;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use galvan_config::BridgeConfig;

pub use server::BridgeState;

/// Run a Bridge until the process is stopped.
pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let port = config.common.bridge_port();
    let state = Arc::new(BridgeState::new(config));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(%port, "bridge listening");
    serve(listener, state).await
}

/// Serve on an already-bound listener (tests bind port 0 and read the
/// ephemeral address back).
pub async fn serve(listener: TcpListener, state: Arc<BridgeState>) -> anyhow::Result<()> {
    server::spawn_spill_writer(&state);
    tokio::spawn(server::liveness_sweeper(state.clone()));
    let app = server::build_app(state);
    axum::serve(listener, app).await?;
    Ok(())
}
