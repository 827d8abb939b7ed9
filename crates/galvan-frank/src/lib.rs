// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Frankenstein — the browser and dynamic-tool host.
//!
//! Frank owns three things:
//!
//! - the **browser surface**: `browser.*` bus handlers over a
//!   [`driver::BrowserDriver`] seam (the actual driver is pluggable; the
//!   in-tree [`driver::ScriptedDriver`] backs tests and local runs),
//! - the **dynamic tool registry**: declarative tool programs compiled at
//!   registration, invoked under a hard timeout against a fixed capability
//!   surface ([`tools::ToolCtx`]),
//! - **system tool detection**: host automation binaries probed at startup
//!   and exposed as ordinary dynamic tools.
//!
//! Tool code is untrusted. It is never source text here — it is a
//! declarative program interpreted by [`tools::spec`], which can touch
//! nothing beyond the `ToolCtx` it is handed.

pub mod browser;
pub mod driver;
pub mod http;
pub mod service;
pub mod system;
pub mod tools;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use galvan_bus::{BusClient, BusConfig};
use galvan_config::FrankConfig;

use crate::driver::ScriptedFactory;
use crate::service::FrankService;

pub const COMPONENT_ID: &str = "frank";

/// Run a Frankenstein until the process is stopped (or a `shutdown`
/// message arrives on the bus).
pub async fn run(config: FrankConfig) -> anyhow::Result<()> {
    run_with_factory(config, Arc::new(ScriptedFactory::default())).await
}

/// Entry point with an explicit driver factory — the seam real browser
/// drivers plug into.
pub async fn run_with_factory(
    config: FrankConfig,
    factory: Arc<dyn driver::DriverFactory>,
) -> anyhow::Result<()> {
    let bus_config = BusConfig::new(
        COMPONENT_ID,
        env!("CARGO_PKG_VERSION"),
        config.common.bridge_url.clone(),
        config.common.auth_token.clone(),
    )
    .with_reconnect(config.reconnect.clone());
    let (bus, mut ingress) = BusClient::spawn(bus_config);

    let service = Arc::new(FrankService::new(config.clone(), bus.clone(), factory));

    let registered = system::register_system_tools(&service.registry).await;
    info!(tools = registered, "system tools registered");

    tokio::spawn(browser::idle_sweeper(service.pool.clone()));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "frank http listening");
    let app = http::build_app(service.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("frank http server stopped: {e}");
        }
    });

    // Ingress loop: handlers for distinct messages run concurrently.
    while let Some(env) = ingress.recv().await {
        let service = service.clone();
        tokio::spawn(async move {
            service.handle(env).await;
        });
    }
    Ok(())
}
