// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Igor — the worker that actually walks a plan.
//!
//! An Igor registers on the bus, waits for `plan.submit`, and executes the
//! plan step by step against Frankenstein's browser surface, reporting
//! `step.started` / `step.completed` / `step.failed` / `step.retrying`
//! along the way. Failed steps are retried with exponential backoff and,
//! when the tool bag offers something applicable, one Frank dynamic-tool
//! repair attempt per failure.
//!
//! Strictly one plan at a time. Route-specialized Igors (`igor-<route>`)
//! accept only plans bound to their route; the default Igor takes anything.

pub mod executor;
pub mod service;
pub mod steps;

use std::sync::Arc;

use tracing::info;

use galvan_bus::{BusClient, BusConfig};
use galvan_config::IgorConfig;

use crate::service::IgorService;

/// Run an Igor until the process is stopped.
pub async fn run(config: IgorConfig) -> anyhow::Result<()> {
    let id = config.component_id();
    let bus_config = BusConfig::new(
        id.clone(),
        env!("CARGO_PKG_VERSION"),
        config.common.bridge_url.clone(),
        config.common.auth_token.clone(),
    )
    .with_reconnect(config.reconnect.clone());
    let (bus, mut ingress) = BusClient::spawn(bus_config);

    let service = Arc::new(IgorService::new(id.clone(), config.route.clone(), bus));
    info!(%id, route = ?config.route, "igor ready");

    while let Some(env) = ingress.recv().await {
        // plan.cancel must be able to overtake a running plan.submit
        // handler, so each message is processed on its own task; the
        // service's own state lock keeps plan admission serialized.
        let service = service.clone();
        tokio::spawn(async move {
            service.handle(env).await;
        });
    }
    Ok(())
}
