// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The Doctor — planner, scheduler, failure analyzer, tool-creation
//! coordinator.
//!
//! ```text
//!  POST /plan ──► compiler / branching ──► scheduler.admit ──► plan.submit
//!                                                                  │
//!  step.failed ◄────────────────────────────── Igor progress ◄─────┘
//!      │
//!      ▼ pattern threshold
//!  tool.create ──► Frank ──► tool.created ──► restart Frank ──► retry plan
//! ```
//!
//! State lives in [`scheduler::DoctorState`] behind one mutex per
//! collection; the bus dispatcher ([`service::DoctorService`]) and the
//! HTTP API ([`http`]) are both thin layers over it.

pub mod branching;
pub mod compiler;
pub mod failure;
pub mod http;
pub mod persist;
pub mod restart;
pub mod scheduler;
pub mod service;
pub mod toolbag;
pub mod toolgen;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use galvan_bus::{BusClient, BusConfig};
use galvan_config::DoctorConfig;

use crate::persist::PlanStore;
use crate::scheduler::DoctorState;
use crate::service::DoctorService;

pub const COMPONENT_ID: &str = "doctor";

/// Run a Doctor until the process is stopped.
pub async fn run(config: DoctorConfig) -> anyhow::Result<()> {
    let bus_config = BusConfig::new(
        COMPONENT_ID,
        env!("CARGO_PKG_VERSION"),
        config.common.bridge_url.clone(),
        config.common.auth_token.clone(),
    )
    .with_reconnect(config.reconnect.clone());
    let (bus, mut ingress) = BusClient::spawn(bus_config);

    let store = Arc::new(PlanStore::new(&config.experience_dir));
    let state = Arc::new(DoctorState::new(config.clone()));

    // Crash recovery: reload plan snapshots so /plans and the TTL sweeper
    // see what the previous process knew. Non-terminal plans from before
    // the crash are marked failed — their workers are gone.
    let recovered = store.load_all().await;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "recovered plan snapshots");
        let mut plans = state.plans.lock().expect("plan table poisoned");
        for mut plan_state in recovered {
            if !plan_state.status.is_terminal() {
                let _ = plan_state.transition(galvan_proto::PlanStatus::Executing);
                let _ = plan_state.transition(galvan_proto::PlanStatus::Failed);
                plan_state
                    .errors
                    .push(galvan_proto::Fault::new(
                        galvan_proto::FaultKind::WorkerCrashed,
                        "doctor restarted mid-plan",
                    ));
            }
            plans.insert(plan_state.plan.id, plan_state);
        }
    }

    let service = Arc::new(DoctorService::new(state.clone(), bus));

    // Initial dynamic-tool sync, best-effort: frank may simply not be up
    // yet, in which case the post-restart resync will catch up.
    {
        let state = state.clone();
        let frank_url = config.frank_url.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let response = client
                .get(format!("{frank_url}/tools"))
                .timeout(std::time::Duration::from_secs(5))
                .send()
                .await;
            let Ok(response) = response else { return };
            let Ok(body) = response.json::<serde_json::Value>().await else { return };
            if let Ok(tools) = serde_json::from_value(body["tools"].clone()) {
                let mut cache = state.dynamic_tools.lock().expect("tool cache poisoned");
                *cache = tools;
                info!(tools = cache.len(), "dynamic tool inventory synced");
            }
        });
    }

    // TTL sweeper for terminal plans and their snapshots.
    {
        let state = state.clone();
        let store = store.clone();
        let interval = config.plan_cleanup_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let before: Vec<uuid::Uuid> = {
                    let plans = state.plans.lock().expect("plan table poisoned");
                    plans.keys().copied().collect()
                };
                let evicted = state.evict_expired();
                if evicted > 0 {
                    let after: std::collections::HashSet<uuid::Uuid> = {
                        let plans = state.plans.lock().expect("plan table poisoned");
                        plans.keys().copied().collect()
                    };
                    for plan_id in before.into_iter().filter(|id| !after.contains(id)) {
                        store.remove(plan_id).await;
                    }
                    info!(evicted, "expired plans evicted");
                }
            }
        });
    }

    // HTTP API.
    let http_state = Arc::new(http::HttpState::new(service.clone(), store));
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "doctor http listening");
    let app = http::build_app(http_state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("doctor http server stopped: {e}");
        }
    });

    // Bus ingress: handlers for distinct messages run concurrently; the
    // per-collection locks in DoctorState serialize what must serialize.
    while let Some(env) = ingress.recv().await {
        let service = service.clone();
        tokio::spawn(async move {
            service.handle(env).await;
        });
    }
    Ok(())
}
