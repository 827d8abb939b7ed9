// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Frank's HTTP surface: health plus tool CRUD for operators and the
//! Doctor's restart coordinator.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use galvan_proto::{Fault, FaultKind};

use crate::service::FrankService;
use crate::tools::ToolCtx;

pub fn build_app(service: Arc<FrankService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools).post(create_tool))
        .route("/tools/igorify-candidates", get(igorify_candidates))
        .route("/tools/:id/invoke", post(invoke_tool))
        .route("/tools/:id/export", post(export_tool))
        .route("/tools/:id", delete(delete_tool))
        .with_state(service)
}

/// GET /health — the restart coordinator polls this for bus connectivity.
async fn health(State(service): State<Arc<FrankService>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": service.started_at.elapsed().as_secs(),
        "pid": std::process::id(),
        "busConnected": service.bus.is_connected(),
        "browsers": {
            "open": service.pool.session_count().await,
            "max": service.config.max_browsers,
            "maxPages": service.config.max_pages,
            "idleTimeoutMs": service.config.browser_idle_timeout.as_millis() as u64,
        },
        "tools": service.registry.len(),
    }))
}

async fn list_tools(State(service): State<Arc<FrankService>>) -> impl IntoResponse {
    Json(json!({"tools": service.registry.list()}))
}

async fn igorify_candidates(State(service): State<Arc<FrankService>>) -> impl IntoResponse {
    Json(json!({"candidates": service.registry.igorify_candidates()}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateToolBody {
    name: String,
    #[serde(default)]
    description: String,
    code: Value,
    #[serde(default)]
    input_schema: Option<Value>,
    #[serde(default)]
    author: Option<String>,
}

async fn create_tool(
    State(service): State<Arc<FrankService>>,
    Json(body): Json<CreateToolBody>,
) -> impl IntoResponse {
    let result = service.registry.create(
        &body.name,
        &body.description,
        body.code,
        body.input_schema.unwrap_or(json!({"type": "object"})),
        body.author.as_deref().unwrap_or("http"),
    );
    match result {
        Ok(record) => (StatusCode::CREATED, Json(json!({"tool": record}))).into_response(),
        Err(fault) => fault_response(fault),
    }
}

async fn invoke_tool(
    State(service): State<Arc<FrankService>>,
    Path(id): Path<String>,
    Json(params): Json<Value>,
) -> impl IntoResponse {
    let params: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
    let ctx = ToolCtx::new(
        id.clone(),
        None,
        service.config.tool_timeout.min(Duration::from_secs(300)),
        service.pool.clone(),
    );
    match service.registry.invoke(&id, params, ctx).await {
        Ok(result) => Json(json!({"ok": true, "result": result})).into_response(),
        Err(fault) => fault_response(fault),
    }
}

async fn export_tool(
    State(service): State<Arc<FrankService>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match service.registry.export(&id) {
        Ok(artifact) => Json(json!({"ok": true, "artifact": artifact})).into_response(),
        Err(fault) => fault_response(fault),
    }
}

async fn delete_tool(
    State(service): State<Arc<FrankService>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match service.registry.delete(&id) {
        Ok(record) => Json(json!({"ok": true, "name": record.name})).into_response(),
        Err(fault) => fault_response(fault),
    }
}

fn fault_response(fault: Fault) -> axum::response::Response {
    let status = match fault.kind {
        FaultKind::ValidationFailed | FaultKind::ToolCompileFailed => StatusCode::BAD_REQUEST,
        FaultKind::ToolNotFound => StatusCode::NOT_FOUND,
        FaultKind::ToolTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"ok": false, "error": fault}))).into_response()
}
